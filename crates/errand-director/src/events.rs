//! Progress events emitted while an errand runs.
//!
//! The director does not interpret events; it hands them to an
//! [`EventSink`] supplied by the caller.

use std::fmt;

use serde::Serialize;
use tracing::info;

/// State of one stage step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Started,
    Finished,
    Failed,
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventState::Started => "started",
            EventState::Finished => "finished",
            EventState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A structured progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    /// Stage name, e.g. "Preparing deployment".
    pub stage: String,
    /// The subject of the stage (usually a job or instance name).
    pub task: String,
    pub state: EventState,
    /// Error text for failed steps.
    pub detail: Option<String>,
}

impl Event {
    pub fn new(stage: &str, task: &str, state: EventState) -> Self {
        Self {
            stage: stage.to_string(),
            task: task.to_string(),
            state,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Destination for progress events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

/// Forwards events to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: Event) {
        match &event.detail {
            Some(detail) => info!(
                stage = %event.stage,
                task = %event.task,
                state = %event.state,
                %detail,
                "event"
            ),
            None => info!(
                stage = %event.stage,
                task = %event.task,
                state = %event.state,
                "event"
            ),
        }
    }
}
