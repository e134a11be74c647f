//! Observability events.
//!
//! Sinks receive every state transition of an execution. Publishing is
//! fire-and-forget: a failing sink is logged and never aborts execution.

use crate::{Error, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use storage::{Event, EventKind, EventStore, ExecutionId};
use tokio::sync::mpsc;
use tracing::warn;

/// Destination for execution events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &Event) -> Result<()>;
}

impl EventSink for EventStore {
    fn publish(&self, event: &Event) -> Result<()> {
        self.append(event).map_err(Error::from)
    }
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn publish(&self, event: &Event) -> Result<()> {
        (**self).publish(event)
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: &Event) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| Error::Sink("memory sink lock poisoned".into()))?;
        events.push(event.clone());
        Ok(())
    }
}

/// Forwards events to a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: &Event) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| Error::Sink("event receiver dropped".into()))
    }
}

/// Stamps events for one execution and sends them to the optional sink.
pub(crate) struct Emitter<'a> {
    sink: Option<&'a dyn EventSink>,
    execution_id: ExecutionId,
    function_id: &'a str,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(sink: Option<&'a dyn EventSink>, execution_id: ExecutionId, function_id: &'a str) -> Self {
        Self {
            sink,
            execution_id,
            function_id,
        }
    }

    pub(crate) fn emit(&self, kind: EventKind, data: Value) {
        let Some(sink) = self.sink else {
            return;
        };
        let event = Event::new(self.execution_id, kind)
            .with_function(self.function_id)
            .with_data(data);
        if let Err(error) = sink.publish(&event) {
            warn!(event = %kind, error = %error, "event sink publish failed");
        }
    }
}
