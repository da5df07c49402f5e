use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::DomainResult;

use super::types::ExportJob;

/// Events the pipeline emits toward the host's notification layer.
#[derive(Debug, Clone)]
pub enum ExportEvent {
    Completed {
        export: ExportJob,
        title: String,
        body: String,
    },
}

/// Sink the host wires notification delivery into.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn dispatch(&self, event: ExportEvent) -> DomainResult<()>;
}

/// Sink that drops every event.
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn dispatch(&self, _event: ExportEvent) -> DomainResult<()> {
        Ok(())
    }
}

/// Sink forwarding events into an unbounded channel.
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<ExportEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExportEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn dispatch(&self, event: ExportEvent) -> DomainResult<()> {
        // A closed receiver just means nobody is listening anymore.
        let _ = self.sender.send(event);
        Ok(())
    }
}
