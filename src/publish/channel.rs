use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{EventSink, IngestionEvent};
use crate::error::PublishError;

/// Hands events to an in-process consumer. The send completing is the ack.
pub struct ChannelSink {
    tx: mpsc::Sender<IngestionEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<IngestionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn deliver(&self, event: &IngestionEvent) -> Result<(), PublishError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| PublishError::Closed)
    }
}
