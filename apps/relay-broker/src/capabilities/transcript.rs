use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::capability::{Capability, Topic};
use crate::collaborator::Collaborator;
use crate::heartbeat::DeviceType;
use crate::session::SessionContext;

/// Topic collaborators answer on when a transcript result names none.
pub const SENTIMENT_TOPIC: &str = "text_sentiment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranscriptTopic {
    Transcript,
}

impl Topic for TranscriptTopic {
    const ALL: &'static [Self] = &[TranscriptTopic::Transcript];

    fn as_str(self) -> &'static str {
        "text_transcript"
    }
}

/// Passes every transcript line to the collaborator and republishes its
/// verdicts.
pub struct TranscriptAnalysis {
    collaborator: Arc<dyn Collaborator>,
}

impl TranscriptAnalysis {
    pub fn new(collaborator: Arc<dyn Collaborator>) -> Self {
        Self { collaborator }
    }
}

#[async_trait]
impl Capability for TranscriptAnalysis {
    type Topic = TranscriptTopic;

    fn device_type(&self) -> DeviceType {
        DeviceType::Mic
    }

    async fn handle(
        self: Arc<Self>,
        ctx: SessionContext,
        _topic: TranscriptTopic,
        payload: Bytes,
    ) -> anyhow::Result<()> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            debug!(identifier = %ctx.identifier(), "empty transcript skipped");
            return Ok(());
        }
        let outcomes = self.collaborator.invoke(ctx.identifier(), payload).await?;
        for outcome in outcomes {
            ctx.publish(&outcome.topic, outcome.payload).await?;
        }
        Ok(())
    }
}
