//! Per-message processing pipeline
//!
//! Runs once per inbound event from the monitored chat: dedup gate, live
//! authorization guard, filter predicate, optional claim-button click, then
//! the forward. Every invocation is independent; a failure terminates only
//! its own event.

use crate::config::{CLAIM_BUTTON_LABEL, CLAIM_SETTLE_DELAY_SECS};
use crate::dedup::DedupStore;
use crate::factory;
use crate::filter::OrderFilter;
use crate::transport::{retry_transport_operation, InboundMessage, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// Error terminating the processing of a single event
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The forward to the target recipient failed after retries
    #[error("forward failed: {0}")]
    Forward(TransportError),
}

/// How the pipeline disposed of one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Already processed within the dedup TTL; nothing done
    Duplicate,
    /// Client lost authorization; processing aborted before any transport call
    Unauthorized,
    /// Rejected by the keyword/amount predicate
    Filtered,
    /// Forwarded to the target and recorded as processed
    Forwarded,
}

/// The filter-predicate + action executed per inbound event
pub struct MessagePipeline {
    transport: Arc<dyn Transport>,
    dedup: Arc<dyn DedupStore>,
    filter: OrderFilter,
    target: String,
    claim_label: String,
    settle_delay: Duration,
}

impl MessagePipeline {
    /// Create a pipeline forwarding accepted messages to `target`
    pub fn new(
        transport: Arc<dyn Transport>,
        dedup: Arc<dyn DedupStore>,
        filter: OrderFilter,
        target: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            dedup,
            filter,
            target: target.into(),
            claim_label: CLAIM_BUTTON_LABEL.to_string(),
            settle_delay: Duration::from_secs(CLAIM_SETTLE_DELAY_SECS),
        }
    }

    /// Override the pause inserted after a successful claim click
    #[must_use]
    pub fn with_claim_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Process one inbound message.
    ///
    /// The processed-message record is written only after a confirmed
    /// forward, so a transient forward failure leaves the message eligible
    /// for a later redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Forward`] when the relay to the target fails;
    /// the dispatch layer logs it and moves on.
    pub async fn process(
        &self,
        message: &InboundMessage,
    ) -> Result<PipelineOutcome, PipelineError> {
        if self.dedup.is_processed(message.id).await {
            debug!(message_id = message.id, "message already processed");
            return Ok(PipelineOutcome::Duplicate);
        }

        // A degraded session must not attempt further transport calls
        if !factory::check_authorization(self.transport.as_ref()).await {
            error!(
                message_id = message.id,
                "cannot process message: client not authorized"
            );
            return Ok(PipelineOutcome::Unauthorized);
        }

        if !self.filter.accepts(&message.text).await {
            debug!(message_id = message.id, "message rejected by filter");
            return Ok(PipelineOutcome::Filtered);
        }

        self.click_claim_button(message).await;

        retry_transport_operation(|| async {
            self.transport
                .forward_message(&self.target, message)
                .await
        })
        .await
        .map_err(PipelineError::Forward)?;

        self.dedup.mark_processed(message.id).await;
        info!(message_id = message.id, "message forwarded");

        Ok(PipelineOutcome::Forwarded)
    }

    /// Best-effort claim click before the forward; failures are logged and
    /// never abort the forward.
    async fn click_claim_button(&self, message: &InboundMessage) {
        if message.buttons.is_empty() {
            debug!(message_id = message.id, "no buttons on message");
            return;
        }

        match self
            .transport
            .click_button(message, &self.claim_label)
            .await
        {
            Ok(()) => {
                info!(message_id = message.id, "claim button clicked");
                // Give the platform time to register the click
                tokio::time::sleep(self.settle_delay).await;
            }
            Err(e) => {
                error!(
                    message_id = message.id,
                    "claim click failed, continuing with forward: {}", e
                );
            }
        }
    }
}
