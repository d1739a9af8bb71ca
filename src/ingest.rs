use crate::accumulator::EnergyAccumulator;
use crate::error::AppError;
use crate::metrics::EngineMetrics;
use crate::models::ReadingMessage;
use crate::mqtt::parse_reading_topic;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Turns inbound transport messages into accumulator readings.
pub struct IngestGateway {
    accumulator: Arc<EnergyAccumulator>,
    metrics: Arc<EngineMetrics>,
}

impl IngestGateway {
    pub fn new(accumulator: Arc<EnergyAccumulator>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            accumulator,
            metrics,
        }
    }

    /// Handle one message. Rejected messages are already logged and counted
    /// when the error is returned.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> Result<(), AppError> {
        self.handle_message_at(topic, payload, Utc::now())
    }

    pub fn handle_message_at(
        &self,
        topic: &str,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        match self.accept(topic, payload, now) {
            Ok(()) => {
                EngineMetrics::incr(&self.metrics.readings_accepted);
                debug!(topic = %topic, "reading accepted");
                Ok(())
            }
            Err(e) => {
                EngineMetrics::incr(&self.metrics.readings_rejected);
                warn!(topic = %topic, error = %e, "dropping reading");
                Err(e)
            }
        }
    }

    fn accept(&self, topic: &str, payload: &[u8], now: DateTime<Utc>) -> Result<(), AppError> {
        let (home_id, category) = parse_reading_topic(topic)
            .ok_or_else(|| AppError::Validation(format!("unexpected topic {topic}")))?;

        let msg: ReadingMessage = serde_json::from_slice(payload)
            .map_err(|e| AppError::Validation(format!("malformed reading payload: {e}")))?;
        if msg.device_category != category {
            return Err(AppError::Validation(format!(
                "payload category {} does not match topic category {category}",
                msg.device_category
            )));
        }

        self.accumulator.add_reading_at(msg.into_reading(home_id), now)
    }
}
