//! Readiness gate run before any work is sent to a stage.

use super::client::StageClient;
use crate::config::RemoteConfig;
use crate::error::RemoteError;
use std::time::Duration;

/// Polls `/<stage>/health` until it answers `{"status": "ok"}`
#[derive(Debug, Clone, Copy)]
pub struct HealthGate {
    pub attempts: u32,
    pub delay: Duration,
}

impl HealthGate {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        Self::new(
            config.health_attempts,
            Duration::from_millis(config.health_delay_ms),
        )
    }

    /// Wait until `client`'s stage is healthy.
    ///
    /// Connection errors, error statuses and malformed or non-`ok` bodies all
    /// count as a failed attempt. Fails with [`RemoteError::HealthCheck`]
    /// once every attempt is used.
    pub async fn wait_ready(&self, client: &StageClient) -> Result<(), RemoteError> {
        for attempt in 1..=self.attempts {
            match client.health().await {
                Ok(health) if health.is_ok() => {
                    tracing::info!(stage = client.stage(), attempt, "Stage is healthy");
                    return Ok(());
                }
                Ok(health) => {
                    tracing::warn!(
                        stage = client.stage(),
                        attempt,
                        status = %health.status,
                        "Stage not ready"
                    );
                }
                Err(e) => {
                    tracing::warn!(stage = client.stage(), attempt, error = %e, "Health check failed");
                }
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.delay).await;
            }
        }

        Err(RemoteError::HealthCheck {
            stage: client.stage().to_string(),
        })
    }
}

impl Default for HealthGate {
    fn default() -> Self {
        Self::from_config(&RemoteConfig::default())
    }
}
