//! The outer connection loop.
//!
//! A supervisor owns the lifetime of one shard's session objects: it builds
//! them with the current resume parameters, runs them to completion, and is
//! the single place that decides whether an exit is clean, fatal, or worth a
//! retry.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::{CloseCode, GatewayError};
use crate::host::GatewayHost;
use crate::shard::{GatewaySession, ResumeInfo};

/// Runs a shard until it exits cleanly or fatally.
pub struct ShardSupervisor {
    host: Arc<dyn GatewayHost>,
    shard: (u16, u16),
    max_attempts: Option<u32>,
}

impl ShardSupervisor {
    /// Supervisor for `shard` with unlimited reconnect attempts.
    pub fn new(host: Arc<dyn GatewayHost>, shard: (u16, u16)) -> Self {
        Self {
            host,
            shard,
            max_attempts: None,
        }
    }

    /// Give up after `attempts` consecutive failed sessions.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Run session objects until a clean exit or a fatal error.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let mut resume = false;
        let mut resume_info: Option<ResumeInfo> = None;
        let mut attempts = 0u32;

        loop {
            info!(
                shard_id = self.shard.0,
                resume,
                "attempting to {}connect to the gateway",
                if resume { "re" } else { "" }
            );

            let session = GatewaySession::new(
                Arc::clone(&self.host),
                self.shard,
                if resume { resume_info.take() } else { None },
            )?;
            let result = session.start().await;
            resume_info = session.resume_info();

            match result {
                Ok(()) => return Ok(()),

                Err(GatewayError::SocketClosed { code }) => {
                    self.host.dispatch("disconnect", Value::Null);
                    let name = CloseCode::from_code(code)
                        .map(CloseCode::description)
                        .unwrap_or("Unknown Error");
                    match code {
                        1000 => return Ok(()),
                        4011 => return Err(GatewayError::ShardingRequired),
                        4013 => return Err(GatewayError::InvalidIntents),
                        4014 => return Err(GatewayError::DisallowedIntents),
                        _ => {
                            error!(shard_id = self.shard.0, code, reason = name, "fatal close");
                            return Err(GatewayError::SocketClosed { code });
                        }
                    }
                }

                Err(GatewayError::Restart { resume: wanted }) => {
                    self.host.dispatch("disconnect", Value::Null);
                    info!(shard_id = self.shard.0, resume = wanted, "session requested a restart");
                    resume = wanted;
                }

                Err(
                    e @ (GatewayError::WebSocket(_)
                    | GatewayError::Io(_)
                    | GatewayError::GatewayNotFound
                    | GatewayError::Timeout(_)),
                ) => {
                    self.host.dispatch("disconnect", Value::Null);
                    warn!(shard_id = self.shard.0, error = %e, "transport failure");
                    resume = resume_info.is_some();
                }

                Err(e) => {
                    self.host.dispatch("disconnect", Value::Null);
                    error!(shard_id = self.shard.0, error = %e, "session failed; restarting fresh");
                    resume = false;
                }
            }

            attempts += 1;
            if let Some(limit) = self.max_attempts {
                if attempts >= limit {
                    error!(shard_id = self.shard.0, attempts, "out of reconnect attempts");
                    return Err(GatewayError::GatewayNotFound);
                }
            }

            let backoff = Duration::from_secs(rand::rng().random_range(1..=5));
            sleep(backoff).await;
        }
    }
}
