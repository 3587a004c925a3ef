//! Connection fallback across credentials and model variants.
//!
//! Attempts run in nested order: for each credential, each model in turn.
//! A quota- or auth-class failure burns the credential (remaining models are
//! skipped); an availability-class failure burns only the model. Indices
//! survive between invocations, so a reset reconnects with the last good
//! pair instead of starting over.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

/// How a failed attempt counts against the fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The credential is spent (quota, auth): skip its remaining models.
    Credential,
    /// The model was unavailable (timeout, not found): try the next one.
    Availability,
}

/// Sort an error message into a failure class.
///
/// The remote service reports errors as human-readable text, so this has to
/// match substrings until a structured error contract exists.
pub fn classify_failure(message: &str) -> FailureClass {
    const CREDENTIAL_MARKERS: &[&str] = &[
        "quota",
        "limit",
        "unauthorized",
        "forbidden",
        "permission denied",
        "api key",
        "401",
        "403",
        "429",
    ];

    let lowered = message.to_ascii_lowercase();
    if CREDENTIAL_MARKERS.iter().any(|m| lowered.contains(m)) {
        FailureClass::Credential
    } else {
        FailureClass::Availability
    }
}

/// One in-flight connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub credential_index: usize,
    pub model_index: usize,
    pub deadline: Instant,
}

/// Status transitions, reported as they occur. No attempt happens silently.
#[derive(Debug, Clone)]
pub enum ConnectorStatus {
    Attempting {
        credential_index: usize,
        model: String,
    },
    AttemptFailed {
        credential_index: usize,
        model: String,
        class: FailureClass,
        message: String,
    },
    Connected {
        credential_index: usize,
        model: String,
    },
    Exhausted {
        attempts: usize,
    },
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Budget for a single attempt, measured from its start.
    pub connect_timeout: Duration,
    /// Pause before retrying the next model on the same credential.
    pub retry_delay: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Drives connection establishment over ordered credential and model lists.
pub struct SessionConnector {
    credentials: Vec<String>,
    models: Vec<String>,
    credential_index: usize,
    model_index: usize,
    config: ConnectorConfig,
    status_tx: Option<UnboundedSender<ConnectorStatus>>,
}

impl SessionConnector {
    pub fn new(
        credentials: Vec<String>,
        models: Vec<String>,
        config: ConnectorConfig,
    ) -> Result<Self> {
        if credentials.is_empty() {
            return Err(anyhow!("no credentials configured"));
        }
        if models.is_empty() {
            return Err(anyhow!("no models configured"));
        }
        Ok(Self {
            credentials,
            models,
            credential_index: 0,
            model_index: 0,
            config,
            status_tx: None,
        })
    }

    pub fn with_status(mut self, tx: UnboundedSender<ConnectorStatus>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    /// Current (credential, model) indices. Always in bounds.
    pub fn current(&self) -> (usize, usize) {
        (self.credential_index, self.model_index)
    }

    pub fn current_credential(&self) -> &str {
        &self.credentials[self.credential_index]
    }

    pub fn current_model(&self) -> &str {
        &self.models[self.model_index]
    }

    /// Explicit advance for a manual retry: next model, else next credential
    /// with the model index reset, else wrap back to the first pair.
    pub fn advance_for_retry(&mut self) {
        if self.model_index + 1 < self.models.len() {
            self.model_index += 1;
        } else if self.credential_index + 1 < self.credentials.len() {
            self.credential_index += 1;
            self.model_index = 0;
        } else {
            self.credential_index = 0;
            self.model_index = 0;
        }
        debug!(
            "manual retry advanced to key #{} / {}",
            self.credential_index + 1,
            self.current_model()
        );
    }

    /// Try (credential, model) pairs from the current indices until one
    /// dial succeeds or every remaining pair has failed. Each attempt is
    /// bounded by the configured timeout; no pair is visited twice within
    /// one invocation, so the worst case is `keys * models` attempts.
    pub async fn connect_with<T, F, Fut>(&mut self, mut dial: F) -> Result<T>
    where
        F: FnMut(String, String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures: Vec<String> = Vec::new();

        loop {
            let attempt = ConnectionAttempt {
                credential_index: self.credential_index,
                model_index: self.model_index,
                deadline: Instant::now() + self.config.connect_timeout,
            };
            let credential = self.credentials[attempt.credential_index].clone();
            let model = self.models[attempt.model_index].clone();

            self.report(ConnectorStatus::Attempting {
                credential_index: attempt.credential_index,
                model: model.clone(),
            });
            info!(
                "connecting with key #{} / {} (timeout {:?})",
                attempt.credential_index + 1,
                model,
                self.config.connect_timeout
            );

            let outcome =
                tokio::time::timeout_at(attempt.deadline, dial(credential, model.clone())).await;

            let error = match outcome {
                Ok(Ok(connected)) => {
                    self.report(ConnectorStatus::Connected {
                        credential_index: attempt.credential_index,
                        model: model.clone(),
                    });
                    info!("connected with key #{} / {}", attempt.credential_index + 1, model);
                    return Ok(connected);
                }
                Ok(Err(e)) => e,
                Err(_) => anyhow!(
                    "attempt timed out after {:?}",
                    self.config.connect_timeout
                ),
            };

            let message = format!("{error:#}");
            let class = classify_failure(&message);
            warn!(
                "key #{} / {} failed ({:?}): {}",
                attempt.credential_index + 1,
                model,
                class,
                message
            );
            failures.push(format!(
                "key #{} / {}: {}",
                attempt.credential_index + 1,
                model,
                message
            ));
            self.report(ConnectorStatus::AttemptFailed {
                credential_index: attempt.credential_index,
                model,
                class,
                message,
            });

            let more_models = self.model_index + 1 < self.models.len();
            let more_credentials = self.credential_index + 1 < self.credentials.len();

            match class {
                FailureClass::Credential if more_credentials => {
                    self.credential_index += 1;
                    self.model_index = 0;
                }
                FailureClass::Availability if more_models => {
                    self.model_index += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                FailureClass::Availability if more_credentials => {
                    self.credential_index += 1;
                    self.model_index = 0;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                _ => {
                    self.report(ConnectorStatus::Exhausted {
                        attempts: failures.len(),
                    });
                    return Err(anyhow!(
                        "all {} connection attempts failed: {}",
                        failures.len(),
                        failures.join("; ")
                    ));
                }
            }
        }
    }

    fn report(&self, status: ConnectorStatus) {
        if let Some(tx) = &self.status_tx {
            let _ = tx.send(status);
        }
    }
}
