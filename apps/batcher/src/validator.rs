use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint, Identity};

use crate::config::ValidatorConfig;

pub mod proto {
    tonic::include_proto!("validator.v1");
}

use proto::validator_service_client::ValidatorServiceClient;

/// Per-project rejections returned by `ValidateAverageOutputs`.
#[derive(Debug)]
pub struct ValidationErrors {
    pub errors: Vec<proto::ValidationError>,
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .errors
            .iter()
            .map(|e| format!("project {}: {}", e.project_id, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "validation failed: {joined}")
    }
}

#[derive(Debug)]
pub struct NotifyProjectErrors {
    pub errors: Vec<proto::NotifyProjectError>,
}

impl fmt::Display for NotifyProjectErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .errors
            .iter()
            .map(|e| format!("project {}: {}", e.project_id, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "failed to notify validator: {joined}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error(transparent)]
    Transport(#[from] tonic::Status),
    #[error("{0}")]
    Validation(ValidationErrors),
    #[error("{0}")]
    Notify(NotifyProjectErrors),
}

/// Client surface the buffer depends on; mocked in tests.
#[async_trait]
pub trait ValidatorApi: Send + Sync {
    async fn send_averages(&self, averages: Vec<proto::AverageOutput>) -> Result<(), ValidatorError>;
    async fn notify_project(&self, project_id: &str) -> Result<(), ValidatorError>;
}

pub struct ValidatorClient {
    client: ValidatorServiceClient<Channel>,
    addr: String,
}

impl ValidatorClient {
    /// Builds a lazily connecting client; the first RPC establishes the
    /// underlying connection.
    pub async fn connect(cfg: &ValidatorConfig) -> Result<Self> {
        let tls_enabled = cfg.tls_config.as_ref().is_some_and(|tls| tls.enabled);
        let scheme = if tls_enabled { "https" } else { "http" };
        let addr = format!("{scheme}://{}:{}", cfg.host, cfg.port);

        let mut endpoint = Endpoint::from_shared(addr.clone())
            .with_context(|| format!("invalid validator address {addr}"))?;

        if let Some(tls) = cfg.tls_config.as_ref().filter(|tls| tls.enabled) {
            let cert = tokio::fs::read(&tls.cert_path)
                .await
                .with_context(|| format!("reading validator cert {}", tls.cert_path.display()))?;
            let key = tokio::fs::read(&tls.key_path)
                .await
                .with_context(|| format!("reading validator key {}", tls.key_path.display()))?;
            let tls_config = ClientTlsConfig::new()
                .identity(Identity::from_pem(cert, key))
                .with_native_roots();
            endpoint = endpoint.tls_config(tls_config)?;
        }

        let channel = endpoint.connect_lazy();
        tracing::info!(addr = %addr, tls = tls_enabled, "validator client created");
        Ok(Self {
            client: ValidatorServiceClient::new(channel),
            addr,
        })
    }

    pub fn close(&self) {
        // tonic tears the channel down on drop; nothing to flush.
        tracing::info!(addr = %self.addr, "validator client closed");
    }
}

#[async_trait]
impl ValidatorApi for ValidatorClient {
    async fn send_averages(&self, averages: Vec<proto::AverageOutput>) -> Result<(), ValidatorError> {
        let request = proto::ValidateAverageOutputsRequest {
            average_outputs: averages,
        };
        let mut client = self.client.clone();
        let response = client.validate_average_outputs(request).await?.into_inner();
        if !response.success && !response.errors.is_empty() {
            return Err(ValidatorError::Validation(ValidationErrors {
                errors: response.errors,
            }));
        }
        Ok(())
    }

    async fn notify_project(&self, project_id: &str) -> Result<(), ValidatorError> {
        let request = proto::NotifyProjectRequest {
            project_id: project_id.to_string(),
        };
        let mut client = self.client.clone();
        let response = client.notify_project(request).await?.into_inner();
        if !response.acknowledged && !response.errors.is_empty() {
            return Err(ValidatorError::Notify(NotifyProjectErrors {
                errors: response.errors,
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_list_every_project() {
        let err = ValidationErrors {
            errors: vec![
                proto::ValidationError {
                    project_id: "p1".to_string(),
                    message: "below threshold".to_string(),
                },
                proto::ValidationError {
                    project_id: "p2".to_string(),
                    message: "stale window".to_string(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("validation failed: "));
        assert!(text.contains("project p1: below threshold"));
        assert!(text.contains("project p2: stale window"));
    }

    #[test]
    fn notify_errors_render_project_ids() {
        let err = NotifyProjectErrors {
            errors: vec![proto::NotifyProjectError {
                project_id: "p9".to_string(),
                message: "unknown project".to_string(),
            }],
        };
        assert_eq!(
            err.to_string(),
            "failed to notify validator: project p9: unknown project"
        );
    }
}
