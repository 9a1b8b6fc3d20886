use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concierge_config::{Dispatch, DispatchKind};
use reqwest::Client;
use serde::Serialize;
use tracing::info;

use crate::error::DispatchError;

/// Sends a reply back over the messaging transport.
#[async_trait]
pub trait ReplyDispatcher: Send + Sync {
    async fn send_reply(&self, sender_id: &str, text: &str) -> Result<(), DispatchError>;
}

pub fn build_dispatcher(cfg: &Dispatch) -> Result<Arc<dyn ReplyDispatcher>, DispatchError> {
    match cfg.kind {
        DispatchKind::Log => Ok(Arc::new(LogDispatcher)),
        DispatchKind::Webhook => {
            let endpoint = cfg.endpoint.clone().ok_or_else(|| {
                DispatchError::Config("dispatch.endpoint is required for webhook".to_string())
            })?;
            let auth_token = match cfg.auth_token_env.as_deref() {
                Some(var) => Some(std::env::var(var).map_err(|_| {
                    DispatchError::Config(format!("environment variable {var} is not set"))
                })?),
                None => None,
            };
            Ok(Arc::new(WebhookDispatcher::new(
                &endpoint,
                auth_token,
                Duration::from_millis(cfg.timeout_ms),
            )?))
        }
    }
}

/// Posts `{to, text}` to a messaging gateway.
pub struct WebhookDispatcher {
    client: Client,
    endpoint: String,
    auth_token: Option<String>,
}

#[derive(Serialize)]
struct OutboundMessage<'a> {
    to: &'a str,
    text: &'a str,
}

impl WebhookDispatcher {
    pub fn new(
        endpoint: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Config(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            auth_token,
        })
    }
}

#[async_trait]
impl ReplyDispatcher for WebhookDispatcher {
    async fn send_reply(&self, sender_id: &str, text: &str) -> Result<(), DispatchError> {
        let mut request = self.client.post(&self.endpoint).json(&OutboundMessage {
            to: sender_id,
            text,
        });
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Dry-run dispatcher: the reply only goes to diagnostics.
pub struct LogDispatcher;

#[async_trait]
impl ReplyDispatcher for LogDispatcher {
    async fn send_reply(&self, sender_id: &str, text: &str) -> Result<(), DispatchError> {
        info!(sender_id, reply = text, "reply not sent, log dispatcher active");
        Ok(())
    }
}
