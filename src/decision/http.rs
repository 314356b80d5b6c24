//! HTTP decision service: JSON over `POST {base}/reply` and `POST {base}/intent`.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DecisionService, IntentContext, IntentDecision};
use crate::error::DecisionError;
use crate::store::HistoryEntry;

const SERVICE_NAME: &str = "http";

/// Connection settings for [`HttpDecisionService`].
#[derive(Debug, Clone)]
pub struct HttpDecisionConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct ReplyRequest<'a> {
    content: &'a str,
    history: &'a [HistoryEntry],
}

#[derive(Deserialize)]
struct ReplyResponse {
    reply: String,
}

/// Decision service backed by a remote JSON endpoint.
pub struct HttpDecisionService {
    base_url: String,
    api_key: Option<SecretString>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpDecisionService {
    pub fn new(config: HttpDecisionConfig) -> Result<Self, DecisionError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DecisionError::RequestFailed {
                service: SERVICE_NAME.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            timeout: config.timeout,
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, DecisionError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned + Send,
    {
        let url = self.endpoint(path);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DecisionError::Timeout {
                    service: SERVICE_NAME.to_string(),
                    timeout: self.timeout,
                }
            } else {
                DecisionError::RequestFailed {
                    service: SERVICE_NAME.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(DecisionError::RequestFailed {
                service: SERVICE_NAME.to_string(),
                reason: format!("{path} returned {status}: {text}"),
            });
        }

        resp.json::<R>()
            .await
            .map_err(|e| DecisionError::InvalidResponse {
                service: SERVICE_NAME.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl DecisionService for HttpDecisionService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn generate_reply(
        &self,
        content: &str,
        history: &[HistoryEntry],
    ) -> Result<String, DecisionError> {
        let resp: ReplyResponse = self
            .post("reply", &ReplyRequest { content, history })
            .await?;
        let reply = resp.reply.trim();
        if reply.is_empty() {
            return Err(DecisionError::InvalidResponse {
                service: SERVICE_NAME.to_string(),
                reason: "empty reply".to_string(),
            });
        }
        debug!(chars = reply.len(), "Decision service generated reply");
        Ok(reply.to_string())
    }

    async fn get_intent(&self, context: &IntentContext) -> Result<IntentDecision, DecisionError> {
        let decision: IntentDecision = self.post("intent", context).await?;
        debug!(
            should_send = decision.should_send,
            tool = ?decision.tool_id,
            confidence = decision.confidence,
            "Decision service returned intent"
        );
        Ok(decision)
    }
}
