//! On-demand hint (expected answer) lookup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::HintConfig;
use crate::error::{Result, SessionError};

/// Expected answer for one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub question_id: String,
    pub expected_answer: String,
}

#[async_trait]
pub trait HintSource: Send + Sync {
    async fn fetch_hint(&self, interview_id: &str, question_id: &str) -> Result<Hint>;
}

/// Hint lookup over the interview REST API.
pub struct HttpHintSource {
    base_url: String,
    http: reqwest::Client,
}

impl HttpHintSource {
    pub fn new(config: &HintConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| SessionError::Config("hint.base_url is not set".into()))?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SessionError::Hint(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn hint_url(&self, interview_id: &str, question_id: &str) -> String {
        format!(
            "{}/interviews/{}/questions/{}/hint",
            self.base_url, interview_id, question_id
        )
    }
}

#[async_trait]
impl HintSource for HttpHintSource {
    async fn fetch_hint(&self, interview_id: &str, question_id: &str) -> Result<Hint> {
        let url = self.hint_url(interview_id, question_id);
        tracing::debug!(interview_id, question_id, "Fetching hint");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SessionError::Hint(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SessionError::Hint(format!("{url} returned {status}")));
        }
        let hint: Hint = resp
            .json()
            .await
            .map_err(|e| SessionError::Hint(e.to_string()))?;

        // The endpoint echoes the question id; a mismatch means a
        // misrouted or cached response.
        if hint.question_id != question_id {
            return Err(SessionError::StaleResponse {
                current: question_id.to_string(),
                received: hint.question_id,
            });
        }
        Ok(hint)
    }
}
