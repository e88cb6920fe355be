//! LibreTranslate-compatible HTTP provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Translator;
use crate::common::error::TranslationError;

pub struct LibreTranslate {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: Option<String>,
    error: Option<String>,
}

impl LibreTranslate {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.is_empty()),
        })
    }

    fn request<'a>(&'a self, text: &'a str, target: &'a str) -> TranslateRequest<'a> {
        TranslateRequest {
            q: text,
            source: "auto",
            target,
            format: "text",
            api_key: self.api_key.as_deref(),
        }
    }
}

#[async_trait]
impl Translator for LibreTranslate {
    async fn translate(&self, text: &str, target: &str) -> Result<String, TranslationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&self.request(text, target))
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        let body: TranslateResponse = response.json().await.unwrap_or_default();
        read_response(status.is_success(), status.as_u16(), body)
    }
}

fn unavailable(error: reqwest::Error) -> TranslationError {
    if error.is_timeout() {
        TranslationError::Timeout
    } else {
        TranslationError::TranslationUnavailable {
            message: error.to_string(),
        }
    }
}

fn read_response(success: bool, status: u16, body: TranslateResponse) -> Result<String, TranslationError> {
    match (success, body.translated_text, body.error) {
        (true, Some(text), _) => Ok(text),
        (_, _, Some(error)) => Err(TranslationError::TranslationUnavailable {
            message: format!("HTTP {}: {}", status, error),
        }),
        _ => Err(TranslationError::TranslationUnavailable {
            message: format!("HTTP {}: no translation in response", status),
        }),
    }
}
