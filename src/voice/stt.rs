//! Speech-to-text (STT) over a remote transcription service

use async_trait::async_trait;

use super::AudioBuffer;
use crate::config::{Credential, TranscriptionConfig};
use crate::{Error, Result};

/// Response from the transcription API
#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: Option<String>,
}

/// Error body returned on non-success responses
#[derive(serde::Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(serde::Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Turns a finished recording into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a recording
    ///
    /// The buffer is consumed; it is never reused after this call.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the service rejects it
    async fn transcribe(&self, audio: AudioBuffer, credential: &Credential) -> Result<String>;
}

/// Transcribes via an OpenAI-compatible `/audio/transcriptions` endpoint
pub struct RemoteTranscriber {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    language: String,
    temperature: f32,
    response_format: String,
}

impl RemoteTranscriber {
    /// Create a transcriber from configuration
    #[must_use]
    pub fn new(config: &TranscriptionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!(
                "{}/audio/transcriptions",
                config.base_url.trim_end_matches('/')
            ),
            model: config.model.clone(),
            language: config.language.clone(),
            temperature: config.temperature,
            response_format: config.response_format.clone(),
        }
    }

    /// Full URL requests are posted to
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transcriber for RemoteTranscriber {
    async fn transcribe(&self, audio: AudioBuffer, credential: &Credential) -> Result<String> {
        let format = audio.format();
        tracing::debug!(
            audio_bytes = audio.len(),
            format = format.mime,
            model = %self.model,
            "starting remote transcription"
        );

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.into_bytes())
                    .file_name(format.file_name)
                    .mime_str(format.base_mime())
                    .map_err(|e| Error::Unknown(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("temperature", self.temperature.to_string())
            .text("response_format", self.response_format.clone());

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", credential.expose()))
            .multipart(form)
            .send()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "transcription request failed"))?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::RemoteServiceError {
                status: status.as_u16(),
                message: error_message(&body, status.canonical_reason()),
            });
        }

        let body = response
            .text()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "failed to read transcription response"))?;

        let text = extract_text(&body, &self.response_format)?;
        tracing::info!(transcript = %text, "transcription complete");
        Ok(text)
    }
}

/// Pull the message out of an `{error:{message}}` body
fn error_message(body: &str, reason: Option<&str>) -> String {
    serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error.message)
        .ok()
        .filter(|m| !m.is_empty())
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
        .unwrap_or_else(|| reason.unwrap_or("request failed").to_string())
}

/// Extract the transcript; plain-text formats are returned as-is
fn extract_text(body: &str, response_format: &str) -> Result<String> {
    match response_format {
        "text" | "srt" | "vtt" => Ok(body.trim().to_string()),
        _ => {
            let result: TranscriptionResponse = serde_json::from_str(body).map_err(|e| {
                tracing::error!(error = %e, "failed to parse response");
                e
            })?;
            Ok(result.text.unwrap_or_default())
        }
    }
}
