use crate::config::VoiceConfig;
use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub enum VoiceError {
    /// The service could not make out any speech in the audio.
    Unintelligible,
    /// The transcription service failed or was unreachable.
    ServiceError(String),
    ConfigError(String),
}

impl fmt::Display for VoiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceError::Unintelligible => write!(f, "could not understand the audio"),
            VoiceError::ServiceError(msg) => write!(f, "transcription service error: {}", msg),
            VoiceError::ConfigError(msg) => write!(f, "voice configuration error: {}", msg),
        }
    }
}

impl Error for VoiceError {}

#[derive(Deserialize)]
struct TranscriptionResponse {
    transcript: Option<String>,
}

/// Submits captured audio to the remote speech-recognition service. The
/// browser does the recording; this adapter only forwards the clip. No
/// retry on failure, the user re-invokes manually.
pub struct VoiceTranscriber {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

impl VoiceTranscriber {
    pub fn new(config: &VoiceConfig) -> Result<Self, VoiceError> {
        let api_url = config.api_url.clone().ok_or_else(|| {
            VoiceError::ConfigError("API URL is required for voice input".to_string())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::ServiceError(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            api_key: config.api_key.clone(),
        })
    }

    pub async fn transcribe(
        &self,
        file_name: &str,
        content_type: &str,
        audio: Vec<u8>,
    ) -> Result<String, VoiceError> {
        debug!("Submitting {} bytes of audio for transcription", audio.len());

        let part = reqwest::multipart::Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str(content_type)
            .map_err(|e| VoiceError::ServiceError(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("audio", part);

        let mut request = self.client.post(&self.api_url).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| VoiceError::ServiceError(e.to_string()))?;

        let success = response.status().is_success();
        let body = response
            .text()
            .await
            .map_err(|e| VoiceError::ServiceError(e.to_string()))?;

        interpret_response(success, &body)
    }
}

/// Maps a transcription response onto the three possible outcomes:
/// transcript, unintelligible audio, or service failure.
fn interpret_response(success: bool, body: &str) -> Result<String, VoiceError> {
    if !success {
        return Err(VoiceError::ServiceError(format!(
            "service responded with: {}",
            body.chars().take(200).collect::<String>()
        )));
    }

    let parsed: TranscriptionResponse = serde_json::from_str(body)
        .map_err(|e| VoiceError::ServiceError(format!("unexpected response: {}", e)))?;

    match parsed.transcript {
        Some(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        _ => Err(VoiceError::Unintelligible),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_transcript_is_returned_trimmed() {
        let result = interpret_response(true, r#"{"transcript": " how many albums are there "}"#);
        assert_eq!(result.unwrap(), "how many albums are there");
    }

    #[test]
    fn empty_transcript_means_unintelligible() {
        let result = interpret_response(true, r#"{"transcript": "  "}"#);
        assert!(matches!(result, Err(VoiceError::Unintelligible)));

        let result = interpret_response(true, r#"{}"#);
        assert!(matches!(result, Err(VoiceError::Unintelligible)));
    }

    #[test]
    fn failed_status_means_service_error() {
        let result = interpret_response(false, "internal error");
        assert!(matches!(result, Err(VoiceError::ServiceError(_))));
    }

    #[test]
    fn garbage_body_means_service_error() {
        let result = interpret_response(true, "<html>not json</html>");
        assert!(matches!(result, Err(VoiceError::ServiceError(_))));
    }

    #[test]
    fn new_requires_an_api_url() {
        let config = VoiceConfig {
            api_url: None,
            api_key: None,
        };
        assert!(matches!(
            VoiceTranscriber::new(&config),
            Err(VoiceError::ConfigError(_))
        ));
    }
}
