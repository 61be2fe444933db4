// 👁️ Recognition Gateway - image bytes → raw text
//
// One request/response call per bill, no retries. Failures surface as
// ServiceUnavailable or NoTextDetected.

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::Cancellation;

pub const GOOGLE_VISION_ENDPOINT: &str = "https://vision.googleapis.com/v1/images:annotate";

#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("recognition service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("no text detected")]
    NoTextDetected,

    #[error("recognition cancelled")]
    Cancelled,
}

/// Text recognition capability
pub trait Recognizer: Send + Sync {
    /// Extract the text of an image. Never returns an empty string:
    /// blank results are `NoTextDetected`.
    fn recognize(&self, image: &[u8], cancel: &Cancellation) -> Result<String, RecognitionError>;

    /// Name for logs
    fn name(&self) -> &str;
}

// ============================================================================
// GOOGLE VISION (document text detection over REST)
// ============================================================================

pub struct GoogleVisionRecognizer {
    http_client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<ApiStatus>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

impl GoogleVisionRecognizer {
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self, RecognitionError> {
        let http_client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecognitionError::ServiceUnavailable(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout,
        })
    }

    fn request_body(image: &[u8]) -> serde_json::Value {
        serde_json::json!({
            "requests": [{
                "image": { "content": general_purpose::STANDARD.encode(image) },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
            }]
        })
    }

    fn extract_text(response: AnnotateResponse) -> Result<String, RecognitionError> {
        let first = response
            .responses
            .into_iter()
            .next()
            .ok_or(RecognitionError::NoTextDetected)?;

        if let Some(status) = first.error {
            return Err(RecognitionError::ServiceUnavailable(format!(
                "API error {}: {}",
                status.code, status.message
            )));
        }

        match first.full_text_annotation {
            Some(annotation) if !annotation.text.trim().is_empty() => Ok(annotation.text),
            _ => Err(RecognitionError::NoTextDetected),
        }
    }
}

impl Recognizer for GoogleVisionRecognizer {
    fn recognize(&self, image: &[u8], cancel: &Cancellation) -> Result<String, RecognitionError> {
        if cancel.is_cancelled() {
            return Err(RecognitionError::Cancelled);
        }

        debug!(bytes = image.len(), endpoint = %self.endpoint, "Calling Google Vision");

        let response = self
            .http_client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .timeout(cancel.clamp_timeout(self.timeout))
            .json(&Self::request_body(image))
            .send()
            .map_err(|e| transport_error(e, cancel))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(RecognitionError::ServiceUnavailable(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: AnnotateResponse = response
            .json()
            .map_err(|e| RecognitionError::ServiceUnavailable(format!("invalid response: {}", e)))?;

        Self::extract_text(parsed)
    }

    fn name(&self) -> &str {
        "google-vision"
    }
}

/// Any failure once the caller has given up counts as cancellation
fn transport_error(err: reqwest::Error, cancel: &Cancellation) -> RecognitionError {
    if cancel.is_cancelled() {
        return RecognitionError::Cancelled;
    }
    warn!(error = %err, "Vision request failed");
    RecognitionError::ServiceUnavailable(err.to_string())
}

// ============================================================================
// FIXED TEXT (already-transcribed receipts, offline use)
// ============================================================================

/// Returns the same text for every image
pub struct FixedTextRecognizer {
    text: String,
}

impl FixedTextRecognizer {
    pub fn new(text: impl Into<String>) -> Self {
        FixedTextRecognizer { text: text.into() }
    }
}

impl Recognizer for FixedTextRecognizer {
    fn recognize(&self, _image: &[u8], cancel: &Cancellation) -> Result<String, RecognitionError> {
        if cancel.is_cancelled() {
            return Err(RecognitionError::Cancelled);
        }
        if self.text.trim().is_empty() {
            return Err(RecognitionError::NoTextDetected);
        }
        Ok(self.text.clone())
    }

    fn name(&self) -> &str {
        "fixed-text"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: serde_json::Value) -> Result<String, RecognitionError> {
        let response: AnnotateResponse = serde_json::from_value(json).unwrap();
        GoogleVisionRecognizer::extract_text(response)
    }

    #[test]
    fn test_extract_full_text_annotation() {
        let text = parse(serde_json::json!({
            "responses": [{ "fullTextAnnotation": { "text": "Milk\n2.50\n" } }]
        }))
        .unwrap();
        assert_eq!(text, "Milk\n2.50\n");
    }

    #[test]
    fn test_missing_annotation_is_no_text() {
        let result = parse(serde_json::json!({ "responses": [{}] }));
        assert!(matches!(result, Err(RecognitionError::NoTextDetected)));

        let result = parse(serde_json::json!({ "responses": [] }));
        assert!(matches!(result, Err(RecognitionError::NoTextDetected)));

        let result = parse(serde_json::json!({
            "responses": [{ "fullTextAnnotation": { "text": "  \n" } }]
        }));
        assert!(matches!(result, Err(RecognitionError::NoTextDetected)));
    }

    #[test]
    fn test_api_error_is_unavailable() {
        let result = parse(serde_json::json!({
            "responses": [{ "error": { "code": 7, "message": "billing disabled" } }]
        }));
        match result {
            Err(RecognitionError::ServiceUnavailable(msg)) => assert!(msg.contains("billing")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_request_body_encodes_image() {
        let body = GoogleVisionRecognizer::request_body(b"abc");
        assert_eq!(body["requests"][0]["image"]["content"], "YWJj");
        assert_eq!(body["requests"][0]["features"][0]["type"], "DOCUMENT_TEXT_DETECTION");
    }

    #[test]
    fn test_fixed_text_recognizer() {
        let cancel = Cancellation::new();
        let recognizer = FixedTextRecognizer::new("Milk\n2.50");
        assert_eq!(recognizer.recognize(b"", &cancel).unwrap(), "Milk\n2.50");

        let blank = FixedTextRecognizer::new("");
        assert!(matches!(
            blank.recognize(b"", &cancel),
            Err(RecognitionError::NoTextDetected)
        ));

        cancel.cancel();
        assert!(matches!(
            recognizer.recognize(b"", &cancel),
            Err(RecognitionError::Cancelled)
        ));
    }

    #[test]
    fn test_transport_error_after_cancel_is_cancelled() {
        let client = reqwest::blocking::Client::new();
        let failure = || client.get("not a url").send().unwrap_err();

        let cancel = Cancellation::new();
        assert!(matches!(
            transport_error(failure(), &cancel),
            RecognitionError::ServiceUnavailable(_)
        ));

        cancel.cancel();
        assert!(matches!(transport_error(failure(), &cancel), RecognitionError::Cancelled));
    }
}
