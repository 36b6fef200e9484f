use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::{
    credential_enables, http_client, parse_extraction, sniff_mime, OcrEngine, OcrResult,
    EXTRACTION_PROMPT,
};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const MODEL: &str = "gemini-1.5-flash";

const PLACEHOLDER_KEY: &str = "your-gemini-api-key";

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum Part {
    Text(String),
    InlineData(InlineData),
}

#[derive(Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: &'static str,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseMimeType")]
    response_mime_type: &'static str,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: String,
}

/// Vision extraction via the Gemini `generateContent` endpoint. Unlike
/// OpenAI, the answer text sits at `candidates[0].content.parts[0].text`
/// and the credential travels as a query parameter.
pub struct GeminiVision {
    api_key: Option<String>,
    client: reqwest::Client,
}

impl GeminiVision {
    pub fn new(api_key: Option<String>) -> Self {
        GeminiVision {
            api_key,
            client: http_client(),
        }
    }
}

#[async_trait]
impl OcrEngine for GeminiVision {
    fn name(&self) -> &'static str {
        "gemini-vision"
    }

    fn is_available(&self) -> bool {
        credential_enables(self.api_key.as_deref(), PLACEHOLDER_KEY)
    }

    async fn extract(&self, file_bytes: &[u8]) -> OcrResult {
        let started = Instant::now();
        let elapsed = |s: &Instant| s.elapsed().as_millis() as u64;

        let api_key = match self.api_key.as_deref() {
            Some(key) => key,
            None => {
                return OcrResult::failure(self.name(), "no API key configured", None, 0);
            }
        };

        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Text(EXTRACTION_PROMPT.to_string()),
                    Part::InlineData(InlineData {
                        mime_type: sniff_mime(file_bytes),
                        data: general_purpose::STANDARD.encode(file_bytes),
                    }),
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                temperature: 0.0,
            },
        };

        let url = format!("{}/{}:generateContent", API_BASE, MODEL);
        let response = match self
            .client
            .post(&url)
            .query(&[("key", api_key)])
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return OcrResult::failure(
                    self.name(),
                    format!("request failed: {}", e),
                    None,
                    elapsed(&started),
                );
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return OcrResult::failure(
                    self.name(),
                    format!("reading response body failed: {}", e),
                    None,
                    elapsed(&started),
                );
            }
        };

        if !status.is_success() {
            return OcrResult::failure(
                self.name(),
                format!("Gemini error {}", status),
                Some(body),
                elapsed(&started),
            );
        }

        let parsed: GenerateResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return OcrResult::failure(
                    self.name(),
                    format!("unexpected response envelope: {}", e),
                    Some(body),
                    elapsed(&started),
                );
            }
        };
        let answer = match parsed
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
        {
            Some(part) => part.text.trim().to_string(),
            None => {
                return OcrResult::failure(
                    self.name(),
                    "empty candidates in response",
                    Some(body),
                    elapsed(&started),
                );
            }
        };

        match parse_extraction(&answer) {
            Ok(data) => OcrResult::success(self.name(), data, body, elapsed(&started)),
            Err(message) => OcrResult::failure(self.name(), message, Some(body), elapsed(&started)),
        }
    }
}
