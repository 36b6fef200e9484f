use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::{
    credential_enables, http_client, parse_extraction, sniff_mime, OcrEngine, OcrResult,
    EXTRACTION_PROMPT,
};

const API_URL: &str = "https://api.openai.com/v1/chat/completions";
const MODEL: &str = "gpt-4o-mini";

/// Sample-configuration sentinel; a credential equal to this is treated as
/// absent.
const PLACEHOLDER_KEY: &str = "sk-your-openai-key";

#[derive(Serialize)]
struct ChatRequest {
    model: &'static str,
    temperature: f32,
    messages: Vec<Message>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Vision extraction via the OpenAI chat-completions endpoint. The answer
/// text lives at `choices[0].message.content`.
pub struct OpenAiVision {
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiVision {
    pub fn new(api_key: Option<String>) -> Self {
        OpenAiVision {
            api_key,
            client: http_client(),
        }
    }
}

#[async_trait]
impl OcrEngine for OpenAiVision {
    fn name(&self) -> &'static str {
        "openai-vision"
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

        let data_url = format!(
            "data:{};base64,{}",
            sniff_mime(file_bytes),
            general_purpose::STANDARD.encode(file_bytes)
        );
        let request = ChatRequest {
            model: MODEL,
            temperature: 0.0,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: EXTRACTION_PROMPT.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                ],
            }],
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let response = match self
            .client
            .post(API_URL)
            .bearer_auth(api_key)
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
                format!("OpenAI error {}", status),
                Some(body),
                elapsed(&started),
            );
        }

        let parsed: ChatResponse = match serde_json::from_str(&body) {
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
        let answer = match parsed.choices.first() {
            Some(choice) => choice.message.content.trim().to_string(),
            None => {
                return OcrResult::failure(
                    self.name(),
                    "empty choices in response",
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
