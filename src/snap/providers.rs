//! External AI callers. The pipeline only sees the `Describer` and
//! `Comparator` traits; the Groq and Gemini clients are the defaults.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::LookoutError;
use crate::snap::config::{ApiConfig, ProviderConfig};
use crate::snap::prompts;

const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

pub trait Describer: Send + Sync {
    fn provider(&self) -> &str;
    fn model(&self) -> &str;
    fn describe(&self, image: &Path, label: &str) -> Result<Completion>;
    fn extract_tags(&self, description: &str) -> Result<Completion>;
}

pub trait Comparator: Send + Sync {
    fn provider(&self) -> &str;
    fn model(&self) -> &str;
    fn compare(
        &self,
        a: &Path,
        b: &Path,
        label_a: &str,
        label_b: &str,
        cadence: &str,
    ) -> Result<Completion>;
    fn summarize(&self, date: &str, tags_summary: &str, lines: &[String]) -> Result<Completion>;
    fn ask(
        &self,
        query: &str,
        window_label: &str,
        tags_summary: &str,
        context: &str,
    ) -> Result<Completion>;
}

/// MIME type and base64 payload of an image file.
pub fn encode_image(path: &Path) -> Result<(&'static str, String)> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let is_png = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("png"));
    let mime = if is_png { "image/png" } else { "image/jpeg" };
    Ok((mime, BASE64.encode(bytes)))
}

fn u64_at(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(Value::as_u64)
}

pub fn extract_openai_compatible_text(json: &Value) -> Option<String> {
    let content = json
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?;
    let text = match content {
        Value::String(s) => s.trim().to_string(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string(),
        _ => return None,
    };
    if text.is_empty() { None } else { Some(text) }
}

pub fn extract_openai_usage(json: &Value) -> TokenUsage {
    let Some(usage) = json.get("usage") else {
        return TokenUsage::default();
    };
    TokenUsage {
        input: u64_at(usage, "prompt_tokens").unwrap_or(0),
        output: u64_at(usage, "completion_tokens").unwrap_or(0),
        total: u64_at(usage, "total_tokens").unwrap_or(0),
    }
}

pub fn extract_gemini_text(json: &Value) -> Option<String> {
    let parts = json
        .get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string();
    if text.is_empty() { None } else { Some(text) }
}

pub fn extract_gemini_usage(json: &Value) -> TokenUsage {
    let Some(usage) = json.get("usageMetadata") else {
        return TokenUsage::default();
    };
    let input = u64_at(usage, "promptTokenCount").unwrap_or(0);
    let output = u64_at(usage, "candidatesTokenCount").unwrap_or(0);
    TokenUsage {
        input,
        output,
        total: u64_at(usage, "totalTokenCount").unwrap_or(input + output),
    }
}

fn build_client(timeout_secs: u64) -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()?)
}

#[derive(Debug, Clone)]
pub struct GroqClient {
    api_key: String,
    model: String,
    tag_timeout: Duration,
    client: Client,
}

impl GroqClient {
    pub fn new(cfg: &ProviderConfig, api: &ApiConfig) -> Result<Self> {
        if cfg.api_key.trim().is_empty() {
            return Err(LookoutError::MissingCredentials("GROQ_API_KEY").into());
        }
        Ok(Self {
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            tag_timeout: Duration::from_secs(api.tag_timeout_secs.max(1)),
            client: build_client(api.request_timeout_secs)?,
        })
    }

    fn chat(&self, payload: &Value, timeout: Option<Duration>) -> Result<Value> {
        let mut request = self
            .client
            .post(format!("{GROQ_BASE_URL}/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(payload);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send()?;
        if !response.status().is_success() {
            anyhow::bail!("groq call failed with status {}", response.status());
        }
        Ok(response.json()?)
    }
}

impl Describer for GroqClient {
    fn provider(&self) -> &str {
        "groq"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn describe(&self, image: &Path, label: &str) -> Result<Completion> {
        let (mime, data) = encode_image(image)?;
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompts::DESCRIBE_SYSTEM},
                {
                    "role": "user",
                    "content": [
                        {"type": "text", "text": prompts::describe_user(label)},
                        {
                            "type": "image_url",
                            "image_url": {"url": format!("data:{mime};base64,{data}")}
                        }
                    ]
                }
            ]
        });
        let json = self.chat(&payload, None)?;
        let text = extract_openai_compatible_text(&json)
            .context("groq response missing text content")?;
        Ok(Completion {
            text,
            usage: extract_openai_usage(&json),
        })
    }

    fn extract_tags(&self, description: &str) -> Result<Completion> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompts::TAG_SYSTEM},
                {"role": "user", "content": prompts::tag_user(description)}
            ]
        });
        let json = self.chat(&payload, Some(self.tag_timeout))?;
        Ok(Completion {
            text: extract_openai_compatible_text(&json).unwrap_or_default(),
            usage: extract_openai_usage(&json),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_key: String,
    model: String,
    client: Client,
}

impl GeminiClient {
    pub fn new(cfg: &ProviderConfig, api: &ApiConfig) -> Result<Self> {
        if cfg.api_key.trim().is_empty() {
            return Err(LookoutError::MissingCredentials("GOOGLE_API_KEY").into());
        }
        Ok(Self {
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            client: build_client(api.request_timeout_secs)?,
        })
    }

    fn generate(&self, system: &str, parts: Vec<Value>) -> Result<Completion> {
        let url = format!(
            "{GEMINI_BASE_URL}/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let payload = json!({
            "systemInstruction": {"parts": [{"text": system}]},
            "contents": [{"role": "user", "parts": parts}],
            "generationConfig": {"temperature": 0.2}
        });
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()?;
        if !response.status().is_success() {
            anyhow::bail!("gemini call failed with status {}", response.status());
        }
        let json: Value = response.json()?;
        let text = extract_gemini_text(&json).context("gemini response missing text content")?;
        Ok(Completion {
            text,
            usage: extract_gemini_usage(&json),
        })
    }
}

impl Comparator for GeminiClient {
    fn provider(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn compare(
        &self,
        a: &Path,
        b: &Path,
        label_a: &str,
        label_b: &str,
        cadence: &str,
    ) -> Result<Completion> {
        let (mime_a, data_a) = encode_image(a)?;
        let (mime_b, data_b) = encode_image(b)?;
        self.generate(
            prompts::COMPARE_SYSTEM,
            vec![
                json!({"text": prompts::compare_user(label_a, label_b, cadence)}),
                json!({"inline_data": {"mime_type": mime_a, "data": data_a}}),
                json!({"inline_data": {"mime_type": mime_b, "data": data_b}}),
            ],
        )
    }

    fn summarize(&self, date: &str, tags_summary: &str, lines: &[String]) -> Result<Completion> {
        self.generate(
            prompts::DAILY_SYSTEM,
            vec![
                json!({"text": prompts::daily_user(date, tags_summary)}),
                json!({"text": lines.join("\n")}),
            ],
        )
    }

    fn ask(
        &self,
        query: &str,
        window_label: &str,
        tags_summary: &str,
        context: &str,
    ) -> Result<Completion> {
        self.generate(
            prompts::ASK_SYSTEM,
            vec![json!({"text": prompts::ask_user(query, window_label, tags_summary, context)})],
        )
    }
}
