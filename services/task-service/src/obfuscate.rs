use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ObfuscationError;

const SYSTEM_PROMPT: &str = "You are a program that rephrases problem statements in a way that \
is still very clear but makes it hard to know what the original problem statement was.";

#[async_trait]
pub trait Obfuscator: Send + Sync {
    async fn rewrite(&self, text: &str) -> Result<String, ObfuscationError>;
}

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

pub struct OpenAiObfuscator {
    client: Client,
    config: OpenAiConfig,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

impl OpenAiObfuscator {
    pub fn new(config: OpenAiConfig) -> Result<Self, ObfuscationError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

fn user_prompt(text: &str) -> String {
    format!("Please rephrase the following problem statement:\n\n{text}")
}

fn first_content(response: ChatResponse) -> Result<String, ObfuscationError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or(ObfuscationError::EmptyResponse)
}

#[async_trait]
impl Obfuscator for OpenAiObfuscator {
    async fn rewrite(&self, text: &str) -> Result<String, ObfuscationError> {
        let prompt = user_prompt(text);
        let request = ChatRequest {
            model: self.config.model.as_str(),
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt.as_str(),
                },
            ],
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ObfuscationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        first_content(response.json().await?)
    }
}

pub struct PassthroughObfuscator;

#[async_trait]
impl Obfuscator for PassthroughObfuscator {
    async fn rewrite(&self, text: &str) -> Result<String, ObfuscationError> {
        Ok(text.to_string())
    }
}
