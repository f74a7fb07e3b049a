//! Dialogue over an OpenAI-compatible `/chat/completions` endpoint
//! (Ollama, vLLM, OpenAI).
//!
//! The client keeps a short rolling history per session key so a caller's
//! turns stay in context across utterances.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use dial112_core::config::DialogueConfig;

use crate::{DialogueAgent, ServiceError, check_status, http_client};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a calm, professional Dial 112 emergency voice agent. \
Speak one short, clear sentence at a time. Collect the caller's name, what happened, \
and where they are, asking one question at a time. Once you have all three, tell them \
help is on the way and to stay safe. No small talk.";

/// One completed user/assistant exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

pub struct ChatDialogue {
    url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: String,
    max_tokens: u32,
    temperature: Option<f64>,
    history_turns: usize,
    history: Mutex<HashMap<String, VecDeque<Exchange>>>,
    client: reqwest::Client,
}

impl ChatDialogue {
    pub fn new(config: &DialogueConfig) -> Self {
        Self {
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.resolve_api_key(),
            model: config.model.clone(),
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            history_turns: config.history_turns,
            history: Mutex::new(HashMap::new()),
            client: http_client(config.timeout_secs),
        }
    }

    /// Exchanges currently remembered for `session_key`.
    pub async fn history(&self, session_key: &str) -> Vec<Exchange> {
        self.history
            .lock()
            .await
            .get(session_key)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn remember(&self, session_key: &str, exchange: Exchange) {
        let mut history = self.history.lock().await;
        let entry = history.entry(session_key.to_string()).or_default();
        push_bounded(entry, exchange, self.history_turns);
    }
}

fn push_bounded(history: &mut VecDeque<Exchange>, exchange: Exchange, limit: usize) {
    if limit == 0 {
        history.clear();
        return;
    }
    history.push_back(exchange);
    while history.len() > limit {
        history.pop_front();
    }
}

/// System prompt, then prior exchanges oldest first, then the new user line.
pub fn build_messages(system_prompt: &str, history: &[Exchange], text: &str) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(history.len() * 2 + 2);
    messages.push(json!({"role": "system", "content": system_prompt}));
    for exchange in history {
        messages.push(json!({"role": "user", "content": exchange.user}));
        messages.push(json!({"role": "assistant", "content": exchange.assistant}));
    }
    messages.push(json!({"role": "user", "content": text}));
    messages
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the first choice's text from a chat completion body.
pub fn parse_completion(body: &str) -> Result<String, ServiceError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::InvalidResponse(format!("chat completion: {e}")))?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|c| c.trim().to_string())
        .unwrap_or_default();
    if text.is_empty() {
        return Err(ServiceError::InvalidResponse("empty completion".into()));
    }
    Ok(text)
}

#[async_trait]
impl DialogueAgent for ChatDialogue {
    async fn respond(&self, text: &str, session_key: &str) -> Result<String, ServiceError> {
        let history = self.history(session_key).await;
        let request = ChatRequest {
            model: &self.model,
            messages: build_messages(&self.system_prompt, &history, text),
            max_tokens: self.max_tokens,
            stream: false,
            temperature: self.temperature,
        };

        debug!(
            model = %self.model,
            session_key,
            history = history.len(),
            "Requesting dialogue reply"
        );

        let mut req = self.client.post(&self.url).json(&request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = check_status("dialogue", req.send().await?).await?;
        let reply = parse_completion(&resp.text().await?)?;

        self.remember(
            session_key,
            Exchange {
                user: text.to_string(),
                assistant: reply.clone(),
            },
        )
        .await;
        Ok(reply)
    }
}
