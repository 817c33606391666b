//! AI responder: last in the priority chain. The completion provider is a
//! trait; the production impl targets an OpenAI-compatible chat API.

use async_trait::async_trait;
use serde_json::{json, Value};

use wagate_common::models::{Direction, Session};
use wagate_common::Error;

/// Canned reply when the provider is unreachable or errors out.
pub const FALLBACK_REPLY: &str =
    "Maaf, saya sedang mengalami kendala. Silakan coba beberapa saat lagi atau hubungi admin kami.";

/// How many conversation lines feed the prompt.
pub const HISTORY_WINDOW: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptCategory {
    Sales,
    CustomerService,
    TechnicalSupport,
    General,
}

impl PromptCategory {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "sales" => Some(PromptCategory::Sales),
            "customer_service" | "customer-service" | "cs" => Some(PromptCategory::CustomerService),
            "technical_support" | "technical-support" | "support" => {
                Some(PromptCategory::TechnicalSupport)
            }
            "general" => Some(PromptCategory::General),
            _ => None,
        }
    }

    /// Derived from `ai_assistant_type`, falling back to the
    /// `agent_category` key of the AI config blob.
    pub fn for_session(session: &Session) -> Self {
        session
            .ai_assistant_type
            .as_deref()
            .and_then(Self::from_label)
            .or_else(|| {
                session.ai_config["agent_category"]
                    .as_str()
                    .and_then(Self::from_label)
            })
            .unwrap_or(PromptCategory::General)
    }

    fn base_prompt(self) -> &'static str {
        match self {
            PromptCategory::Sales => {
                "You are a friendly sales assistant. Help customers discover \
                 products, answer pricing questions, and guide them toward a \
                 purchase without being pushy. Keep replies short and warm."
            }
            PromptCategory::CustomerService => {
                "You are a patient customer service agent. Resolve complaints, \
                 answer questions about orders and policies, and escalate \
                 politely when you cannot help. Keep replies short and clear."
            }
            PromptCategory::TechnicalSupport => {
                "You are a technical support agent. Diagnose problems step by \
                 step, ask for the details you need, and give concrete \
                 instructions. Keep replies short and precise."
            }
            PromptCategory::General => {
                "You are a helpful assistant answering chat messages on behalf \
                 of a business. Be concise, polite, and honest when you do not \
                 know something."
            }
        }
    }
}

/// Compose the system prompt from the category, the business name, and an
/// optional per-session custom prompt.
pub fn system_prompt(
    category: PromptCategory,
    business_name: &str,
    custom: Option<&str>,
) -> String {
    let mut prompt = format!(
        "{}\nYou are answering on behalf of \"{}\". Reply in the customer's language.",
        category.base_prompt(),
        business_name
    );
    if let Some(custom) = custom {
        if !custom.trim().is_empty() {
            prompt.push_str("\n\nAdditional instructions:\n");
            prompt.push_str(custom.trim());
        }
    }
    prompt
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub direction: Direction,
    pub content: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        user_message: &str,
    ) -> Result<String, Error>;
}

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl AiClient for OpenAiClient {
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        user_message: &str,
    ) -> Result<String, Error> {
        let mut messages = vec![json!({ "role": "system", "content": system_prompt })];
        for turn in history {
            let role = match turn.direction {
                Direction::Incoming => "user",
                Direction::Outgoing => "assistant",
            };
            messages.push(json!({ "role": role, "content": turn.content }));
        }
        messages.push(json!({ "role": "user", "content": user_message }));

        let body: Value = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": 0.7,
                "max_tokens": 500,
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Dependency(format!("ai completion: {}", e)))?
            .json()
            .await?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Dependency("ai completion returned no content".to_string()))
    }
}
