// Generation service - the external text/image model the stages call
// Includes an OpenAI-compatible HTTP client and per-model cost accounting

//! # Generation Service
//!
//! Stages never talk HTTP themselves. They hand a [`GenerationPrompt`] to a
//! [`GenerationService`] and get back text plus token usage and cost. The production
//! implementation, [`OpenRouterService`], speaks the OpenAI-compatible
//! `/chat/completions` protocol, so any compatible gateway works.
//!
//! ## Model Tiers
//!
//! Prompts name a [`ModelTier`] rather than a model string. The service maps tiers to
//! concrete models from [`GenerationSettings`]:
//! - `Research`: web-grounded model for the research stage
//! - `Writer`: long-form model for outline, sections, and editing
//! - `Fast`: cheap model for short utility prompts (image prompts)
//!
//! ## Cost Accounting
//!
//! [`CostTable`] holds USD prices per 1,000 input and output tokens. Unknown models are
//! billed at the default rate of $0.001 in / $0.002 out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::config::GenerationSettings;
use crate::{ForgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Research,
    Writer,
    Fast,
}

/// One generation request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPrompt {
    pub tier: ModelTier,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl GenerationPrompt {
    pub fn new(tier: ModelTier, prompt: impl Into<String>) -> Self {
        Self {
            tier,
            system: None,
            prompt: prompt.into(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Generated text with its usage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generated {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl Generated {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// External text (and optionally image) generation
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, prompt: GenerationPrompt) -> Result<Generated>;

    /// Render an image for a prompt; `None` when the service has no image support
    async fn generate_image(&self, _prompt: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Price per 1,000 tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Per-model token prices with a fallback rate
#[derive(Debug, Clone)]
pub struct CostTable {
    rates: HashMap<String, ModelRate>,
    fallback: ModelRate,
}

impl Default for CostTable {
    fn default() -> Self {
        let mut table = Self {
            rates: HashMap::new(),
            fallback: ModelRate {
                input_per_1k: 0.001,
                output_per_1k: 0.002,
            },
        };
        table.set_rate("anthropic/claude-sonnet-4", 0.003, 0.015);
        table.set_rate("openai/gpt-4o-mini", 0.000_15, 0.000_6);
        table.set_rate("openai/text-embedding-3-small", 0.000_02, 0.0);
        table
    }
}

impl CostTable {
    pub fn set_rate(&mut self, model: &str, input_per_1k: f64, output_per_1k: f64) {
        self.rates.insert(
            model.to_string(),
            ModelRate {
                input_per_1k,
                output_per_1k,
            },
        );
    }

    pub fn rate(&self, model: &str) -> ModelRate {
        self.rates.get(model).copied().unwrap_or(self.fallback)
    }

    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let rate = self.rate(model);
        (input_tokens as f64 / 1000.0) * rate.input_per_1k
            + (output_tokens as f64 / 1000.0) * rate.output_per_1k
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    url: Option<String>,
}

/// OpenAI-compatible HTTP generation client (OpenRouter by default)
pub struct OpenRouterService {
    client: reqwest::Client,
    settings: GenerationSettings,
    costs: CostTable,
}

impl OpenRouterService {
    pub fn new(settings: GenerationSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| ForgeError::Generation(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            settings,
            costs: CostTable::default(),
        })
    }

    pub fn with_costs(mut self, costs: CostTable) -> Self {
        self.costs = costs;
        self
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Research => &self.settings.research_model,
            ModelTier::Writer => &self.settings.writer_model,
            ModelTier::Fast => &self.settings.fast_model,
        }
    }

    fn api_key(&self) -> Result<&str> {
        self.settings
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ForgeError::Generation("generation API key is not set".to_string()))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl GenerationService for OpenRouterService {
    async fn generate(&self, prompt: GenerationPrompt) -> Result<Generated> {
        let model = self.model_for(prompt.tier).to_string();
        let mut messages = Vec::new();
        if let Some(system) = &prompt.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt.prompt }));

        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": prompt.temperature,
        });
        if let Some(max_tokens) = prompt.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        debug!("🤖 Requesting completion from {}", model);
        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(self.api_key()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| ForgeError::Generation(format!("request to {} failed: {}", model, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ForgeError::Generation(format!(
                "{} returned {}: {}",
                model, status, text
            )));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| ForgeError::Generation(format!("invalid response from {}: {}", model, e)))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ForgeError::Generation(format!("{} returned no content", model)))?;
        let usage = completion.usage.unwrap_or_default();

        Ok(Generated {
            content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cost_usd: self
                .costs
                .cost(&model, usage.prompt_tokens, usage.completion_tokens),
        })
    }

    async fn generate_image(&self, prompt: &str) -> Result<Option<String>> {
        let Some(model) = self.settings.image_model.clone() else {
            return Ok(None);
        };
        let response = self
            .client
            .post(self.endpoint("images/generations"))
            .bearer_auth(self.api_key()?)
            .json(&json!({ "model": model, "prompt": prompt, "n": 1 }))
            .send()
            .await
            .map_err(|e| ForgeError::Generation(format!("image request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ForgeError::Generation(format!(
                "image model {} returned {}",
                model,
                response.status()
            )));
        }
        let images: ImageResponse = response
            .json()
            .await
            .map_err(|e| ForgeError::Generation(format!("invalid image response: {}", e)))?;
        Ok(images.data.into_iter().find_map(|image| image.url))
    }
}
