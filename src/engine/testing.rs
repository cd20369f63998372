// Test doubles shared by engine and API tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::context::InMemoryContextRetriever;
use crate::engine::generation::{GenerationPrompt, GenerationService, Generated};
use crate::engine::stages::StageServices;
use crate::engine::storage::InMemoryArticleSink;
use crate::{ForgeError, Result};

/// Generation service that answers from canned text keyed on the prompt
#[derive(Default)]
pub struct ScriptedGenerator {
    pub prompts: Mutex<Vec<GenerationPrompt>>,
    outline_versions: AtomicUsize,
    fail_on: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any prompt containing `marker`
    pub fn failing_on(self, marker: &str) -> Self {
        if let Ok(mut fail_on) = self.fail_on.lock() {
            *fail_on = Some(marker.to_string());
        }
        self
    }

    /// Sleep before every answer
    pub fn with_delay(self, delay: Duration) -> Self {
        if let Ok(mut slot) = self.delay.lock() {
            *slot = Some(delay);
        }
        self
    }

    pub fn prompts_containing(&self, needle: &str) -> usize {
        self.prompts
            .lock()
            .map(|prompts| prompts.iter().filter(|p| p.prompt.contains(needle)).count())
            .unwrap_or(0)
    }

    fn answer(&self, prompt: &str) -> String {
        if prompt.contains("was rejected") {
            let version = self.outline_versions.fetch_add(1, Ordering::SeqCst) + 2;
            return format!(
                "## Revised part {v}\nMore depth\n## Conclusion {v}\nWrap up",
                v = version
            );
        }
        if prompt.contains("Research the topic") {
            return "Key facts: adoption is growing [1].".to_string();
        }
        if prompt.contains("Create a detailed outline") {
            return "## Introduction\nWhy it matters\n## Details\nHow it works".to_string();
        }
        if prompt.contains("Write the section") {
            let title = prompt
                .split('"')
                .nth(1)
                .unwrap_or("Section")
                .to_string();
            return format!("## {}\nBody of {}.", title, title);
        }
        if prompt.contains("Edit and polish") {
            return "Sure, here it is:\n# Final article\n\n## Introduction\nPolished body.".to_string();
        }
        if prompt.contains("image-generation prompts") {
            return "A lighthouse at dawn over rough sea\nEngineers around a server rack".to_string();
        }
        "generated".to_string()
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    async fn generate(&self, prompt: GenerationPrompt) -> Result<Generated> {
        let delay = self.delay.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .fail_on
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .filter(|marker| prompt.prompt.contains(marker.as_str()));
        if let Some(marker) = failing {
            return Err(ForgeError::Generation(format!("scripted failure on '{}'", marker)));
        }

        let content = self.answer(&prompt.prompt);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt);
        }
        Ok(Generated {
            content,
            input_tokens: 10,
            output_tokens: 5,
            cost_usd: 0.001,
        })
    }
}

/// Stage services backed entirely by in-memory doubles
pub fn scripted_services(
    generator: Arc<ScriptedGenerator>,
) -> (StageServices, Arc<InMemoryArticleSink>) {
    let articles = Arc::new(InMemoryArticleSink::new());
    let services = StageServices {
        generator,
        retriever: Arc::new(InMemoryContextRetriever::new()),
        articles: articles.clone(),
    };
    (services, articles)
}
