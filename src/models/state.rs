// Run State - the working record threaded through the stage graph
// Stages read from it and return patches; the executor merges the patches

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::HashSet;

use crate::models::run::{GenerationRequest, RunId};
use crate::{ForgeError, Result};

/// Well-known state keys used by the generation workflow
pub mod keys {
    pub const RUN_ID: &str = "run_id";
    pub const OWNER_ID: &str = "owner_id";
    pub const TOPIC: &str = "topic";
    pub const CONTENT_TYPE: &str = "content_type";
    pub const INPUT_URLS: &str = "input_urls";
    pub const COMPANY_LINKS: &str = "company_links";
    pub const TARGET_KEYWORDS: &str = "target_keywords";
    pub const ENABLE_OUTLINE_REVIEW: &str = "enable_outline_review";
    pub const ENABLE_EDIT_REVIEW: &str = "enable_edit_review";

    pub const RESEARCH: &str = "research";
    pub const RAG_CONTEXT: &str = "rag_context";
    pub const STYLE_GUIDE: &str = "style_guide";
    pub const OUTLINE: &str = "outline";
    pub const SECTIONS: &str = "sections";
    pub const DRAFT: &str = "draft";
    pub const EDITED: &str = "edited";
    pub const IMAGE_PROMPTS: &str = "image_prompts";
    pub const IMAGES: &str = "images";
    pub const RESULT_REF: &str = "result_ref";

    pub const TOTAL_TOKENS: &str = "total_tokens";
    pub const TOTAL_COST_USD: &str = "total_cost_usd";
}

/// Key/value record covering a run's inputs and every stage's outputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunState {
    values: Map<String, Value>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a state from the run's static inputs
    pub fn from_request(run_id: &RunId, owner_id: &str, request: &GenerationRequest) -> Self {
        let mut state = Self::new();
        state.insert(keys::RUN_ID, Value::String(run_id.to_string()));
        state.insert(keys::OWNER_ID, Value::String(owner_id.to_string()));
        state.insert(keys::TOPIC, Value::String(request.topic.clone()));
        state.insert(keys::CONTENT_TYPE, Value::String(request.content_type.clone()));
        state.insert(keys::INPUT_URLS, string_array(&request.input_urls));
        state.insert(keys::COMPANY_LINKS, string_array(&request.company_links));
        state.insert(keys::TARGET_KEYWORDS, string_array(&request.target_keywords));
        state.insert(keys::ENABLE_OUTLINE_REVIEW, Value::Bool(request.enable_outline_review));
        state.insert(keys::ENABLE_EDIT_REVIEW, Value::Bool(request.enable_edit_review));
        state.insert(keys::TOTAL_TOKENS, Value::from(0u64));
        state.insert(keys::TOTAL_COST_USD, Value::from(0.0f64));
        state
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> u64 {
        self.values.get(key).and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        self.values.get(key).and_then(Value::as_f64).unwrap_or(0.0)
    }

    pub fn get_strings(&self, key: &str) -> Vec<String> {
        self.values
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Merge a patch into the state; keys the patch does not touch are kept
    pub fn apply(&mut self, patch: StatePatch) {
        for op in patch.ops {
            match op {
                PatchOp::Set { key, value } => {
                    self.values.insert(key, value);
                }
                PatchOp::Add { key, amount } => {
                    let current = self.values.get(&key).cloned().unwrap_or(Value::from(0u64));
                    self.values.insert(key, add_numbers(&current, &amount));
                }
            }
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }
}

fn string_array(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::String).collect())
}

fn add_numbers(current: &Value, amount: &Value) -> Value {
    if let (Some(a), Some(b)) = (current.as_u64(), amount.as_u64()) {
        return Value::from(a.saturating_add(b));
    }
    let sum = current.as_f64().unwrap_or(0.0) + amount.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).map(Value::Number).unwrap_or(Value::Null)
}

#[derive(Debug, Clone, PartialEq)]
enum PatchOp {
    Set { key: String, value: Value },
    Add { key: String, amount: Value },
}

/// Partial update returned by a stage
///
/// `set` overwrites a key. `add` increments a numeric counter, which lets
/// parallel branches account tokens and cost without clobbering each other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    ops: Vec<PatchOp>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(PatchOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn add(mut self, key: impl Into<String>, amount: impl Into<Value>) -> Self {
        self.ops.push(PatchOp::Add {
            key: key.into(),
            amount: amount.into(),
        });
        self
    }

    /// Record generation usage against the run's counters
    pub fn usage(self, tokens: u64, cost_usd: f64) -> Self {
        self.add(keys::TOTAL_TOKENS, tokens)
            .add(keys::TOTAL_COST_USD, cost_usd)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Keys this patch overwrites
    pub fn set_keys(&self) -> impl Iterator<Item = &str> {
        self.ops.iter().filter_map(|op| match op {
            PatchOp::Set { key, .. } => Some(key.as_str()),
            PatchOp::Add { .. } => None,
        })
    }

    /// Tokens this patch adds to the run total
    pub fn tokens(&self) -> u64 {
        self.ops
            .iter()
            .filter_map(|op| match op {
                PatchOp::Add { key, amount } if key == keys::TOTAL_TOKENS => amount.as_u64(),
                _ => None,
            })
            .sum()
    }

    /// Combine patches from parallel branches in declaration order
    ///
    /// Two branches overwriting the same key is a conflict.
    pub fn merge_parallel(patches: Vec<StatePatch>) -> Result<StatePatch> {
        let mut seen = HashSet::new();
        let mut merged = StatePatch::new();
        for patch in patches {
            let mut own = HashSet::new();
            for key in patch.set_keys() {
                if seen.contains(key) {
                    return Err(ForgeError::StateConflict {
                        key: key.to_string(),
                    });
                }
                own.insert(key.to_string());
            }
            seen.extend(own);
            merged.ops.extend(patch.ops);
        }
        Ok(merged)
    }
}
