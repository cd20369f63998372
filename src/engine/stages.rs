// Generation workflow stages
// The ten stages of the article workflow and the graph that wires them

//! # Generation Workflow
//!
//! ```text
//! research ─┬─> rag_context ───────┬─> create_outline ─┬─> outline_review ─┐
//!           └─> build_style_guide ─┘                   └───────────────────┴─> write_sections
//!
//! write_sections ─> edit_polish ─┬─> edit_review ─┐
//!                                └────────────────┴─> image_generate ─> assemble ─> end
//! ```
//!
//! The two review stages only run when the request opted in. The context stages
//! (`rag_context`, `build_style_guide`) degrade to placeholder values instead of failing
//! the run when the knowledge base is unavailable.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::context::ContextRetriever;
use crate::engine::generation::{GenerationPrompt, GenerationService, ModelTier};
use crate::engine::graph::{Stage, StageContext, StageGraph, END};
use crate::engine::review::{content_as_text, Regenerate, ReviewLoop, Revision};
use crate::engine::storage::{Article, ArticleSink};
use crate::models::state::keys;
use crate::models::{RunId, RunState, StatePatch};
use crate::Result;

pub const RESEARCH: &str = "research";
pub const RAG_CONTEXT: &str = "rag_context";
pub const BUILD_STYLE_GUIDE: &str = "build_style_guide";
pub const CREATE_OUTLINE: &str = "create_outline";
pub const OUTLINE_REVIEW: &str = "outline_review";
pub const WRITE_SECTIONS: &str = "write_sections";
pub const EDIT_POLISH: &str = "edit_polish";
pub const EDIT_REVIEW: &str = "edit_review";
pub const IMAGE_GENERATE: &str = "image_generate";
pub const ASSEMBLE: &str = "assemble";

/// Placeholder used when reference retrieval fails
pub const CONTEXT_UNAVAILABLE: &str = "Reference context unavailable.";

const CONTEXT_CHUNK_LIMIT: usize = 8;
const CONTEXT_SLICE_CHARS: usize = 6000;
const MAX_IMAGES: usize = 3;

/// External collaborators the stages call
#[derive(Clone)]
pub struct StageServices {
    pub generator: Arc<dyn GenerationService>,
    pub retriever: Arc<dyn ContextRetriever>,
    pub articles: Arc<dyn ArticleSink>,
}

/// Build the article generation graph
pub fn generation_graph(services: &StageServices) -> Result<StageGraph> {
    let generator = services.generator.clone();

    StageGraph::builder()
        .stage(Arc::new(ResearchStage::new(generator.clone())))
        .stage(Arc::new(RagContextStage::new(services.retriever.clone())))
        .stage(Arc::new(StyleGuideStage::new(services.retriever.clone())))
        .stage(Arc::new(OutlineStage::new(generator.clone())))
        .stage(Arc::new(OutlineReviewStage::new(generator.clone())))
        .stage(Arc::new(WriteSectionsStage::new(generator.clone())))
        .stage(Arc::new(EditPolishStage::new(generator.clone())))
        .stage(Arc::new(EditReviewStage::new(generator.clone())))
        .stage(Arc::new(ImageGenerateStage::new(generator)))
        .stage(Arc::new(AssembleStage::new(services.articles.clone())))
        .start(RESEARCH)
        .fan_out(RESEARCH, [RAG_CONTEXT, BUILD_STYLE_GUIDE], CREATE_OUTLINE)
        .edge(RAG_CONTEXT, CREATE_OUTLINE)
        .edge(BUILD_STYLE_GUIDE, CREATE_OUTLINE)
        .conditional(
            CREATE_OUTLINE,
            "outline review enabled",
            outline_review_enabled,
            OUTLINE_REVIEW,
            WRITE_SECTIONS,
        )
        .edge(OUTLINE_REVIEW, WRITE_SECTIONS)
        .edge(WRITE_SECTIONS, EDIT_POLISH)
        .conditional(
            EDIT_POLISH,
            "edit review enabled",
            edit_review_enabled,
            EDIT_REVIEW,
            IMAGE_GENERATE,
        )
        .edge(EDIT_REVIEW, IMAGE_GENERATE)
        .edge(IMAGE_GENERATE, ASSEMBLE)
        .edge(ASSEMBLE, END)
        .build()
}

fn outline_review_enabled(state: &RunState) -> bool {
    state.get_bool(keys::ENABLE_OUTLINE_REVIEW)
}

fn edit_review_enabled(state: &RunState) -> bool {
    state.get_bool(keys::ENABLE_EDIT_REVIEW)
}

/// Cut text to at most `max` characters on a char boundary
fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "(none)".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A planned article section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionPlan {
    pub title: String,
    pub description: String,
}

/// Split an outline into sections
///
/// `## ` (or `H2:`) headings start sections and the lines below them become the
/// description. Without headings, two or more numbered items (`1.` / `1)`) are used.
/// Otherwise the whole outline is one "Main Content" section.
pub fn parse_sections(outline: &str) -> Vec<SectionPlan> {
    let mut sections = Vec::new();
    let mut current: Option<SectionPlan> = None;

    for line in outline.lines() {
        if let Some(title) = heading_title(line) {
            if let Some(mut done) = current.take() {
                done.description = done.description.trim().to_string();
                sections.push(done);
            }
            current = Some(SectionPlan {
                title,
                description: String::new(),
            });
        } else if let Some(section) = current.as_mut() {
            section.description.push_str(line);
            section.description.push('\n');
        }
    }
    if let Some(mut done) = current.take() {
        done.description = done.description.trim().to_string();
        sections.push(done);
    }

    if sections.is_empty() {
        let numbered: Vec<String> = outline.lines().filter_map(numbered_item).collect();
        if numbered.len() >= 2 {
            sections = numbered
                .into_iter()
                .map(|title| SectionPlan {
                    description: title.clone(),
                    title,
                })
                .collect();
        }
    }

    if sections.is_empty() {
        sections.push(SectionPlan {
            title: "Main Content".to_string(),
            description: outline.trim().to_string(),
        });
    }
    sections
}

fn heading_title(line: &str) -> Option<String> {
    if let Some(rest) = line.strip_prefix("##") {
        if rest.starts_with(char::is_whitespace) && !rest.trim().is_empty() {
            return Some(rest.trim().to_string());
        }
        return None;
    }
    let prefix = line.get(..3)?;
    if prefix.eq_ignore_ascii_case("h2:") || prefix.eq_ignore_ascii_case("h2 ") {
        let title = line[3..].trim_start_matches(|c: char| c == ':' || c.is_whitespace());
        if !title.trim().is_empty() {
            return Some(title.trim().to_string());
        }
    }
    None
}

fn numbered_item(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let rest = &trimmed[digits..];
    let rest = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')'))?;
    let title = rest.trim();
    (!title.is_empty()).then(|| title.to_string())
}

/// Remove chatty preambles and meta lines from edited text
///
/// A short lead-in (under 500 characters) before the first top-level heading is
/// dropped, `Meta Description:` lines are removed, and runs of blank lines collapse.
pub fn strip_preamble(text: &str) -> String {
    let mut cleaned = text;
    let first_heading = if cleaned.starts_with("# ") {
        Some(0)
    } else {
        cleaned.find("\n# ").map(|index| index + 1)
    };
    if let Some(index) = first_heading {
        if index > 0 && index < 500 {
            cleaned = &cleaned[index..];
        }
    }

    let mut out = String::with_capacity(cleaned.len());
    let mut blank_run = 0;
    for line in cleaned.lines() {
        let lower = line.trim_start().to_lowercase();
        if lower.starts_with("meta description:") || lower.starts_with("meta description :") {
            continue;
        }
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

/// Pick up to `max` image prompts from a model response
pub fn image_prompts_from(response: &str, max: usize) -> Vec<String> {
    response
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == '-' || c == ')')
                .trim()
        })
        .filter(|line| line.chars().count() > 10)
        .take(max)
        .map(str::to_string)
        .collect()
}

/// Insert image `i` right after the line of the `(i+1)`th `## ` heading
pub fn insert_images(article: &str, image_urls: &[String]) -> String {
    let mut lines: Vec<String> = article.lines().map(str::to_string).collect();
    let heading_positions: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.starts_with("## "))
        .map(|(index, _)| index)
        .collect();

    // Insert from the bottom so earlier positions stay valid
    let mut placements: Vec<(usize, usize)> = image_urls
        .iter()
        .enumerate()
        .filter_map(|(i, _)| heading_positions.get(i).map(|pos| (*pos, i)))
        .collect();
    placements.sort_by(|a, b| b.0.cmp(&a.0));

    for (pos, i) in placements {
        let image = format!("\n![Illustration {}]({})\n", i + 1, image_urls[i]);
        lines.insert(pos + 1, image);
    }
    lines.join("\n")
}

async fn generate(
    generator: &dyn GenerationService,
    prompt: GenerationPrompt,
) -> Result<(String, u64, f64)> {
    let generated = generator.generate(prompt).await?;
    let tokens = generated.total_tokens();
    Ok((generated.content, tokens, generated.cost_usd))
}

pub struct ResearchStage {
    generator: Arc<dyn GenerationService>,
}

impl ResearchStage {
    pub fn new(generator: Arc<dyn GenerationService>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Stage for ResearchStage {
    fn name(&self) -> &str {
        RESEARCH
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> Result<StatePatch> {
        let topic = state.get_str(keys::TOPIC).unwrap_or_default();
        ctx.progress
            .stage_progress(RESEARCH, format!("Researching \"{}\"...", topic), None)
            .await;

        let prompt = format!(
            "Research the topic \"{}\" for a {} article.\n\nFocus keywords:\n{}\n\nSources to consult:\n{}\n\n\
             Summarize the key facts, statistics, and expert opinions. Cite sources inline.",
            topic,
            state.get_str(keys::CONTENT_TYPE).unwrap_or("longread"),
            bullet_list(&state.get_strings(keys::TARGET_KEYWORDS)),
            bullet_list(&state.get_strings(keys::INPUT_URLS)),
        );
        let (research, tokens, cost) = generate(
            self.generator.as_ref(),
            GenerationPrompt::new(ModelTier::Research, prompt).with_temperature(0.3),
        )
        .await?;

        Ok(StatePatch::new()
            .set(keys::RESEARCH, research)
            .usage(tokens, cost))
    }
}

pub struct RagContextStage {
    retriever: Arc<dyn ContextRetriever>,
}

impl RagContextStage {
    pub fn new(retriever: Arc<dyn ContextRetriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Stage for RagContextStage {
    fn name(&self) -> &str {
        RAG_CONTEXT
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> Result<StatePatch> {
        let topic = state.get_str(keys::TOPIC).unwrap_or_default();
        let keywords = state.get_strings(keys::TARGET_KEYWORDS);

        let context = match self
            .retriever
            .reference_context(topic, &keywords, CONTEXT_CHUNK_LIMIT)
            .await
        {
            Ok(chunks) if chunks.is_empty() => String::new(),
            Ok(chunks) => {
                ctx.progress
                    .stage_progress(
                        RAG_CONTEXT,
                        format!("Found {} reference passages", chunks.len()),
                        None,
                    )
                    .await;
                chunks
                    .iter()
                    .map(|chunk| format!("[{}]\n{}", chunk.source, chunk.content))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
            Err(e) => {
                warn!("⚠️ Reference retrieval failed for run {}: {}", ctx.run_id, e);
                CONTEXT_UNAVAILABLE.to_string()
            }
        };

        Ok(StatePatch::new().set(keys::RAG_CONTEXT, context))
    }
}

pub struct StyleGuideStage {
    retriever: Arc<dyn ContextRetriever>,
}

impl StyleGuideStage {
    pub fn new(retriever: Arc<dyn ContextRetriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Stage for StyleGuideStage {
    fn name(&self) -> &str {
        BUILD_STYLE_GUIDE
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> Result<StatePatch> {
        let content_type = state.get_str(keys::CONTENT_TYPE).unwrap_or("longread");
        let guide = match self.retriever.style_profile(content_type).await {
            Ok(Some(profile)) => {
                let mut guide = profile.guide;
                for example in profile.examples.iter().take(2) {
                    guide.push_str("\n\nExample:\n");
                    guide.push_str(truncate(example, 1500));
                }
                guide
            }
            Ok(None) => String::new(),
            Err(e) => {
                warn!("⚠️ Style profile lookup failed for run {}: {}", ctx.run_id, e);
                String::new()
            }
        };
        Ok(StatePatch::new().set(keys::STYLE_GUIDE, guide))
    }
}

fn outline_prompt(state: &RunState) -> String {
    format!(
        "Create a detailed outline for a {} article on \"{}\".\n\
         Start every section with a `## ` heading followed by a short description.\n\n\
         Research:\n{}\n\nReference material:\n{}\n\nStyle guide:\n{}",
        state.get_str(keys::CONTENT_TYPE).unwrap_or("longread"),
        state.get_str(keys::TOPIC).unwrap_or_default(),
        truncate(state.get_str(keys::RESEARCH).unwrap_or_default(), CONTEXT_SLICE_CHARS),
        truncate(state.get_str(keys::RAG_CONTEXT).unwrap_or_default(), CONTEXT_SLICE_CHARS),
        state.get_str(keys::STYLE_GUIDE).unwrap_or_default(),
    )
}

pub struct OutlineStage {
    generator: Arc<dyn GenerationService>,
}

impl OutlineStage {
    pub fn new(generator: Arc<dyn GenerationService>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Stage for OutlineStage {
    fn name(&self) -> &str {
        CREATE_OUTLINE
    }

    async fn run(&self, state: &RunState, _ctx: &StageContext) -> Result<StatePatch> {
        let (outline, tokens, cost) = generate(
            self.generator.as_ref(),
            GenerationPrompt::new(ModelTier::Writer, outline_prompt(state)).with_temperature(0.5),
        )
        .await?;
        Ok(StatePatch::new()
            .set(keys::OUTLINE, outline)
            .usage(tokens, cost))
    }
}

/// Regenerates reviewed content by re-running a prompt with the feedback appended
struct FeedbackRegenerator<'a> {
    generator: &'a dyn GenerationService,
    base_prompt: String,
    subject: &'static str,
    temperature: f32,
}

#[async_trait]
impl Regenerate for FeedbackRegenerator<'_> {
    async fn regenerate(&self, feedback: &str, previous: &Value) -> Result<Revision> {
        let prompt = format!(
            "{}\n\nThe previous {subject} was rejected. Reviewer feedback:\n{}\n\n\
             Previous {subject}:\n{}\n\nWrite a new {subject} that addresses the feedback.",
            self.base_prompt,
            feedback,
            content_as_text(previous),
            subject = self.subject,
        );
        let (content, tokens, cost_usd) = generate(
            self.generator,
            GenerationPrompt::new(ModelTier::Writer, prompt).with_temperature(self.temperature),
        )
        .await?;
        Ok(Revision {
            content: Value::String(content),
            tokens,
            cost_usd,
        })
    }
}

pub struct OutlineReviewStage {
    generator: Arc<dyn GenerationService>,
}

impl OutlineReviewStage {
    pub fn new(generator: Arc<dyn GenerationService>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Stage for OutlineReviewStage {
    fn name(&self) -> &str {
        OUTLINE_REVIEW
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> Result<StatePatch> {
        let regenerator = FeedbackRegenerator {
            generator: self.generator.as_ref(),
            base_prompt: outline_prompt(state),
            subject: "outline",
            temperature: 0.5,
        };
        let outline = json!(state.get_str(keys::OUTLINE).unwrap_or_default());
        let result = ReviewLoop::new(OUTLINE_REVIEW, ctx)
            .run(outline, &regenerator)
            .await?;
        info!(
            "📝 Outline review for run {} ended {:?} after {} rejection(s)",
            ctx.run_id, result.outcome, result.rejections
        );

        Ok(StatePatch::new()
            .set(keys::OUTLINE, content_as_text(&result.content))
            .usage(result.tokens, result.cost_usd))
    }
}

pub struct WriteSectionsStage {
    generator: Arc<dyn GenerationService>,
}

impl WriteSectionsStage {
    pub fn new(generator: Arc<dyn GenerationService>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Stage for WriteSectionsStage {
    fn name(&self) -> &str {
        WRITE_SECTIONS
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> Result<StatePatch> {
        let outline = state.get_str(keys::OUTLINE).unwrap_or_default();
        let plans = parse_sections(outline);
        let topic = state.get_str(keys::TOPIC).unwrap_or_default();
        let company_links = state.get_strings(keys::COMPANY_LINKS).join(", ");

        let mut sections = Vec::with_capacity(plans.len());
        let mut tokens = 0;
        let mut cost = 0.0;
        for (i, plan) in plans.iter().enumerate() {
            let percent = ((i * 100) / plans.len()) as u8;
            ctx.progress
                .stage_progress(
                    WRITE_SECTIONS,
                    format!("Writing section {}/{}: {}", i + 1, plans.len(), plan.title),
                    Some(percent),
                )
                .await;

            let prompt = format!(
                "Write the section \"{}\" of an article on \"{}\".\nSection brief: {}\n\n\
                 Full outline:\n{}\n\nResearch:\n{}\n\nReference material:\n{}\n\n\
                 Company links to cite where relevant: {}",
                plan.title,
                topic,
                plan.description,
                outline,
                truncate(state.get_str(keys::RESEARCH).unwrap_or_default(), CONTEXT_SLICE_CHARS),
                truncate(state.get_str(keys::RAG_CONTEXT).unwrap_or_default(), CONTEXT_SLICE_CHARS),
                if company_links.is_empty() { "(none)" } else { company_links.as_str() },
            );
            let (text, used, spent) = generate(
                self.generator.as_ref(),
                GenerationPrompt::new(ModelTier::Writer, prompt),
            )
            .await?;
            sections.push(text);
            tokens += used;
            cost += spent;
        }

        let draft = sections.join("\n\n");
        Ok(StatePatch::new()
            .set(keys::SECTIONS, json!(sections))
            .set(keys::DRAFT, draft)
            .usage(tokens, cost))
    }
}

fn edit_prompt(state: &RunState) -> String {
    format!(
        "Edit and polish the following draft. Keep its structure, tighten the prose, and \
         weave in these keywords naturally: {}\n\nReference material:\n{}\n\nDraft:\n{}",
        state.get_strings(keys::TARGET_KEYWORDS).join(", "),
        truncate(state.get_str(keys::RAG_CONTEXT).unwrap_or_default(), 2000),
        state.get_str(keys::DRAFT).unwrap_or_default(),
    )
}

pub struct EditPolishStage {
    generator: Arc<dyn GenerationService>,
}

impl EditPolishStage {
    pub fn new(generator: Arc<dyn GenerationService>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Stage for EditPolishStage {
    fn name(&self) -> &str {
        EDIT_POLISH
    }

    async fn run(&self, state: &RunState, _ctx: &StageContext) -> Result<StatePatch> {
        let (edited, tokens, cost) = generate(
            self.generator.as_ref(),
            GenerationPrompt::new(ModelTier::Writer, edit_prompt(state))
                .with_temperature(0.3)
                .with_max_tokens(8000),
        )
        .await?;
        Ok(StatePatch::new()
            .set(keys::EDITED, strip_preamble(&edited))
            .usage(tokens, cost))
    }
}

pub struct EditReviewStage {
    generator: Arc<dyn GenerationService>,
}

impl EditReviewStage {
    pub fn new(generator: Arc<dyn GenerationService>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Stage for EditReviewStage {
    fn name(&self) -> &str {
        EDIT_REVIEW
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> Result<StatePatch> {
        let regenerator = FeedbackRegenerator {
            generator: self.generator.as_ref(),
            base_prompt: edit_prompt(state),
            subject: "edited article",
            temperature: 0.3,
        };
        let edited = json!(state.get_str(keys::EDITED).unwrap_or_default());
        let result = ReviewLoop::new(EDIT_REVIEW, ctx)
            .run(edited, &regenerator)
            .await?;
        info!(
            "📝 Edit review for run {} ended {:?} after {} rejection(s)",
            ctx.run_id, result.outcome, result.rejections
        );

        Ok(StatePatch::new()
            .set(keys::EDITED, strip_preamble(&content_as_text(&result.content)))
            .usage(result.tokens, result.cost_usd))
    }
}

pub struct ImageGenerateStage {
    generator: Arc<dyn GenerationService>,
}

impl ImageGenerateStage {
    pub fn new(generator: Arc<dyn GenerationService>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Stage for ImageGenerateStage {
    fn name(&self) -> &str {
        IMAGE_GENERATE
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> Result<StatePatch> {
        let section_count = state
            .get(keys::SECTIONS)
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        let section_names = (1..=section_count)
            .map(|i| format!("Section {}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = format!(
            "Write {} short image-generation prompts, one per line, for illustrations of an \
             article titled \"{}\" with sections: {}",
            MAX_IMAGES,
            state.get_str(keys::TOPIC).unwrap_or_default(),
            section_names,
        );
        let (response, tokens, cost) = generate(
            self.generator.as_ref(),
            GenerationPrompt::new(ModelTier::Fast, prompt).with_max_tokens(500),
        )
        .await?;
        let prompts = image_prompts_from(&response, MAX_IMAGES);

        let mut urls = Vec::new();
        for (i, image_prompt) in prompts.iter().enumerate() {
            ctx.progress
                .stage_progress(
                    IMAGE_GENERATE,
                    format!("Rendering image {}/{}", i + 1, prompts.len()),
                    Some(((i * 100) / prompts.len().max(1)) as u8),
                )
                .await;
            if let Some(url) = self.generator.generate_image(image_prompt).await? {
                urls.push(url);
            }
        }

        Ok(StatePatch::new()
            .set(keys::IMAGE_PROMPTS, json!(prompts))
            .set(keys::IMAGES, json!(urls))
            .usage(tokens, cost))
    }
}

pub struct AssembleStage {
    articles: Arc<dyn ArticleSink>,
}

impl AssembleStage {
    pub fn new(articles: Arc<dyn ArticleSink>) -> Self {
        Self { articles }
    }
}

#[async_trait]
impl Stage for AssembleStage {
    fn name(&self) -> &str {
        ASSEMBLE
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> Result<StatePatch> {
        let body = state
            .get_str(keys::EDITED)
            .filter(|text| !text.trim().is_empty())
            .or_else(|| state.get_str(keys::DRAFT))
            .unwrap_or_default();
        let images = state.get_strings(keys::IMAGES);
        let content = insert_images(body, &images);

        ctx.progress
            .stage_progress(ASSEMBLE, "Saving article...", None)
            .await;
        let run_id = state
            .get_str(keys::RUN_ID)
            .map(RunId::parse)
            .transpose()?
            .unwrap_or_else(|| ctx.run_id.clone());
        let article_id = self
            .articles
            .save_article(Article {
                run_id,
                owner_id: state.get_str(keys::OWNER_ID).unwrap_or_default().to_string(),
                title: state.get_str(keys::TOPIC).unwrap_or_default().to_string(),
                content,
                content_type: state
                    .get_str(keys::CONTENT_TYPE)
                    .unwrap_or("longread")
                    .to_string(),
                images,
                total_tokens: state.get_u64(keys::TOTAL_TOKENS),
                total_cost_usd: state.get_f64(keys::TOTAL_COST_USD),
            })
            .await?;

        Ok(StatePatch::new().set(keys::RESULT_REF, article_id))
    }
}
