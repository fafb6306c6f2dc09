use crate::llm::{GatewayClient, LlmError, LlmMessage, gateway::strip_code_fence};
use crate::models::{ImageAsset, TaskPayload};
use crate::templates::{Palette, RecommendationEngine};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// The block taxonomy a product page is assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Introduction,
    KeyFeatures,
    Specifications,
    UsageGuide,
    Comparison,
    BrandStory,
    Faq,
    Gallery,
}

impl BlockKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Introduction => "Introduction",
            Self::KeyFeatures => "Key Features",
            Self::Specifications => "Specifications",
            Self::UsageGuide => "Usage Guide",
            Self::Comparison => "Comparison",
            Self::BrandStory => "Brand Story",
            Self::Faq => "FAQ",
            Self::Gallery => "Gallery",
        }
    }

    /// Search phrase for the template index.
    fn search_terms(self) -> &'static str {
        match self {
            Self::Introduction => "hero introduction product overview section",
            Self::KeyFeatures => "key features benefits grid section",
            Self::Specifications => "specifications table details section",
            Self::UsageGuide => "usage guide how to use steps section",
            Self::Comparison => "comparison versus alternatives table",
            Self::BrandStory => "brand story about us narrative section",
            Self::Faq => "faq frequently asked questions accordion",
            Self::Gallery => "image gallery grid showcase",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockSpec {
    pub kind: BlockKind,
    /// Short heading-level idea for the block.
    pub concept: String,
    /// Notes on what the block's copy should cover.
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PagePlan {
    /// Overall style concept for the page, when the planner offers one.
    #[serde(default)]
    pub concept: Option<String>,
    pub blocks: Vec<BlockSpec>,
}

/// How a block's HTML came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Recommended template skeleton filled with generated copy.
    Advanced,
    /// Deterministic built-in rendering from payload data.
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct AssembledBlock {
    pub kind: BlockKind,
    pub strategy: Strategy,
    pub template_id: Option<String>,
    pub html: String,
}

#[derive(Debug, Clone)]
pub struct AssembledPage {
    pub blocks: Vec<AssembledBlock>,
    pub used_templates: Vec<String>,
}

impl AssembledPage {
    pub fn html_list(&self) -> Vec<String> {
        self.blocks.iter().map(|b| b.html.clone()).collect()
    }
}

/// Text-completion seam for the assembler. The production impl is the
/// inference gateway; tests script replies.
#[async_trait]
pub trait CopyWriter: Send + Sync {
    async fn complete(&self, messages: &[LlmMessage]) -> Result<String, LlmError>;
}

#[async_trait]
impl CopyWriter for GatewayClient {
    async fn complete(&self, messages: &[LlmMessage]) -> Result<String, LlmError> {
        self.chat(messages).await
    }
}

#[derive(Debug, Deserialize)]
struct BlockCopy {
    title: String,
    body: String,
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Builds the page block list. Each non-gallery block independently tries the
/// advanced strategy (matched template skeleton plus generated copy) and
/// falls back to the hybrid renderer on its own; one block's miss never
/// degrades its neighbours.
pub struct ContentAssembler {
    writer: Arc<dyn CopyWriter>,
    engine: Arc<RecommendationEngine>,
}

impl ContentAssembler {
    pub fn new(writer: Arc<dyn CopyWriter>, engine: Arc<RecommendationEngine>) -> Self {
        Self { writer, engine }
    }

    pub async fn assemble(&self, payload: &TaskPayload, images: &[ImageAsset]) -> AssembledPage {
        let plan = self.plan(payload, !images.is_empty()).await;
        let mut blocks = Vec::with_capacity(plan.blocks.len());
        let mut used_templates = Vec::new();
        let mut image_cursor = 0usize;

        for spec in &plan.blocks {
            if spec.kind == BlockKind::Gallery {
                blocks.push(render_gallery(spec, images));
                continue;
            }
            let block_image = images.get(image_cursor);
            let block = self
                .assemble_block(payload, spec, plan.concept.as_deref(), block_image)
                .await;
            if block.html.contains("<img") {
                image_cursor += 1;
            }
            if let Some(id) = &block.template_id
                && !used_templates.contains(id)
            {
                used_templates.push(id.clone());
            }
            blocks.push(block);
        }

        AssembledPage {
            blocks,
            used_templates,
        }
    }

    /// Page plan from the model, or the deterministic default when the model
    /// is unavailable or replies with something unusable.
    async fn plan(&self, payload: &TaskPayload, has_images: bool) -> PagePlan {
        let messages = [
            LlmMessage::system(
                "You plan product detail pages. Reply with JSON only: \
                 {\"concept\":...,\"blocks\":[{\"kind\":...,\"concept\":...,\"content\":...}]}. \
                 Allowed kinds: introduction, key_features, specifications, \
                 usage_guide, comparison, brand_story, faq.",
            ),
            LlmMessage::user(format!(
                "Product: {}\nFeatures: {}\nAudience: {}\nTone: {:?}\nPlan 3 to 5 blocks.",
                payload.product_data,
                payload.features.join(", "),
                payload.target_customer.as_deref().unwrap_or("general"),
                payload.tone,
            )),
        ];
        let mut plan = match self.writer.complete(&messages).await {
            Ok(text) => match serde_json::from_str::<PagePlan>(strip_code_fence(&text)) {
                Ok(plan) if !plan.blocks.is_empty() => plan,
                Ok(_) => {
                    warn!(target = "pagecraft.assemble", "model planned zero blocks, using default plan");
                    default_plan(payload)
                }
                Err(err) => {
                    warn!(
                        target = "pagecraft.assemble",
                        error = %err,
                        "unparseable page plan, using default plan"
                    );
                    default_plan(payload)
                }
            },
            Err(err) => {
                warn!(
                    target = "pagecraft.assemble",
                    error = %err,
                    "planner unavailable, using default plan"
                );
                default_plan(payload)
            }
        };
        plan.blocks.retain(|b| b.kind != BlockKind::Gallery);
        // Pages with listed features always get a feature-highlight block,
        // whatever the planner decided.
        if !payload.features.is_empty()
            && plan.blocks.iter().all(|b| b.kind != BlockKind::KeyFeatures)
        {
            let at = plan.blocks.len().min(1);
            plan.blocks.insert(
                at,
                BlockSpec {
                    kind: BlockKind::KeyFeatures,
                    concept: "Key Features".into(),
                    content: payload.features.join(", "),
                },
            );
        }
        if has_images {
            plan.blocks.push(BlockSpec {
                kind: BlockKind::Gallery,
                concept: "Gallery".into(),
                content: String::new(),
            });
        }
        plan
    }

    async fn assemble_block(
        &self,
        payload: &TaskPayload,
        spec: &BlockSpec,
        style: Option<&str>,
        image: Option<&ImageAsset>,
    ) -> AssembledBlock {
        let query = format!(
            "{} {} {} {}",
            spec.kind.search_terms(),
            spec.concept,
            payload.tone.style_keywords(),
            payload
                .features
                .iter()
                .take(2)
                .cloned()
                .collect::<Vec<_>>()
                .join(" "),
        );
        let template = self.engine.recommend(&query).await.into_iter().next();

        if let Some(template) = template {
            match self.write_copy(payload, spec, style).await {
                Ok(copy) => {
                    debug!(
                        target = "pagecraft.assemble",
                        kind = spec.kind.label(),
                        template_id = %template.template_id,
                        block_type = %template.block_type,
                        "advanced block"
                    );
                    return AssembledBlock {
                        kind: spec.kind,
                        strategy: Strategy::Advanced,
                        html: fill_slots(&template.html, &template.palette, &copy, image),
                        template_id: Some(template.template_id),
                    };
                }
                Err(err) => {
                    warn!(
                        target = "pagecraft.assemble",
                        kind = spec.kind.label(),
                        error = %err,
                        "copy generation failed, falling back to hybrid block"
                    );
                }
            }
        }

        AssembledBlock {
            kind: spec.kind,
            strategy: Strategy::Hybrid,
            template_id: None,
            html: render_hybrid(payload, spec, image),
        }
    }

    async fn write_copy(
        &self,
        payload: &TaskPayload,
        spec: &BlockSpec,
        style: Option<&str>,
    ) -> Result<BlockCopy, LlmError> {
        let style_line = style
            .map(|s| format!(" Page style concept: {s}."))
            .unwrap_or_default();
        let messages = [
            LlmMessage::system(format!(
                "You write HTML-free product page copy in a {:?} tone.{style_line} \
                 Reply with JSON only: {{\"title\":...,\"body\":...}}.",
                payload.tone,
            )),
            LlmMessage::user(format!(
                "Section: {} ({})\nCover: {}\nProduct: {}\nFeatures: {}",
                spec.concept,
                spec.kind.label(),
                spec.content,
                payload.product_data,
                payload.features.join(", "),
            )),
        ];
        let text = self.writer.complete(&messages).await?;
        serde_json::from_str(strip_code_fence(&text))
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn fill_slots(
    skeleton: &str,
    palette: &Palette,
    copy: &BlockCopy,
    image: Option<&ImageAsset>,
) -> String {
    let mut html = skeleton
        .replace("{title}", &escape_html(&copy.title))
        .replace("{body}", &escape_html(&copy.body))
        .replace("{primary}", &escape_html(&palette.primary))
        .replace("{secondary}", &escape_html(&palette.secondary))
        .replace("{text}", &escape_html(&palette.text));
    if html.contains("{image}") {
        html = match image {
            Some(asset) => html.replace(
                "{image}",
                &format!(
                    "<img src=\"{}\" alt=\"{}\" loading=\"lazy\">",
                    escape_html(asset.best_url()),
                    escape_html(&copy.title),
                ),
            ),
            None => html.replace("{image}", ""),
        };
    }
    html
}

fn default_plan(payload: &TaskPayload) -> PagePlan {
    let mut blocks = vec![BlockSpec {
        kind: BlockKind::Introduction,
        concept: "Overview".into(),
        content: truncate_chars(&payload.product_data, 120),
    }];
    if !payload.features.is_empty() {
        blocks.push(BlockSpec {
            kind: BlockKind::KeyFeatures,
            concept: "Key Features".into(),
            content: payload.features.join(", "),
        });
    }
    blocks.push(BlockSpec {
        kind: BlockKind::Specifications,
        concept: "Specifications".into(),
        content: String::new(),
    });
    PagePlan {
        concept: None,
        blocks,
    }
}

/// Deterministic per-kind rendering straight from payload data.
fn render_hybrid(
    payload: &TaskPayload,
    spec: &BlockSpec,
    image: Option<&ImageAsset>,
) -> String {
    let heading = escape_html(&spec.concept);
    let product = escape_html(&payload.product_data);
    let image_tag = image
        .map(|asset| {
            format!(
                "<img src=\"{}\" alt=\"{heading}\" loading=\"lazy\">",
                escape_html(asset.best_url())
            )
        })
        .unwrap_or_default();

    match spec.kind {
        BlockKind::KeyFeatures => {
            let items: String = payload
                .features
                .iter()
                .map(|f| format!("<li>{}</li>", escape_html(f)))
                .collect();
            format!(
                "<section class=\"pd-block pd-features\"><h2>{heading}</h2>\
                 <ul>{items}</ul></section>"
            )
        }
        BlockKind::Specifications => format!(
            "<section class=\"pd-block pd-specs\"><h2>{heading}</h2>\
             <p>{product}</p></section>"
        ),
        BlockKind::Faq => {
            let audience = escape_html(payload.target_customer.as_deref().unwrap_or("everyone"));
            format!(
                "<section class=\"pd-block pd-faq\"><h2>{heading}</h2>\
                 <dl><dt>Who is this for?</dt><dd>Designed for {audience}.</dd>\
                 <dt>What is it?</dt><dd>{product}</dd></dl></section>"
            )
        }
        _ => format!(
            "<section class=\"pd-block pd-{kind}\"><h2>{heading}</h2>\
             {image_tag}<p>{product}</p></section>",
            kind = spec.kind.label().to_lowercase().replace(' ', "-"),
        ),
    }
}

fn render_gallery(spec: &BlockSpec, images: &[ImageAsset]) -> AssembledBlock {
    let items: String = images
        .iter()
        .map(|asset| {
            format!(
                "<figure><img src=\"{}\" alt=\"Product image\" loading=\"lazy\"></figure>",
                escape_html(asset.best_url())
            )
        })
        .collect();
    AssembledBlock {
        kind: BlockKind::Gallery,
        strategy: Strategy::Hybrid,
        template_id: None,
        html: format!(
            "<section class=\"pd-block pd-gallery\"><h2>{}</h2>\
             <div class=\"pd-gallery-grid\">{items}</div></section>",
            escape_html(&spec.concept),
        ),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted writer: first reply answers the plan request, later replies
    /// answer copy requests. `None` entries fail the call.
    pub struct ScriptedWriter {
        replies: Vec<Option<String>>,
        cursor: AtomicUsize,
    }

    impl ScriptedWriter {
        pub fn new(replies: Vec<Option<String>>) -> Self {
            Self {
                replies,
                cursor: AtomicUsize::new(0),
            }
        }

        pub fn offline() -> Self {
            Self::new(vec![])
        }

        /// Fails the plan call, then answers every copy call.
        pub fn copy_only() -> Self {
            Self {
                replies: vec![None],
                cursor: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CopyWriter for ScriptedWriter {
        async fn complete(&self, _messages: &[LlmMessage]) -> Result<String, LlmError> {
            let n = self.cursor.fetch_add(1, Ordering::SeqCst);
            match self.replies.get(n) {
                Some(Some(reply)) => Ok(reply.clone()),
                Some(None) => Err(LlmError::Http("scripted failure".into())),
                // Past the script: behave like a healthy copywriter.
                None if self.replies.is_empty() => Err(LlmError::Http("offline".into())),
                None => Ok("{\"title\":\"Fresh title\",\"body\":\"Fresh body\"}".into()),
            }
        }
    }
}
