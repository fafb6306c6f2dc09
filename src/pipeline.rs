use crate::assemble::ContentAssembler;
use crate::images::ImageAcquirer;
use crate::metrics;
use crate::models::{GenerationResult, Task};
use crate::storage::AssetPersister;
use crate::store::TaskStore;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Progress checkpoints reported to polling clients as each stage settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskProgress {
    Validated,
    ImagesAcquired,
    ImagesStored,
    MatchingTemplates,
    PageAssembled,
    Persisted,
}

impl TaskProgress {
    pub fn percent(self) -> u8 {
        match self {
            Self::Validated => 10,
            Self::ImagesAcquired => 35,
            Self::ImagesStored => 55,
            Self::MatchingTemplates => 70,
            Self::PageAssembled => 90,
            Self::Persisted => 100,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Validated => "validated",
            Self::ImagesAcquired => "images acquired",
            Self::ImagesStored => "images stored",
            Self::MatchingTemplates => "matching templates",
            Self::PageAssembled => "page assembled",
            Self::Persisted => "result persisted",
        }
    }
}

/// Outcome of a non-fatal stage: the value, tagged with whether fallbacks
/// absorbed anything on the way.
#[derive(Debug)]
pub enum Staged<T> {
    Ok(T),
    Degraded(T, Vec<String>),
}

impl<T> Staged<T> {
    pub fn from_reasons(value: T, reasons: Vec<String>) -> Self {
        if reasons.is_empty() {
            Self::Ok(value)
        } else {
            Self::Degraded(value, reasons)
        }
    }

    pub fn into_parts(self) -> (T, Vec<String>) {
        match self {
            Self::Ok(value) => (value, Vec::new()),
            Self::Degraded(value, reasons) => (value, reasons),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The payload cannot produce a page; retrying is pointless.
    Invalid,
    /// An upstream dependency failed in a way fallbacks could not absorb.
    Upstream,
}

/// A fatal pipeline failure, tagged with the stage that raised it. Degraded
/// stages do not produce one of these; they log, count, and continue.
#[derive(Debug)]
pub struct PipelineError {
    pub stage: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    fn invalid(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: ErrorKind::Invalid,
            message: message.into(),
        }
    }

    fn upstream(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: ErrorKind::Upstream,
            message: message.into(),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.message)
    }
}

impl std::error::Error for PipelineError {}

/// Runs one leased task through validate, image acquisition, upload,
/// template-guided assembly, and result construction. Progress is written to
/// the store between stages; a progress write failure never aborts the run.
pub struct GenerationPipeline {
    store: Arc<dyn TaskStore>,
    acquirer: ImageAcquirer,
    persister: Arc<dyn AssetPersister>,
    assembler: ContentAssembler,
}

impl GenerationPipeline {
    pub fn new(
        store: Arc<dyn TaskStore>,
        acquirer: ImageAcquirer,
        persister: Arc<dyn AssetPersister>,
        assembler: ContentAssembler,
    ) -> Self {
        Self {
            store,
            acquirer,
            persister,
            assembler,
        }
    }

    async fn report(&self, task_id: Uuid, progress: TaskProgress) {
        if let Err(err) = self
            .store
            .set_progress(task_id, progress.percent(), progress.message())
            .await
        {
            warn!(
                target = "pagecraft.pipeline",
                task_id = %task_id,
                error = %err,
                "progress update failed"
            );
        }
    }

    pub async fn run(&self, task: &Task) -> Result<GenerationResult, PipelineError> {
        let started = Instant::now();
        let payload = &task.payload;

        validate(task)?;
        self.report(task.id, TaskProgress::Validated).await;

        let stage_start = Instant::now();
        let (mut assets, acquire_reasons) = self.acquirer.acquire(payload).await.into_parts();
        metrics::stage_elapsed("images", stage_start.elapsed().as_millis());
        for reason in &acquire_reasons {
            metrics::degraded("images", reason);
        }
        if assets.is_empty() {
            return Err(PipelineError::upstream(
                "images",
                format!(
                    "image acquisition produced no images ({})",
                    acquire_reasons.join("; ")
                ),
            ));
        }
        self.report(task.id, TaskProgress::ImagesAcquired).await;

        let stage_start = Instant::now();
        let (_, upload_reasons) = self
            .persister
            .persist_all(payload.product_id, &mut assets)
            .await
            .into_parts();
        metrics::stage_elapsed("upload", stage_start.elapsed().as_millis());
        for reason in &upload_reasons {
            metrics::degraded("upload", reason);
        }
        self.report(task.id, TaskProgress::ImagesStored).await;

        self.report(task.id, TaskProgress::MatchingTemplates).await;
        let stage_start = Instant::now();
        let page = self.assembler.assemble(payload, &assets).await;
        metrics::stage_elapsed("assemble", stage_start.elapsed().as_millis());
        self.report(task.id, TaskProgress::PageAssembled).await;

        // Thumbnail is the first durably stored image; when nothing was
        // uploaded the result carries no thumbnail.
        let thumbnail = assets
            .iter()
            .find(|a| a.uploaded)
            .map(|a| a.best_url().to_string());

        let result = GenerationResult {
            product_details_id: Uuid::new_v4(),
            product_id: payload.product_id,
            html_list: page.html_list(),
            image_count: assets.len(),
            images: assets,
            thumbnail,
            used_templates: page.used_templates,
        };

        info!(
            target = "pagecraft.pipeline",
            task_id = %task.id,
            product_id = payload.product_id,
            blocks = result.html_list.len(),
            images = result.image_count,
            templates = result.used_templates.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation finished"
        );
        Ok(result)
    }
}

fn validate(task: &Task) -> Result<(), PipelineError> {
    let payload = &task.payload;
    if payload.product_data.trim().is_empty() {
        return Err(PipelineError::invalid("validate", "product_data is empty"));
    }
    if payload.user_id.trim().is_empty() {
        return Err(PipelineError::invalid("validate", "user_id is empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::{ContentAssembler, testing::ScriptedWriter};
    use crate::config::Settings;
    use crate::images::testing::ScriptedGenerator;
    use crate::models::{ImageSource, TaskPayload, TaskStatus, Tone};
    use crate::storage::testing::ScriptedPersister;
    use crate::store::{MemoryStore, TaskStore};
    use crate::templates::{RecommendationEngine, testing::ScriptedSearch};
    use std::time::Duration;

    fn payload(image_url: Option<&str>) -> TaskPayload {
        TaskPayload {
            product_id: 42,
            product_data: "Espresso machine with 15-bar pump".into(),
            product_image_url: image_url.map(str::to_string),
            features: vec!["15-bar pump".into()],
            target_customer: None,
            tone: Tone::Professional,
            user_id: "u-1".into(),
            user_session: None,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        pipeline: GenerationPipeline,
    }

    fn fixture(
        generator: ScriptedGenerator,
        persister: ScriptedPersister,
        search: ScriptedSearch,
        writer: ScriptedWriter,
    ) -> Fixture {
        let settings = Settings::default();
        let store = Arc::new(MemoryStore::new(Duration::from_secs(60)));
        let engine = RecommendationEngine::new(Arc::new(search), &settings);
        let pipeline = GenerationPipeline::new(
            store.clone(),
            ImageAcquirer::new(Arc::new(generator), &settings),
            Arc::new(persister),
            ContentAssembler::new(Arc::new(writer), Arc::new(engine)),
        );
        Fixture { store, pipeline }
    }

    async fn leased_task(store: &MemoryStore, payload: TaskPayload) -> crate::models::Task {
        store.enqueue(payload).await.unwrap();
        store.lease("w-test").await.unwrap().expect("leased")
    }

    #[tokio::test]
    async fn payload_without_image_yields_three_generated() {
        let f = fixture(
            ScriptedGenerator::always_ok(),
            ScriptedPersister { fail: false },
            ScriptedSearch::unreachable(),
            ScriptedWriter::offline(),
        );
        let task = leased_task(&f.store, payload(None)).await;
        let result = f.pipeline.run(&task).await.unwrap();

        assert_eq!(result.image_count, 3);
        assert!(
            result
                .images
                .iter()
                .all(|a| a.source == ImageSource::Generated)
        );
        assert!(!result.html_list.is_empty());
        assert_eq!(result.thumbnail, result.images[0].stored_url);
        assert!(result.thumbnail.is_some());
    }

    #[tokio::test]
    async fn valid_source_image_yields_one_original_two_generated() {
        let f = fixture(
            ScriptedGenerator::always_ok(),
            ScriptedPersister { fail: false },
            ScriptedSearch::unreachable(),
            ScriptedWriter::offline(),
        );
        let task = leased_task(&f.store, payload(Some("https://cdn.example.com/p.jpg"))).await;
        let result = f.pipeline.run(&task).await.unwrap();

        assert_eq!(result.image_count, 3);
        assert_eq!(
            result
                .images
                .iter()
                .filter(|a| a.source == ImageSource::Original)
                .count(),
            1
        );
        assert_eq!(
            result
                .images
                .iter()
                .filter(|a| a.source == ImageSource::Generated)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn unreachable_template_index_degrades_to_hybrid_page() {
        let f = fixture(
            ScriptedGenerator::always_ok(),
            ScriptedPersister { fail: false },
            ScriptedSearch::unreachable(),
            ScriptedWriter::offline(),
        );
        let task = leased_task(&f.store, payload(None)).await;
        let result = f.pipeline.run(&task).await.unwrap();

        assert!(result.used_templates.is_empty());
        assert!(!result.html_list.is_empty());
    }

    #[tokio::test]
    async fn total_image_failure_without_original_is_fatal() {
        let f = fixture(
            ScriptedGenerator::new(vec![false, false, false]),
            ScriptedPersister { fail: false },
            ScriptedSearch::unreachable(),
            ScriptedWriter::offline(),
        );
        let task = leased_task(&f.store, payload(None)).await;
        let err = f.pipeline.run(&task).await.unwrap_err();

        assert_eq!(err.stage, "images");
        assert_eq!(err.kind, ErrorKind::Upstream);
        assert!(err.message.contains("no images"));
    }

    #[tokio::test]
    async fn original_image_alone_carries_the_task() {
        // All generation calls fail but the supplied image is usable, so the
        // run still completes with a single-image page.
        let f = fixture(
            ScriptedGenerator::new(vec![false, false]),
            ScriptedPersister { fail: false },
            ScriptedSearch::unreachable(),
            ScriptedWriter::offline(),
        );
        let task = leased_task(&f.store, payload(Some("https://cdn.example.com/p.jpg"))).await;
        let result = f.pipeline.run(&task).await.unwrap();

        assert_eq!(result.image_count, 1);
        assert_eq!(result.images[0].source, ImageSource::Original);
    }

    #[tokio::test]
    async fn upload_failure_keeps_transient_urls_and_completes() {
        let f = fixture(
            ScriptedGenerator::always_ok(),
            ScriptedPersister { fail: true },
            ScriptedSearch::unreachable(),
            ScriptedWriter::offline(),
        );
        let task = leased_task(&f.store, payload(None)).await;
        let result = f.pipeline.run(&task).await.unwrap();

        assert!(result.images.iter().all(|a| !a.uploaded));
        assert!(result.images.iter().all(|a| a.stored_url.is_none()));
        // Fallback URLs keep the assets usable in the page, but the
        // thumbnail advertises only durable storage.
        assert!(result.images.iter().all(|a| !a.fallback_url.is_empty()));
        assert!(result.thumbnail.is_none());
    }

    #[tokio::test]
    async fn advanced_path_records_used_templates() {
        let f = fixture(
            ScriptedGenerator::always_ok(),
            ScriptedPersister { fail: false },
            ScriptedSearch::with(vec![("tpl-hero", 0.3)]),
            ScriptedWriter::copy_only(),
        );
        let task = leased_task(&f.store, payload(None)).await;
        let result = f.pipeline.run(&task).await.unwrap();

        assert_eq!(result.used_templates, vec!["tpl-hero".to_string()]);
    }

    #[tokio::test]
    async fn empty_product_data_is_rejected_before_any_stage() {
        let f = fixture(
            ScriptedGenerator::always_ok(),
            ScriptedPersister { fail: false },
            ScriptedSearch::unreachable(),
            ScriptedWriter::offline(),
        );
        let mut p = payload(None);
        p.product_data = "   ".into();
        let task = leased_task(&f.store, p).await;
        let err = f.pipeline.run(&task).await.unwrap_err();
        assert_eq!(err.stage, "validate");
        assert_eq!(err.kind, ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn progress_is_reported_through_the_store() {
        let f = fixture(
            ScriptedGenerator::always_ok(),
            ScriptedPersister { fail: false },
            ScriptedSearch::unreachable(),
            ScriptedWriter::offline(),
        );
        let task = leased_task(&f.store, payload(None)).await;
        f.pipeline.run(&task).await.unwrap();

        let stored = f.store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
        assert_eq!(stored.progress, Some(TaskProgress::PageAssembled.percent()));
    }

    #[test]
    fn progress_checkpoints_are_monotonic() {
        let sequence = [
            TaskProgress::Validated,
            TaskProgress::ImagesAcquired,
            TaskProgress::ImagesStored,
            TaskProgress::MatchingTemplates,
            TaskProgress::PageAssembled,
            TaskProgress::Persisted,
        ];
        assert!(
            sequence
                .windows(2)
                .all(|pair| pair[0].percent() < pair[1].percent())
        );
        assert_eq!(TaskProgress::Persisted.percent(), 100);
    }
}
