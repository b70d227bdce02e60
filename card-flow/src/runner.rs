//! Document and collection drivers.
//!
//! [`DocumentPipeline`] owns the _load → generate → checkpoint → refine → package
//! → clear_ sequence for one document. A run can be interrupted at any point; the
//! next run picks up from the last saved checkpoint and only asks for the slides
//! that are still missing. [`CollectionRunner`] repeats that over a queue of
//! documents and remembers which ones are already done.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span, warn};

use crate::client::CompletionClient;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::ledger::{LedgerArtifacts, LedgerReport};
use crate::orchestrator::RefinementOrchestrator;
use crate::package::{DocumentOutput, Packager};
use crate::reconcile::reconcile;
use crate::request::build_generation;
use crate::storage::{CollectionProgress, CollectionStore, ProgressRecord, ProgressStore};
use crate::transport::RetryingTransport;
use crate::types::{Slide, SlideResult, card_count, flatten_cards, group_by_slide};

/// Where a document's slides come from.
#[async_trait]
pub trait SlideSource: Send + Sync {
    /// Stable identifier, used for checkpoints and artifact names.
    fn doc_id(&self) -> &str;

    /// Name shown to the model in prompts.
    fn lecture_name(&self) -> &str {
        self.doc_id()
    }

    async fn render(&self) -> Result<Vec<Slide>>;
}

/// What a successful document run produced.
#[derive(Debug, Clone)]
pub struct DocumentOutcome {
    pub doc_id: String,
    pub total_slides: usize,
    /// Slides generated during this run (the rest came from the checkpoint).
    pub generated_slides: usize,
    pub card_count: usize,
    pub artifact: PathBuf,
    pub ledger: Option<LedgerArtifacts>,
    pub refinement_aborted: bool,
}

pub struct DocumentPipeline {
    config: PipelineConfig,
    transport: RetryingTransport,
    orchestrator: RefinementOrchestrator,
    store: Arc<dyn ProgressStore>,
    packager: Arc<dyn Packager>,
}

impl DocumentPipeline {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        store: Arc<dyn ProgressStore>,
        packager: Arc<dyn Packager>,
        config: PipelineConfig,
    ) -> Self {
        let transport = RetryingTransport::new(client).with_backoff(config.backoff);
        Self::with_transport(transport, store, packager, config)
    }

    pub fn with_transport(
        transport: RetryingTransport,
        store: Arc<dyn ProgressStore>,
        packager: Arc<dyn Packager>,
        config: PipelineConfig,
    ) -> Self {
        let orchestrator = RefinementOrchestrator::new(transport.clone(), &config);
        Self {
            config,
            transport,
            orchestrator,
            store,
            packager,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_document(&self, source: &dyn SlideSource) -> Result<DocumentOutcome> {
        let doc_id = source.doc_id().to_string();
        let span = info_span!("document", doc_id = %doc_id);
        self.run_document_inner(source, &doc_id).instrument(span).await
    }

    async fn run_document_inner(
        &self,
        source: &dyn SlideSource,
        doc_id: &str,
    ) -> Result<DocumentOutcome> {
        let slides = ordered_slides(source.render().await?);
        let page_ids: Vec<u32> = slides.iter().map(|s| s.page_id).collect();
        info!(slides = slides.len(), mode = self.config.cloze_mode.describe(), "Processing document");

        let mut record = self.load_or_start(doc_id, slides.len()).await?;

        let pending: Vec<Slide> = slides
            .into_iter()
            .filter(|slide| !record.is_completed(slide.page_id))
            .collect();
        if !pending.is_empty() && !record.completed_slide_ids.is_empty() {
            info!(
                completed = record.completed_slide_ids.len(),
                remaining = pending.len(),
                "Resuming from checkpoint"
            );
        }

        let generated_slides = pending.len();
        self.generate(doc_id, source.lecture_name(), &pending, &mut record)
            .await?;

        let mut ledger_report: Option<LedgerReport> = None;
        let mut ledger_artifacts = None;
        let mut refinement_aborted = false;

        let results = match record.refined_results.clone() {
            Some(refined) => {
                info!("Reusing refined cards from checkpoint");
                refined
            }
            None => {
                let generated = record.accumulated_results.clone();
                if self.config.refinement.enabled && card_count(&generated) > 0 {
                    let run = self
                        .orchestrator
                        .run(
                            doc_id,
                            flatten_cards(&generated),
                            &self.config.request_options(source.lecture_name()),
                        )
                        .await;
                    refinement_aborted = run.aborted;

                    match run.ledger.write(&self.config.log_dir()).await {
                        Ok(artifacts) => ledger_artifacts = Some(artifacts),
                        Err(e) => warn!(error = %e, "Could not write refinement log"),
                    }
                    ledger_report = Some(run.ledger.report());

                    let refined = group_by_slide(run.cards, page_ids.iter().copied());
                    record.refined_results = Some(refined.clone());
                    self.store.save(&record).await?;
                    refined
                } else {
                    generated
                }
            }
        };

        let output = DocumentOutput {
            doc_id: doc_id.to_string(),
            cloze_mode: self.config.cloze_mode,
            results,
            ledger: ledger_report,
        };
        let artifact = self.packager.package(&output).await.map_err(|e| {
            error!(error = %e, "Packaging failed, keeping checkpoint");
            PipelineError::from(e)
        })?;

        self.store.clear(doc_id).await?;
        info!(cards = output.card_count(), artifact = %artifact.display(), "Document complete");

        Ok(DocumentOutcome {
            doc_id: doc_id.to_string(),
            total_slides: page_ids.len(),
            generated_slides,
            card_count: output.card_count(),
            artifact,
            ledger: ledger_artifacts,
            refinement_aborted,
        })
    }

    async fn load_or_start(&self, doc_id: &str, total_slides: usize) -> Result<ProgressRecord> {
        if !self.config.resume {
            self.store.clear(doc_id).await?;
            return Ok(ProgressRecord::new(doc_id, total_slides, self.config.cloze_mode));
        }

        match self.store.load(doc_id).await? {
            Some(record)
                if record.total_slides == total_slides
                    && record.cloze_mode == self.config.cloze_mode =>
            {
                Ok(record)
            }
            Some(record) => {
                warn!(
                    checkpoint_slides = record.total_slides,
                    document_slides = total_slides,
                    checkpoint_mode = ?record.cloze_mode,
                    "Checkpoint does not match the document, starting over"
                );
                self.store.clear(doc_id).await?;
                Ok(ProgressRecord::new(doc_id, total_slides, self.config.cloze_mode))
            }
            None => Ok(ProgressRecord::new(doc_id, total_slides, self.config.cloze_mode)),
        }
    }

    /// Generate cards for `pending` batch by batch, saving the checkpoint after each.
    async fn generate(
        &self,
        doc_id: &str,
        lecture_name: &str,
        pending: &[Slide],
        record: &mut ProgressRecord,
    ) -> Result<()> {
        let options = self.config.request_options(lecture_name);
        let reconcile_options = self.config.reconcile_options();
        let batch_size = self.config.batch_size.max(1);
        let batches = pending.len().div_ceil(batch_size);

        for (number, batch) in pending.chunks(batch_size).enumerate() {
            let request = build_generation(batch, &options);
            let page_ids = request.page_ids();
            info!(
                batch = number + 1,
                batches,
                first = page_ids.first().copied(),
                last = page_ids.last().copied(),
                "Generating cards"
            );

            let results: Vec<SlideResult> = self
                .transport
                .execute_with(&request, self.config.generation.budget(batch.len()), |text| {
                    reconcile(text, &page_ids, &reconcile_options)
                })
                .await
                .map_err(|source| {
                    error!(batch = number + 1, error = %source, "Batch failed, checkpoint kept");
                    PipelineError::Generation {
                        doc_id: doc_id.to_string(),
                        source,
                    }
                })?;

            info!(batch = number + 1, cards = card_count(&results), "Batch complete");
            record.absorb(results);
            self.store.save(record).await?;
        }
        Ok(())
    }
}

/// Sort by page id and drop repeated ids.
fn ordered_slides(mut slides: Vec<Slide>) -> Vec<Slide> {
    slides.sort_by_key(|s| s.page_id);
    let before = slides.len();
    slides.dedup_by_key(|s| s.page_id);
    if slides.len() != before {
        warn!(dropped = before - slides.len(), "Ignoring slides with repeated page ids");
    }
    slides
}

/// Per-collection result. Failed documents carry the error message.
#[derive(Debug, Default)]
pub struct CollectionSummary {
    pub completed: Vec<DocumentOutcome>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub all_complete: bool,
}

/// Runs a queue of documents one after another.
pub struct CollectionRunner {
    pipeline: DocumentPipeline,
    store: CollectionStore,
}

impl CollectionRunner {
    pub fn new(pipeline: DocumentPipeline, store: CollectionStore) -> Self {
        Self { pipeline, store }
    }

    /// Process every source not already recorded as complete. A failing document
    /// is logged and the queue moves on.
    pub async fn run(&self, sources: &[Arc<dyn SlideSource>]) -> CollectionSummary {
        let mut progress = if self.pipeline.config().resume {
            self.store.load().await.unwrap_or_default()
        } else {
            if let Err(e) = self.store.clear().await {
                warn!(error = %e, "Could not clear collection checkpoint");
            }
            CollectionProgress::default()
        };
        progress.total_docs = sources.len();

        let mut summary = CollectionSummary::default();
        for (position, source) in sources.iter().enumerate() {
            let doc_id = source.doc_id();
            if progress.completed_doc_ids.contains(doc_id) {
                info!(doc_id, "Already complete, skipping");
                summary.skipped.push(doc_id.to_string());
                continue;
            }

            info!(doc_id, document = position + 1, total = sources.len(), "Starting document");
            match self.pipeline.run_document(source.as_ref()).await {
                Ok(outcome) => {
                    progress.completed_doc_ids.insert(doc_id.to_string());
                    progress.updated_at = chrono::Utc::now();
                    if let Err(e) = self.store.save(&progress).await {
                        warn!(doc_id, error = %e, "Could not save collection checkpoint");
                    }
                    summary.completed.push(outcome);
                }
                Err(e) => {
                    error!(doc_id, error = %e, "Document failed, continuing with the next one");
                    summary.failed.push((doc_id.to_string(), e.to_string()));
                }
            }
        }

        let wanted: BTreeSet<&str> = sources.iter().map(|s| s.doc_id()).collect();
        summary.all_complete = wanted
            .iter()
            .all(|id| progress.completed_doc_ids.contains(*id));
        if summary.all_complete {
            if let Err(e) = self.store.clear().await {
                warn!(error = %e, "Could not clear collection checkpoint");
            }
        }

        info!(
            completed = summary.completed.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "Collection finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientResponse;
    use crate::error::PackageError;
    use crate::ledger::StageKind;
    use crate::request::{GenerationRequest, RequestMode};
    use crate::storage::InMemoryProgressStore;
    use crate::testing::{MockClient, RecordingSleeper};
    use std::sync::Mutex;

    struct StaticSource {
        doc_id: String,
        page_ids: Vec<u32>,
        fail: bool,
    }

    impl StaticSource {
        fn new(doc_id: &str, page_ids: &[u32]) -> Self {
            Self {
                doc_id: doc_id.to_string(),
                page_ids: page_ids.to_vec(),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl SlideSource for StaticSource {
        fn doc_id(&self) -> &str {
            &self.doc_id
        }

        async fn render(&self) -> Result<Vec<Slide>> {
            if self.fail {
                return Err(PipelineError::Render {
                    doc_id: self.doc_id.clone(),
                    reason: "not a PDF".into(),
                });
            }
            Ok(self
                .page_ids
                .iter()
                .map(|id| Slide::png(*id, vec![*id as u8]))
                .collect())
        }
    }

    #[derive(Default)]
    struct CapturingPackager {
        fail: bool,
        outputs: Mutex<Vec<DocumentOutput>>,
    }

    impl CapturingPackager {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn outputs(&self) -> Vec<DocumentOutput> {
            self.outputs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Packager for CapturingPackager {
        async fn package(&self, output: &DocumentOutput) -> Result<PathBuf, PackageError> {
            if self.fail {
                return Err(PackageError::Other("disk full".into()));
            }
            self.outputs.lock().unwrap().push(output.clone());
            Ok(PathBuf::from(format!("{}_cards.json", output.doc_id)))
        }
    }

    /// Answers generation requests with one card per requested slide, except
    /// for the slides in `omit`.
    fn generation_reply(request: &GenerationRequest, omit: &[u32]) -> String {
        let entries: Vec<String> = request
            .page_ids()
            .into_iter()
            .filter(|id| !omit.contains(id))
            .map(|id| {
                format!(
                    r#"{{"page_id": {id}, "cards": [{{"text": "{{{{c1::Fact {id}}}}} from slide {id}", "facts": ["Fact {id}"]}}]}}"#
                )
            })
            .collect();
        format!("```json\n[{}]\n```", entries.join(","))
    }

    fn config(dir: &std::path::Path) -> PipelineConfig {
        let mut config = PipelineConfig {
            output_dir: dir.to_path_buf(),
            emphasis: false,
            ..Default::default()
        };
        config.refinement.enabled = false;
        config
    }

    fn pipeline(
        client: Arc<MockClient>,
        store: Arc<dyn ProgressStore>,
        packager: Arc<dyn Packager>,
        config: PipelineConfig,
    ) -> DocumentPipeline {
        let transport =
            RetryingTransport::new(client).with_sleeper(Arc::new(RecordingSleeper::default()));
        DocumentPipeline::with_transport(transport, store, packager, config)
    }

    #[tokio::test]
    async fn missing_slide_is_covered_by_an_empty_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MockClient::new(|request| {
            Ok(ClientResponse::ok(generation_reply(request, &[2])))
        }));
        let store = Arc::new(InMemoryProgressStore::new());
        let packager = Arc::new(CapturingPackager::default());

        let outcome = pipeline(client.clone(), store.clone(), packager.clone(), config(dir.path()))
            .run_document(&StaticSource::new("cardio", &[1, 2, 3]))
            .await
            .unwrap();

        assert_eq!(client.call_count(), 1);
        assert_eq!(outcome.total_slides, 3);
        assert_eq!(outcome.card_count, 2);
        let output = &packager.outputs()[0];
        let ids: Vec<_> = output.results.iter().map(|r| r.page_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(output.results[1].cards.is_empty());
        assert!(!store.contains("cardio"));
    }

    #[tokio::test]
    async fn resume_only_requests_remaining_slides() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MockClient::new(|request| {
            Ok(ClientResponse::ok(generation_reply(request, &[])))
        }));
        let store = Arc::new(InMemoryProgressStore::new());
        let mut record = ProgressRecord::new("renal", 4, Default::default());
        record.absorb(vec![
            SlideResult {
                page_id: 1,
                cards: vec![crate::types::CardRecord::new(1, "{{c1::Nephron}} is the unit")],
            },
            SlideResult::empty(2),
        ]);
        store.save(&record).await.unwrap();
        let packager = Arc::new(CapturingPackager::default());

        let outcome = pipeline(client.clone(), store.clone(), packager.clone(), config(dir.path()))
            .run_document(&StaticSource::new("renal", &[1, 2, 3, 4]))
            .await
            .unwrap();

        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].page_ids(), vec![3, 4]);
        assert_eq!(outcome.generated_slides, 2);
        assert_eq!(outcome.card_count, 3);
        assert_eq!(packager.outputs()[0].results[0].cards[0].text, "{{c1::Nephron}} is the unit");
    }

    #[tokio::test]
    async fn no_resume_discards_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MockClient::new(|request| {
            Ok(ClientResponse::ok(generation_reply(request, &[])))
        }));
        let store = Arc::new(InMemoryProgressStore::new());
        let mut record = ProgressRecord::new("renal", 2, Default::default());
        record.absorb(vec![SlideResult::empty(1)]);
        store.save(&record).await.unwrap();

        let mut config = config(dir.path());
        config.resume = false;
        pipeline(client.clone(), store, Arc::new(CapturingPackager::default()), config)
            .run_document(&StaticSource::new("renal", &[1, 2]))
            .await
            .unwrap();

        assert_eq!(client.calls()[0].page_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn exhausted_batch_aborts_and_keeps_earlier_batches() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MockClient::new(|request| {
            if request.page_ids().contains(&2) {
                Ok(ClientResponse::status(503, "overloaded"))
            } else {
                Ok(ClientResponse::ok(generation_reply(request, &[])))
            }
        }));
        let store = Arc::new(InMemoryProgressStore::new());
        let mut config = config(dir.path());
        config.batch_size = 1;
        config.generation.max_attempts = 2;

        let err = pipeline(client.clone(), store.clone(), Arc::new(CapturingPackager::default()), config)
            .run_document(&StaticSource::new("neuro", &[1, 2, 3]))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Generation { ref doc_id, .. } if doc_id == "neuro"));
        assert_eq!(client.call_count(), 3);
        let record = store.load("neuro").await.unwrap().unwrap();
        assert_eq!(record.completed_slide_ids, BTreeSet::from([1]));
    }

    #[tokio::test]
    async fn packaging_failure_keeps_checkpoint_and_refined_cards() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MockClient::new(|request| {
            Ok(ClientResponse::ok(match request.mode {
                RequestMode::Generation => generation_reply(request, &[]),
                RequestMode::Stage(StageKind::Refine) => r#"{"cards": [
                    {"source_slide": 1, "text": "{{c1::Fact 1}} and {{c2::Fact 2}}", "from": [0, 1]}
                ], "decisions": [{"action": "merged", "indices": [0, 1], "reason": "overlap"}]}"#
                    .to_string(),
                RequestMode::Stage(_) => "[]".to_string(),
            }))
        }));
        let store = Arc::new(InMemoryProgressStore::new());
        let mut config = config(dir.path());
        config.refinement.enabled = true;

        let err = pipeline(client.clone(), store.clone(), Arc::new(CapturingPackager::failing()), config.clone())
            .run_document(&StaticSource::new("gi", &[1, 2]))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Package(_)));

        let record = store.load("gi").await.unwrap().unwrap();
        assert_eq!(record.completed_slide_ids, BTreeSet::from([1, 2]));
        let refined = record.refined_results.expect("refined cards are checkpointed");
        assert_eq!(card_count(&refined), 1);
        assert!(dir.path().join("logs").join("gi_refinement_log.json").exists());

        let calls_before_retry = client.call_count();
        let packager = Arc::new(CapturingPackager::default());
        let outcome = pipeline(client.clone(), store.clone(), packager.clone(), config)
            .run_document(&StaticSource::new("gi", &[1, 2]))
            .await
            .unwrap();

        assert_eq!(client.call_count(), calls_before_retry);
        assert_eq!(outcome.card_count, 1);
        assert_eq!(packager.outputs()[0].results.len(), 2);
        assert!(!store.contains("gi"));
    }

    #[tokio::test]
    async fn collection_continues_past_a_failing_document() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MockClient::new(|request| {
            Ok(ClientResponse::ok(generation_reply(request, &[])))
        }));
        let collection_store = CollectionStore::new(dir.path().join("progress"));
        let runner = CollectionRunner::new(
            pipeline(
                client,
                Arc::new(InMemoryProgressStore::new()),
                Arc::new(CapturingPackager::default()),
                config(dir.path()),
            ),
            collection_store.clone(),
        );

        let mut broken = StaticSource::new("broken", &[1]);
        broken.fail = true;
        let sources: Vec<Arc<dyn SlideSource>> = vec![
            Arc::new(broken),
            Arc::new(StaticSource::new("fine", &[1, 2])),
        ];

        let summary = runner.run(&sources).await;
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "broken");
        assert_eq!(summary.completed.len(), 1);
        assert!(!summary.all_complete);
        let progress = collection_store.load().await.unwrap();
        assert!(progress.completed_doc_ids.contains("fine"));

        let sources: Vec<Arc<dyn SlideSource>> = vec![
            Arc::new(StaticSource::new("broken", &[1])),
            Arc::new(StaticSource::new("fine", &[1, 2])),
        ];
        let summary = runner.run(&sources).await;
        assert_eq!(summary.skipped, vec!["fine".to_string()]);
        assert!(summary.all_complete);
        assert!(!collection_store.path().exists());
    }
}
