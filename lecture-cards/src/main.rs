use anyhow::{Context, Result, bail};
use card_flow::{
    CollectionRunner, CollectionStore, DocumentPipeline, FileProgressStore, HttpCompletionClient,
    SlideSource,
};
use clap::Parser;
use lecture_cards::export::ReferencePackager;
use lecture_cards::render::{PdfSlideSource, discover_pdfs};
use lecture_cards::settings::{Cli, Settings};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing; `LOG_FORMAT=json` switches to structured output.
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "lecture_cards=info,card_flow=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let settings = Settings::from_env(Cli::parse())?;
    let config = settings.pipeline.clone();
    info!(
        input = %settings.input.display(),
        output = %config.output_dir.display(),
        model = %settings.model,
        mode = config.cloze_mode.describe(),
        resume = config.resume,
        refine = config.refinement.enabled,
        "Starting lecture-cards"
    );

    let client = Arc::new(HttpCompletionClient::new(
        settings.api_url.clone(),
        settings.api_key.clone(),
        settings.model.clone(),
    ));
    let store = Arc::new(FileProgressStore::new(config.progress_dir()));
    let packager = Arc::new(ReferencePackager::new(config.output_dir.clone()));
    let pipeline = DocumentPipeline::new(client, store, packager, config.clone());

    if settings.input.is_dir() {
        let pdfs = discover_pdfs(&settings.input)
            .with_context(|| format!("failed to list {}", settings.input.display()))?;
        if pdfs.is_empty() {
            bail!("no PDF files found in {}", settings.input.display());
        }
        info!(documents = pdfs.len(), "Processing folder");

        let sources: Vec<Arc<dyn SlideSource>> = pdfs
            .into_iter()
            .map(|path| Arc::new(PdfSlideSource::new(path, settings.dpi)) as Arc<dyn SlideSource>)
            .collect();
        let runner = CollectionRunner::new(pipeline, CollectionStore::new(config.progress_dir()));
        let summary = runner.run(&sources).await;

        for (doc_id, reason) in &summary.failed {
            warn!(doc_id = %doc_id, reason = %reason, "Document not finished");
        }
        if !summary.failed.is_empty() {
            bail!(
                "{} of {} documents failed; progress is saved, rerun to resume",
                summary.failed.len(),
                sources.len()
            );
        }
    } else {
        let is_pdf = settings
            .input
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if !is_pdf {
            bail!("{} is not a PDF file or folder", settings.input.display());
        }

        let source = PdfSlideSource::new(&settings.input, settings.dpi);
        let outcome = pipeline
            .run_document(&source)
            .await
            .with_context(|| format!("failed to process {}", source.path().display()))?;
        info!(
            doc_id = %outcome.doc_id,
            cards = outcome.card_count,
            artifact = %outcome.artifact.display(),
            "Done"
        );
    }

    Ok(())
}
