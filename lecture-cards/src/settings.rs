use card_flow::{ClozeMode, PipelineConfig};
use clap::Parser;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "o3";

/// Turn lecture slide PDFs into cloze flash cards.
#[derive(Debug, Clone, Parser)]
#[command(name = "lecture-cards", version, about)]
pub struct Cli {
    /// A PDF file, or a folder whose PDFs are processed one after another
    pub input: PathBuf,

    /// Directory for cards, checkpoints and refinement logs
    #[arg(long, env = "CARDS_OUTPUT_DIR", default_value = "anki_output")]
    pub output: PathBuf,

    /// Use {{c1::}} for every blank so each note yields one card
    #[arg(long)]
    pub single_card: bool,

    /// Ignore existing checkpoints and start over
    #[arg(long)]
    pub no_resume: bool,

    /// Skip the refinement stages entirely
    #[arg(long)]
    pub no_refine: bool,

    /// Skip the hint stage
    #[arg(long)]
    pub no_hints: bool,

    /// Skip the cloze grouping stage
    #[arg(long)]
    pub no_grouping: bool,

    /// Slides per generation request
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u16).range(1..))]
    pub batch_size: u16,

    /// Render resolution for PDF pages
    #[arg(long, default_value_t = 150)]
    pub dpi: u32,

    #[arg(long, env = "LLM_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    #[arg(long, env = "LLM_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    #[arg(long, env = "LLM_MAX_COMPLETION_TOKENS")]
    pub max_completion_tokens: Option<u32>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("OPENAI_API_KEY environment variable is required")]
    MissingApiKey,
    #[error("input path does not exist: {0}")]
    MissingInput(PathBuf),
}

/// Resolved run settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub input: PathBuf,
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub dpi: u32,
    pub pipeline: PipelineConfig,
}

impl Settings {
    /// Read the API key from `OPENAI_API_KEY` and merge it with the parsed flags.
    pub fn from_env(cli: Cli) -> Result<Self, SettingsError> {
        Self::resolve(cli, std::env::var("OPENAI_API_KEY").ok())
    }

    pub fn resolve(cli: Cli, api_key: Option<String>) -> Result<Self, SettingsError> {
        let api_key = api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or(SettingsError::MissingApiKey)?;
        if !cli.input.exists() {
            return Err(SettingsError::MissingInput(cli.input));
        }

        let mut pipeline = PipelineConfig {
            output_dir: cli.output,
            batch_size: usize::from(cli.batch_size),
            resume: !cli.no_resume,
            cloze_mode: if cli.single_card {
                ClozeMode::SingleGroup
            } else {
                ClozeMode::MultiGroup
            },
            max_completion_tokens: cli.max_completion_tokens,
            ..Default::default()
        };
        pipeline.refinement.enabled = !cli.no_refine;
        pipeline.refinement.hints = !cli.no_hints;
        pipeline.refinement.grouping = !cli.no_grouping;

        Ok(Self {
            input: cli.input,
            api_key,
            api_url: cli.api_url,
            model: cli.model,
            dpi: cli.dpi,
            pipeline,
        })
    }
}
