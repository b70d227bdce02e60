use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::PackageError;
use crate::ledger::LedgerReport;
use crate::types::{ClozeMode, SlideResult, card_count};

/// Final per-document output handed to the packager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentOutput {
    pub doc_id: String,
    pub cloze_mode: ClozeMode,
    pub results: Vec<SlideResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger: Option<LedgerReport>,
}

impl DocumentOutput {
    pub fn card_count(&self) -> usize {
        card_count(&self.results)
    }
}

/// Renders finished cards into a distributable artifact.
#[async_trait]
pub trait Packager: Send + Sync {
    /// Returns the path of the main artifact.
    async fn package(&self, output: &DocumentOutput) -> Result<PathBuf, PackageError>;
}
