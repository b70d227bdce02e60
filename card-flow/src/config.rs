use std::path::PathBuf;
use std::time::Duration;

use crate::reconcile::ReconcileOptions;
use crate::request::RequestOptions;
use crate::transport::{AttemptBudget, BackoffPolicy, TimeoutPolicy};
use crate::types::ClozeMode;

/// Attempt count plus a size-scaled timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout: TimeoutPolicy,
}

impl RetryPolicy {
    /// Budget for a request carrying `units` images or cards.
    pub fn budget(&self, units: usize) -> AttemptBudget {
        AttemptBudget {
            max_attempts: self.max_attempts,
            timeout: self.timeout.for_units(units),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinementConfig {
    pub enabled: bool,
    pub hints: bool,
    pub grouping: bool,
    pub retry: RetryPolicy,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hints: true,
            grouping: true,
            retry: RetryPolicy {
                max_attempts: 3,
                timeout: TimeoutPolicy {
                    base: Duration::from_secs(120),
                    per_unit: Duration::from_secs(2),
                    max: Duration::from_secs(600),
                },
            },
        }
    }
}

/// Everything the document pipeline needs besides its collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    /// Slides per generation request.
    pub batch_size: usize,
    /// Continue from an existing checkpoint instead of starting over.
    pub resume: bool,
    pub cloze_mode: ClozeMode,
    pub emphasis: bool,
    pub max_completion_tokens: Option<u32>,
    pub generation: RetryPolicy,
    pub refinement: RefinementConfig,
    pub backoff: BackoffPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("anki_output"),
            batch_size: 8,
            resume: true,
            cloze_mode: ClozeMode::MultiGroup,
            emphasis: true,
            max_completion_tokens: None,
            generation: RetryPolicy {
                max_attempts: 5,
                timeout: TimeoutPolicy::default(),
            },
            refinement: RefinementConfig::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn progress_dir(&self) -> PathBuf {
        self.output_dir.join("progress")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.output_dir.join("logs")
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            cloze_mode: self.cloze_mode,
            emphasis: self.emphasis,
        }
    }

    pub fn request_options(&self, lecture_name: &str) -> RequestOptions {
        RequestOptions {
            lecture_name: lecture_name.to_string(),
            cloze_mode: self.cloze_mode,
            max_completion_tokens: self.max_completion_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refinement_gets_fewer_attempts_than_generation() {
        let config = PipelineConfig::default();
        assert_eq!(config.generation.max_attempts, 5);
        assert_eq!(config.refinement.retry.max_attempts, 3);
        assert_eq!(config.batch_size, 8);
    }

    #[test]
    fn budget_scales_timeout_with_units() {
        let config = PipelineConfig::default();
        let budget = config.generation.budget(8);
        assert_eq!(budget.max_attempts, 5);
        assert_eq!(budget.timeout, Duration::from_secs(200));
    }

    #[test]
    fn artifact_directories_live_under_output() {
        let config = PipelineConfig {
            output_dir: PathBuf::from("/tmp/cards"),
            ..Default::default()
        };
        assert_eq!(config.progress_dir(), PathBuf::from("/tmp/cards/progress"));
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/cards/logs"));
    }
}
