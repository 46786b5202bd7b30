//! Shared types, error model, validation, and configuration for newsdigest.
//!
//! This crate is the foundation depended on by all other newsdigest crates.
//! It provides:
//! - [`NewsDigestError`], the unified error type
//! - Domain types ([`StagingItem`], [`ArchivedItem`], [`Stage`], [`Status`])
//! - [`Validator`], the record checks applied before anything is persisted
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;
pub mod validate;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, HttpConfig, KeywordCategory, PipelineConfig, ScoringConfig, ScoringMode,
    SourceConfig, StorageConfig, SummarizerBackend, SummarizerConfig, ValidationConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{NewsDigestError, Result};
pub use types::{
    ArchiveRecord, ArchiveStats, ArchivedItem, Candidate, FAILURE_SENTINEL_PREFIX,
    IntegrityReport, PromotionReport, SUMMARIZE_PREFIX, Stage, StagingCounts, StagingItem, Status,
    failure_sentinel, is_failure_sentinel,
};
pub use validate::{FieldError, ValidationErrors, Validator, sanitize};
