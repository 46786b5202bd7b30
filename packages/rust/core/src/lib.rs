//! Core pipeline orchestration and domain logic for newsdigest.
//!
//! This crate ties together collection, summarization, clustering, scoring
//! and archival into one end-to-end digest run (see [`pipeline::Pipeline`]).

pub mod clustering;
pub mod error_handler;
pub mod pipeline;
pub mod scoring;
pub mod summarizer;
pub mod text_cache;

pub use clustering::{ClusterArtifacts, ClusterOutput, Clusterer, TfIdfKMeans};
pub use error_handler::{ErrorHandler, ErrorSummary};
pub use pipeline::{
    Pipeline, PipelineStage, ProgressReporter, RunOutcome, RunReport, SilentProgress,
};
pub use scoring::{ScoredItem, ScoringEngine};
pub use summarizer::{BridgeSummarizer, LeadSummarizer, Summarizer};
pub use text_cache::{CacheStats, TextCache};
