//! News collection and article text extraction.
//!
//! This crate provides:
//! - [`sources`]: per-site listing parsers compiled from `[[sources]]` config
//! - [`extract`]: paragraph-based body text extraction
//! - [`NewsFetcher`]: the HTTP client behind the [`Collector`] and
//!   [`TextExtractor`] contracts the pipeline depends on

pub mod extract;
pub mod fetcher;
pub mod sources;

pub use fetcher::{CollectionReport, Collector, NewsFetcher, SourceTally, TextExtractor};
pub use sources::{SourceRegistry, SourceScraper};
