//! Field and record validation for everything written to the stores.
//!
//! Validation never panics and never returns a [`NewsDigestError`]: failures
//! come back as a list of per-field messages and the caller decides whether to
//! skip the record. Every accepted record is returned sanitized.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::config::ValidationConfig;
use crate::types::{ArchiveRecord, Candidate, is_failure_sentinel};

/// A single rejected field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// All field errors of one rejected record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    /// Whether a given field was rejected.
    pub fn has_field(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Collapse runs of whitespace, trim, and escape angle brackets.
pub fn sanitize(value: &str) -> String {
    static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

    WS_RE
        .replace_all(value, " ")
        .trim()
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Parse an absolute http(s) URL.
fn parse_web_url(value: &str) -> Option<Url> {
    let url = Url::parse(value.trim()).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some_and(|h| !h.is_empty()) => Some(url),
        _ => None,
    }
}

/// Record validator configured with the field limits.
#[derive(Debug, Clone)]
pub struct Validator {
    limits: ValidationConfig,
    cluster_count: u32,
}

impl Validator {
    pub fn new(limits: ValidationConfig, cluster_count: u32) -> Self {
        Self {
            limits,
            cluster_count,
        }
    }

    /// Validate a candidate about to enter the staging store.
    pub fn validate_basic(&self, candidate: &Candidate) -> Result<Candidate, ValidationErrors> {
        let mut errors = Vec::new();

        let title = self.check_title(&candidate.title, &mut errors);
        let link = self.check_link(&candidate.link, &mut errors);
        let source = self.check_source(&candidate.source, &mut errors);
        let image = self.coerce_image(candidate.image.as_deref());

        if !errors.is_empty() {
            return Err(ValidationErrors(errors));
        }

        Ok(Candidate {
            title,
            link,
            image,
            source,
        })
    }

    /// Validate a record about to enter the archive store.
    pub fn validate_complete(
        &self,
        record: &ArchiveRecord,
    ) -> Result<ArchiveRecord, ValidationErrors> {
        let mut errors = Vec::new();

        let title = self.check_title(&record.title, &mut errors);
        let link = self.check_link(&record.link, &mut errors);
        let source = self.check_source(&record.source, &mut errors);
        let image = self.coerce_image(record.image.as_deref());
        let summary = self.check_summary(&record.summary, true, &mut errors);

        if let Err(e) = self.check_cluster(record.cluster) {
            errors.push(e);
        }
        if let Some(score) = record.score {
            if !(0.0..=100.0).contains(&score) {
                errors.push(FieldError::new(
                    "score",
                    format!("must be within [0, 100], got {score}"),
                ));
            }
        }

        if !errors.is_empty() {
            return Err(ValidationErrors(errors));
        }

        Ok(ArchiveRecord {
            title,
            link,
            image,
            source,
            summary,
            cluster: record.cluster,
            score: record.score,
            status: record.status,
        })
    }

    /// Validate a summary written by the summarization stage.
    ///
    /// Failure sentinels are accepted here: they are stored so the item is
    /// excluded from later stages.
    pub fn validate_summary(&self, summary: &str) -> Result<String, ValidationErrors> {
        let mut errors = Vec::new();
        let summary = self.check_summary(summary, false, &mut errors);
        if errors.is_empty() {
            Ok(summary)
        } else {
            Err(ValidationErrors(errors))
        }
    }

    /// Validate a cluster id against the configured cluster count.
    pub fn validate_cluster(&self, cluster: i64) -> Result<i64, ValidationErrors> {
        self.check_cluster(cluster)
            .map(|()| cluster)
            .map_err(|e| ValidationErrors(vec![e]))
    }

    // -----------------------------------------------------------------------
    // Field checks
    // -----------------------------------------------------------------------

    fn check_title(&self, raw: &str, errors: &mut Vec<FieldError>) -> String {
        let title = sanitize(raw);
        if title.is_empty() {
            errors.push(FieldError::new("title", "is required"));
        } else if title.chars().count() > self.limits.max_title_length {
            errors.push(FieldError::new(
                "title",
                format!("longer than {} characters", self.limits.max_title_length),
            ));
        }
        title
    }

    fn check_link(&self, raw: &str, errors: &mut Vec<FieldError>) -> String {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            errors.push(FieldError::new("link", "is required"));
            return String::new();
        }
        let Some(url) = parse_web_url(trimmed) else {
            errors.push(FieldError::new(
                "link",
                format!("'{trimmed}' is not an absolute http(s) URL"),
            ));
            return trimmed.to_string();
        };
        let link = url.to_string();
        if link.chars().count() > self.limits.max_link_length {
            errors.push(FieldError::new(
                "link",
                format!("longer than {} characters", self.limits.max_link_length),
            ));
        }
        link
    }

    fn check_source(&self, raw: &str, errors: &mut Vec<FieldError>) -> String {
        let source = sanitize(raw);
        if source.is_empty() {
            errors.push(FieldError::new("source", "is required"));
        } else if !self.limits.allowed_sources.is_empty()
            && !self.limits.allowed_sources.iter().any(|s| *s == source)
        {
            errors.push(FieldError::new(
                "source",
                format!("'{source}' is not an allowed source"),
            ));
        }
        source
    }

    fn coerce_image(&self, raw: Option<&str>) -> Option<String> {
        let raw = raw?.trim();
        if raw.is_empty() {
            return None;
        }
        let url = parse_web_url(raw)?;
        let image = url.to_string();
        (image.chars().count() <= self.limits.max_link_length).then_some(image)
    }

    fn check_summary(
        &self,
        raw: &str,
        reject_sentinel: bool,
        errors: &mut Vec<FieldError>,
    ) -> String {
        let summary = sanitize(raw);
        if summary.is_empty() {
            errors.push(FieldError::new("summary", "is required"));
        } else if summary.chars().count() > self.limits.max_summary_length {
            errors.push(FieldError::new(
                "summary",
                format!("longer than {} characters", self.limits.max_summary_length),
            ));
        } else if reject_sentinel && is_failure_sentinel(&summary) {
            errors.push(FieldError::new("summary", "is a summarization failure marker"));
        }
        summary
    }

    fn check_cluster(&self, cluster: i64) -> Result<(), FieldError> {
        if cluster < 0 || cluster >= i64::from(self.cluster_count) {
            return Err(FieldError::new(
                "cluster",
                format!("must be within [0, {}), got {cluster}", self.cluster_count),
            ));
        }
        Ok(())
    }
}
