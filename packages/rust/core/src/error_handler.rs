//! Error and warning accounting for a pipeline run.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

/// Only this many errors get their full source chain logged.
const DETAILED_ERRORS: usize = 3;

/// Counts and logs the errors and warnings raised during a run.
#[derive(Debug, Default)]
pub struct ErrorHandler {
    errors: AtomicUsize,
    warnings: AtomicUsize,
}

/// Snapshot of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    pub errors: usize,
    pub warnings: usize,
    pub timestamp: DateTime<Utc>,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error raised in `context`.
    ///
    /// Returns whether the run should go on, which is `continue_execution`.
    pub fn handle_error(
        &self,
        err: &(dyn Error + 'static),
        context: &str,
        continue_execution: bool,
    ) -> bool {
        let n = self.errors.fetch_add(1, Ordering::Relaxed) + 1;

        if n <= DETAILED_ERRORS {
            error!(context, error = %err, chain = %SourceChain(err), "error");
        } else {
            error!(context, error = %err, "error");
        }

        if !continue_execution {
            error!(context, "stopping run after critical error");
        }
        continue_execution
    }

    /// Record a warning raised in `context`.
    pub fn handle_warning(&self, message: impl fmt::Display, context: &str) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        warn!(context, "{message}");
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            errors: self.error_count(),
            warnings: self.warning_count(),
            timestamp: Utc::now(),
        }
    }
}

/// Displays an error followed by each of its sources.
struct SourceChain<'a>(&'a (dyn Error + 'static));

impl fmt::Display for SourceChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(cause) = source {
            write!(f, ": caused by: {cause}")?;
            source = cause.source();
        }
        Ok(())
    }
}
