//! End-to-end digest run: preflight → collect → extract → summarize →
//! cluster → select → cleanup.
//!
//! Only a failed preflight, run-lock contention and a mandatory stage that
//! produces nothing abort a run. Everything else is counted by the
//! [`ErrorHandler`] and the run goes on.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use newsdigest_crawler::{Collector, SourceTally, TextExtractor};
use newsdigest_shared::{
    AppConfig, ArchiveRecord, ArchiveStats, NewsDigestError, PromotionReport, Result,
    StagingCounts, Status, failure_sentinel,
};
use newsdigest_storage::{ArchiveStore, InsertOutcome, StagingStore};

use crate::clustering::{ClusterArtifacts, Clusterer, cluster_sizes};
use crate::error_handler::{ErrorHandler, ErrorSummary};
use crate::scoring::{ScoringEngine, cluster_relevance};
use crate::summarizer::Summarizer;
use crate::text_cache::TextCache;

/// Highest score the archive accepts.
const MAX_ARCHIVED_SCORE: u32 = 100;

/// Top terms logged per cluster.
const TOP_TERMS_PER_CLUSTER: usize = 5;

// ---------------------------------------------------------------------------
// Stages and outcome
// ---------------------------------------------------------------------------

/// Position of a run in the stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    PreflightCheck,
    Collecting,
    Extracting,
    Summarizing,
    Clustering,
    Selecting,
    Cleanup,
    Done,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreflightCheck => "preflight_check",
            Self::Collecting => "collecting",
            Self::Extracting => "extracting",
            Self::Summarizing => "summarizing",
            Self::Clustering => "clustering",
            Self::Selecting => "selecting",
            Self::Cleanup => "cleanup",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted { stage: PipelineStage, reason: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Everything a run produced, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    /// Candidates found per source.
    pub collection: BTreeMap<String, SourceTally>,
    /// Article bodies extracted per source.
    pub extraction: BTreeMap<String, SourceTally>,
    pub collected: usize,
    pub staged: usize,
    pub extracted: usize,
    pub summarized: usize,
    pub summary_failures: usize,
    pub clustered: usize,
    pub cluster_sizes: BTreeMap<i64, usize>,
    /// Mean relevance of the selected items per cluster.
    pub cluster_relevance: BTreeMap<i64, f64>,
    pub selected: usize,
    pub promotion: Option<PromotionReport>,
    /// Staging counts right before cleanup.
    pub staging: Option<StagingCounts>,
    pub purged: bool,
    pub archive: Option<ArchiveStats>,
    #[serde(skip)]
    pub artifacts: Option<Arc<ClusterArtifacts>>,
    pub errors: ErrorSummary,
    pub elapsed: Duration,
}

impl RunReport {
    fn new(run_id: String, errors: ErrorSummary) -> Self {
        Self {
            run_id,
            outcome: RunOutcome::Completed,
            collection: BTreeMap::new(),
            extraction: BTreeMap::new(),
            collected: 0,
            staged: 0,
            extracted: 0,
            summarized: 0,
            summary_failures: 0,
            clustered: 0,
            cluster_sizes: BTreeMap::new(),
            cluster_relevance: BTreeMap::new(),
            selected: 0,
            promotion: None,
            staging: None,
            purged: false,
            archive: None,
            artifacts: None,
            errors,
            elapsed: Duration::ZERO,
        }
    }
}

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new stage.
    fn stage(&self, stage: PipelineStage);
    /// Called after each article of a per-article stage.
    fn item_done(&self, stage: PipelineStage, current: usize, total: usize);
    /// Called once the run has ended.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage(&self, _stage: PipelineStage) {}
    fn item_done(&self, _stage: PipelineStage, _current: usize, _total: usize) {}
    fn done(&self, _report: &RunReport) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The collaborators of a run. Built once at startup and borrowed.
pub struct Pipeline<'a> {
    pub config: &'a AppConfig,
    pub staging: &'a StagingStore,
    pub archive: &'a ArchiveStore,
    pub cache: &'a TextCache,
    pub collector: &'a dyn Collector,
    pub extractor: &'a dyn TextExtractor,
    pub clusterer: &'a dyn Clusterer,
    pub scoring: &'a ScoringEngine,
}

/// Why a run stopped early.
struct Abort {
    stage: PipelineStage,
    reason: String,
}

impl Abort {
    fn new(stage: PipelineStage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

type StageResult = std::result::Result<(), Abort>;

/// Mutable state threaded through the stages of one run.
struct RunState<'p> {
    report: RunReport,
    errors: ErrorHandler,
    progress: &'p dyn ProgressReporter,
}

impl RunState<'_> {
    /// Count a fatal error and turn it into an abort of `stage`.
    fn fatal(&self, stage: PipelineStage, err: &NewsDigestError) -> Abort {
        self.errors.handle_error(err, stage.as_str(), false);
        Abort::new(stage, err.to_string())
    }
}

impl Pipeline<'_> {
    /// Execute one full run.
    ///
    /// Never returns an error: the outcome and the error counts are in the
    /// report. The summarizer is shut down once summarization is over.
    #[instrument(skip_all, fields(run_id = tracing::field::Empty))]
    pub async fn run(
        &self,
        summarizer: &mut dyn Summarizer,
        progress: &dyn ProgressReporter,
    ) -> RunReport {
        let start = Instant::now();
        let run_id = Uuid::now_v7().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());

        let errors = ErrorHandler::new();
        let mut state = RunState {
            report: RunReport::new(run_id.clone(), errors.summary()),
            errors,
            progress,
        };

        info!(summarizer = summarizer.name(), "starting digest run");

        progress.stage(PipelineStage::PreflightCheck);
        let stale_after = Duration::from_secs(self.config.storage.lock_stale_after_secs);
        let result = match self.archive.acquire_run_lock(&run_id, stale_after).await {
            Ok(()) => {
                let result = self.run_stages(&mut state, summarizer).await;
                match self.archive.release_run_lock(&run_id).await {
                    Ok(true) => debug!("run lock released"),
                    Ok(false) => state
                        .errors
                        .handle_warning("run lock was taken over during the run", "cleanup"),
                    Err(e) => {
                        state.errors.handle_error(&e, "cleanup", true);
                    }
                }
                result
            }
            Err(e) => Err(state.fatal(PipelineStage::PreflightCheck, &e)),
        };

        let mut report = state.report;
        match result {
            Ok(()) => {
                progress.stage(PipelineStage::Done);
                report.outcome = RunOutcome::Completed;
            }
            Err(abort) => {
                warn!(stage = %abort.stage, reason = %abort.reason, "run aborted");
                report.outcome = RunOutcome::Aborted {
                    stage: abort.stage,
                    reason: abort.reason,
                };
            }
        }
        report.errors = state.errors.summary();
        report.elapsed = start.elapsed();

        info!(
            outcome = ?report.outcome,
            errors = report.errors.errors,
            warnings = report.errors.warnings,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "digest run finished"
        );
        progress.done(&report);
        report
    }

    async fn run_stages(
        &self,
        state: &mut RunState<'_>,
        summarizer: &mut dyn Summarizer,
    ) -> StageResult {
        // --- Phase 1: Preflight ---
        self.preflight(state).await?;

        // --- Phase 2: Collection ---
        state.progress.stage(PipelineStage::Collecting);
        self.collect(state).await?;

        // --- Phase 3: Extraction ---
        state.progress.stage(PipelineStage::Extracting);
        self.extract(state).await?;

        // --- Phase 4: Summarization ---
        state.progress.stage(PipelineStage::Summarizing);
        let summarized = self.summarize(state, summarizer).await;
        summarizer.shutdown();
        summarized?;

        // --- Phase 5: Clustering ---
        state.progress.stage(PipelineStage::Clustering);
        self.cluster(state).await?;

        // --- Phase 6: Selection ---
        state.progress.stage(PipelineStage::Selecting);
        if let Err(e) = self.select(state).await {
            state
                .errors
                .handle_error(&e, PipelineStage::Selecting.as_str(), true);
        }

        // --- Phase 7: Cleanup ---
        state.progress.stage(PipelineStage::Cleanup);
        self.cleanup(state).await;
        Ok(())
    }

    /// Check both stores, then start from an empty staging store and cache.
    #[instrument(skip_all)]
    async fn preflight(&self, state: &mut RunState<'_>) -> StageResult {
        let mut integrity = self.staging.integrity_check().await;
        integrity.merge(self.archive.integrity_check().await);

        for warning in &integrity.warnings {
            state
                .errors
                .handle_warning(warning, PipelineStage::PreflightCheck.as_str());
        }
        if !integrity.is_ok() {
            let err = NewsDigestError::Integrity {
                errors: integrity.errors,
            };
            return Err(state.fatal(PipelineStage::PreflightCheck, &err));
        }

        self.cache.clear();
        if !self.staging.purge().await {
            state.errors.handle_warning(
                "staging store could not be emptied before the run",
                PipelineStage::PreflightCheck.as_str(),
            );
        }
        info!("preflight check passed");
        Ok(())
    }

    #[instrument(skip_all)]
    async fn collect(&self, state: &mut RunState<'_>) -> StageResult {
        let stage = PipelineStage::Collecting;
        let collection = self.collector.collect().await;

        for (source, message) in &collection.errors {
            let err = NewsDigestError::Network(format!("{source}: {message}"));
            state.errors.handle_error(&err, stage.as_str(), true);
        }

        state.report.collected = collection.candidates.len();
        state.report.collection = collection.per_source;

        if collection.candidates.is_empty() {
            return Err(Abort::new(stage, "no candidates were collected"));
        }

        let mut duplicates = 0usize;
        for candidate in &collection.candidates {
            match self.staging.insert_collected(candidate).await {
                Ok(InsertOutcome::Inserted) => state.report.staged += 1,
                Ok(InsertOutcome::Duplicate) => duplicates += 1,
                Ok(InsertOutcome::Invalid(errors)) => state.errors.handle_warning(
                    format_args!("skipping {}: {errors}", candidate.link),
                    stage.as_str(),
                ),
                Err(e) => {
                    state.errors.handle_error(&e, stage.as_str(), true);
                }
            }
        }

        info!(
            collected = state.report.collected,
            staged = state.report.staged,
            duplicates,
            elapsed_ms = collection.duration.as_millis() as u64,
            "collection complete"
        );

        if state.report.staged == 0 {
            return Err(Abort::new(stage, "no collected candidate could be staged"));
        }
        Ok(())
    }

    /// Fetch the body of every collected item into the text cache.
    #[instrument(skip_all)]
    async fn extract(&self, state: &mut RunState<'_>) -> StageResult {
        let stage = PipelineStage::Extracting;
        let items = self
            .staging
            .items_awaiting_summary()
            .await
            .map_err(|e| state.fatal(stage, &e))?;

        let total = items.len();
        for (i, item) in items.iter().enumerate() {
            let tally = state
                .report
                .extraction
                .entry(item.source.clone())
                .or_default();

            match self.extractor.extract_text(&item.link, &item.source).await {
                Ok(Some(text)) if !text.trim().is_empty() => {
                    self.cache.put(&item.link, text);
                    tally.success += 1;
                }
                Ok(_) => {
                    tally.failed += 1;
                    state.errors.handle_warning(
                        format_args!("no article text at {}", item.link),
                        stage.as_str(),
                    );
                }
                Err(e) => {
                    tally.failed += 1;
                    state.errors.handle_error(&e, stage.as_str(), true);
                }
            }
            state.progress.item_done(stage, i + 1, total);
        }

        let stats = self.cache.stats();
        state.report.extracted = stats.count;
        for (source, tally) in &state.report.extraction {
            debug!(%source, success = tally.success, failed = tally.failed, "extraction by source");
        }
        info!(
            extracted = stats.count,
            total_chars = stats.total_chars,
            avg_len = stats.avg_len,
            "extraction complete"
        );

        if stats.count == 0 {
            return Err(Abort::new(stage, "no article text could be extracted"));
        }
        Ok(())
    }

    /// Summarize every cached text. A failed summary is stored as the
    /// failure sentinel so the item drops out of later stages.
    #[instrument(skip_all)]
    async fn summarize(
        &self,
        state: &mut RunState<'_>,
        summarizer: &mut dyn Summarizer,
    ) -> StageResult {
        let stage = PipelineStage::Summarizing;
        let inputs = self.cache.drain_for_summarization();
        let total = inputs.len();

        for (i, (link, input)) in inputs.iter().enumerate() {
            let (summary, ok) = match summarizer.summarize(input) {
                Ok(summary) => (summary, true),
                Err(e) => {
                    state.errors.handle_error(&e, stage.as_str(), true);
                    (failure_sentinel(&e), false)
                }
            };

            match self.staging.mark_processed(link, &summary).await {
                Ok(true) if ok => state.report.summarized += 1,
                Ok(true) => state.report.summary_failures += 1,
                Ok(false) => {
                    state.report.summary_failures += 1;
                    state.errors.handle_warning(
                        format_args!("summary for {link} was not recorded"),
                        stage.as_str(),
                    );
                }
                Err(e) => {
                    state.report.summary_failures += 1;
                    state.errors.handle_error(&e, stage.as_str(), true);
                }
            }
            state.progress.item_done(stage, i + 1, total);
        }

        info!(
            summarized = state.report.summarized,
            failed = state.report.summary_failures,
            "summarization complete"
        );

        if state.report.summarized == 0 {
            return Err(Abort::new(stage, "no summary was produced"));
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn cluster(&self, state: &mut RunState<'_>) -> StageResult {
        let stage = PipelineStage::Clustering;
        let items = self
            .staging
            .items_awaiting_cluster()
            .await
            .map_err(|e| state.fatal(stage, &e))?;

        let texts: Vec<String> = items
            .iter()
            .map(|item| item.summary.clone().unwrap_or_default())
            .collect();

        let output = self
            .clusterer
            .fit_predict(&texts)
            .map_err(|e| state.fatal(stage, &e))?;
        if output.labels.len() != items.len() {
            let err = NewsDigestError::Clustering(format!(
                "clusterer returned {} labels for {} items",
                output.labels.len(),
                items.len()
            ));
            return Err(state.fatal(stage, &err));
        }

        let artifacts = Arc::new(output.artifacts);
        self.cache.store_models(Arc::clone(&artifacts));

        let sizes = cluster_sizes(&output.labels);
        for (&cluster, &size) in &sizes {
            let top_terms = usize::try_from(cluster)
                .map(|c| artifacts.top_terms(c, TOP_TERMS_PER_CLUSTER))
                .unwrap_or_default();
            info!(
                cluster,
                label = %self.config.pipeline.cluster_label(cluster),
                size,
                top_terms = %top_terms.join(", "),
                "cluster"
            );
        }

        for (item, &cluster) in items.iter().zip(&output.labels) {
            match self.staging.mark_clustered(&item.link, cluster).await {
                Ok(true) => state.report.clustered += 1,
                Ok(false) => state.errors.handle_warning(
                    format_args!("cluster for {} was not recorded", item.link),
                    stage.as_str(),
                ),
                Err(e) => {
                    state.errors.handle_error(&e, stage.as_str(), true);
                }
            }
        }

        state.report.cluster_sizes = sizes;
        state.report.artifacts = Some(artifacts);
        info!(clustered = state.report.clustered, "clustering complete");

        if state.report.clustered == 0 {
            return Err(Abort::new(stage, "no item could be clustered"));
        }
        Ok(())
    }

    /// Score the ready items, keep the top N and reconcile the archive.
    #[instrument(skip_all, fields(top_n = self.config.pipeline.top_n))]
    async fn select(&self, state: &mut RunState<'_>) -> Result<()> {
        let ready = self.staging.items_ready_for_selection().await?;
        let candidates = ready.len();
        let selected = self
            .scoring
            .select_top_n(ready, self.config.pipeline.top_n);

        state.report.cluster_relevance = cluster_relevance(&selected);
        for (&cluster, &mean) in &state.report.cluster_relevance {
            info!(
                cluster,
                label = %self.config.pipeline.cluster_label(cluster),
                mean_relevance = mean,
                "selected cluster relevance"
            );
        }

        let records: Vec<ArchiveRecord> = selected
            .iter()
            .map(|scored| ArchiveRecord {
                title: scored.item.title.clone(),
                link: scored.item.link.clone(),
                image: scored.item.image.clone(),
                source: scored.item.source.clone(),
                summary: scored.item.summary.clone().unwrap_or_default(),
                cluster: scored.item.cluster.unwrap_or_default(),
                score: Some(f64::from(scored.relevance.min(MAX_ARCHIVED_SCORE))),
                status: Status::Posted,
            })
            .collect();
        state.report.selected = records.len();

        let promotion = self.archive.promote(&records).await?;
        if promotion.failed > 0 {
            state.errors.handle_warning(
                format_args!("{} selected items could not be archived", promotion.failed),
                PipelineStage::Selecting.as_str(),
            );
        }
        info!(
            candidates,
            selected = records.len(),
            new = promotion.new,
            reselected = promotion.reselected,
            demoted = promotion.demoted,
            failed = promotion.failed,
            "selection complete"
        );
        state.report.promotion = Some(promotion);
        Ok(())
    }

    /// Empty the staging store and cache, then gather archive statistics.
    #[instrument(skip_all)]
    async fn cleanup(&self, state: &mut RunState<'_>) {
        let stage = PipelineStage::Cleanup.as_str();

        match self.staging.counts().await {
            Ok(counts) => state.report.staging = Some(counts),
            Err(e) => {
                state.errors.handle_error(&e, stage, true);
            }
        }

        state.report.purged = self.staging.purge().await;
        if !state.report.purged {
            state
                .errors
                .handle_warning("staging store was not purged", stage);
        }
        self.cache.clear();

        match self.archive.stats().await {
            Ok(stats) => {
                info!(
                    total = stats.total,
                    posted = stats.posted,
                    archived = stats.archived,
                    last_7_days = stats.selected_last_7_days,
                    last_30_days = stats.selected_last_30_days,
                    "archive statistics"
                );
                state.report.archive = Some(stats);
            }
            Err(e) => {
                state.errors.handle_error(&e, stage, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use newsdigest_crawler::CollectionReport;
    use newsdigest_shared::{Candidate, Validator};

    use crate::clustering::{ClusterModel, ClusterOutput, TfIdfKMeans, VectorModel};

    const TOPICS: [&str; 5] = [
        "Google lança campanha de inteligência artificial",
        "Nubank patrocina festival de música",
        "Coca-Cola estreia comercial de verão",
        "Netflix anuncia parceria com influenciadores",
        "Apple revela estratégia de varejo",
    ];

    struct FixedCollector {
        candidates: Vec<Candidate>,
    }

    #[async_trait]
    impl Collector for FixedCollector {
        async fn collect(&self) -> CollectionReport {
            let mut per_source = BTreeMap::new();
            per_source.insert(
                "Exame".to_string(),
                SourceTally {
                    success: self.candidates.len(),
                    failed: 0,
                },
            );
            CollectionReport {
                candidates: self.candidates.clone(),
                per_source,
                errors: Vec::new(),
                duration: Duration::from_millis(1),
            }
        }
    }

    /// Serves a body per link; links in `missing` have no text.
    struct FixedExtractor {
        bodies: BTreeMap<String, String>,
        missing: HashSet<String>,
    }

    #[async_trait]
    impl TextExtractor for FixedExtractor {
        async fn extract_text(&self, link: &str, _source: &str) -> Result<Option<String>> {
            if self.missing.contains(link) {
                return Err(NewsDigestError::Network(format!("{link}: HTTP 404")));
            }
            Ok(self.bodies.get(link).cloned())
        }
    }

    /// Echoes the input without its prefix; fails on texts containing "ERRO".
    struct EchoSummarizer {
        shut_down: bool,
    }

    impl Summarizer for EchoSummarizer {
        fn summarize(&mut self, text: &str) -> Result<String> {
            if text.contains("ERRO") {
                return Err(NewsDigestError::Summarization("model crashed".into()));
            }
            Ok(text.trim_start_matches("summarize: ").to_string())
        }

        fn shutdown(&mut self) {
            self.shut_down = true;
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    struct BrokenClusterer;

    impl Clusterer for BrokenClusterer {
        fn fit_predict(&self, _texts: &[String]) -> Result<ClusterOutput> {
            Err(NewsDigestError::Clustering("no model".into()))
        }
    }

    /// Puts every text in cluster 0.
    struct SingleClusterer;

    impl Clusterer for SingleClusterer {
        fn fit_predict(&self, texts: &[String]) -> Result<ClusterOutput> {
            Ok(ClusterOutput {
                labels: vec![0; texts.len()],
                artifacts: ClusterArtifacts {
                    vectors: VectorModel {
                        vocabulary: vec![],
                        idf: vec![],
                    },
                    clusters: ClusterModel {
                        centroids: vec![vec![]],
                        inertia: 0.0,
                    },
                },
            })
        }
    }

    /// Labels only the first text.
    struct ShortClusterer;

    impl Clusterer for ShortClusterer {
        fn fit_predict(&self, texts: &[String]) -> Result<ClusterOutput> {
            let mut output = SingleClusterer.fit_predict(texts)?;
            output.labels.truncate(1);
            Ok(output)
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        stages: Mutex<Vec<PipelineStage>>,
    }

    impl ProgressReporter for RecordingProgress {
        fn stage(&self, stage: PipelineStage) {
            self.stages.lock().unwrap().push(stage);
        }
        fn item_done(&self, _stage: PipelineStage, _current: usize, _total: usize) {}
        fn done(&self, _report: &RunReport) {}
    }

    fn link(n: usize) -> String {
        format!("https://exame.com/marketing/noticia-{n}")
    }

    fn candidates(count: usize) -> Vec<Candidate> {
        (0..count)
            .map(|n| Candidate {
                title: TOPICS[n % TOPICS.len()].to_string(),
                link: link(n),
                image: None,
                source: "Exame".into(),
            })
            .collect()
    }

    fn bodies(count: usize) -> BTreeMap<String, String> {
        (0..count)
            .map(|n| {
                let topic = TOPICS[n % TOPICS.len()];
                (link(n), format!("{topic}. Matéria número {n} sobre {topic}."))
            })
            .collect()
    }

    struct Fixture {
        config: AppConfig,
        staging: StagingStore,
        archive: ArchiveStore,
        cache: TextCache,
        scoring: ScoringEngine,
    }

    async fn fixture() -> Fixture {
        let config = AppConfig::default();
        let validator = Validator::new(
            config.validation.clone(),
            config.pipeline.cluster_count,
        );
        let id = Uuid::now_v7();
        let staging = StagingStore::open(
            &std::env::temp_dir().join(format!("nd_pipeline_staging_{id}.db")),
            validator.clone(),
        )
        .await
        .expect("open staging")
        .with_purge_retry(1, Duration::ZERO);
        let archive = ArchiveStore::open(
            &std::env::temp_dir().join(format!("nd_pipeline_archive_{id}.db")),
            validator,
        )
        .await
        .expect("open archive");
        let scoring = ScoringEngine::new(&config.scoring).unwrap();

        Fixture {
            config,
            staging,
            archive,
            cache: TextCache::new(),
            scoring,
        }
    }

    impl Fixture {
        fn pipeline<'a>(
            &'a self,
            collector: &'a dyn Collector,
            extractor: &'a dyn TextExtractor,
            clusterer: &'a dyn Clusterer,
        ) -> Pipeline<'a> {
            Pipeline {
                config: &self.config,
                staging: &self.staging,
                archive: &self.archive,
                cache: &self.cache,
                collector,
                extractor,
                clusterer,
                scoring: &self.scoring,
            }
        }
    }

    #[tokio::test]
    async fn full_run_posts_top_n() {
        let fx = fixture().await;
        let collector = FixedCollector {
            candidates: candidates(20),
        };
        let extractor = FixedExtractor {
            bodies: bodies(20),
            missing: HashSet::new(),
        };
        let clusterer = TfIdfKMeans::from_config(&fx.config.pipeline);
        let mut summarizer = EchoSummarizer { shut_down: false };
        let progress = RecordingProgress::default();

        let report = fx
            .pipeline(&collector, &extractor, &clusterer)
            .run(&mut summarizer, &progress)
            .await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.staged, 20);
        assert_eq!(report.extracted, 20);
        assert_eq!(report.summarized, 20);
        assert_eq!(report.clustered, 20);
        assert_eq!(report.selected, 15);
        assert_eq!(report.promotion.unwrap().new, 15);
        assert_eq!(report.staging.unwrap().ready_for_selection, 20);
        assert!(report.purged);
        assert!(report.artifacts.is_some());
        assert!(summarizer.shut_down);

        let stats = report.archive.unwrap();
        assert_eq!(stats.total, 15);
        assert_eq!(stats.posted, 15);
        assert_eq!(fx.staging.counts().await.unwrap().total, 0);
        assert_eq!(fx.cache.stats().count, 0);

        let stages = progress.stages.lock().unwrap().clone();
        assert_eq!(stages.first(), Some(&PipelineStage::PreflightCheck));
        assert_eq!(stages.last(), Some(&PipelineStage::Done));
    }

    #[tokio::test]
    async fn second_run_demotes_items_not_reselected() {
        let fx = fixture().await;
        let clusterer = SingleClusterer;
        let first = FixedCollector {
            candidates: candidates(3),
        };
        let extractor = FixedExtractor {
            bodies: bodies(10),
            missing: HashSet::new(),
        };
        let mut summarizer = EchoSummarizer { shut_down: false };
        let report = fx
            .pipeline(&first, &extractor, &clusterer)
            .run(&mut summarizer, &SilentProgress)
            .await;
        assert!(report.outcome.is_success());

        let second = FixedCollector {
            candidates: candidates(10)
                .into_iter()
                .filter(|c| c.link != link(0))
                .collect(),
        };
        let report = fx
            .pipeline(&second, &extractor, &clusterer)
            .run(&mut summarizer, &SilentProgress)
            .await;
        assert!(report.outcome.is_success());

        let promotion = report.promotion.unwrap();
        assert_eq!(promotion.reselected, 2);
        assert_eq!(promotion.new, 7);
        assert_eq!(promotion.demoted, 1);

        let dropped = fx.archive.get_by_link(&link(0)).await.unwrap().unwrap();
        assert_eq!(dropped.status, Status::Archived);
    }

    #[tokio::test]
    async fn failed_summaries_are_excluded_from_selection() {
        let fx = fixture().await;
        let collector = FixedCollector {
            candidates: candidates(4),
        };
        let mut texts = bodies(4);
        texts.insert(link(1), "ERRO no corpo da matéria".into());
        let extractor = FixedExtractor {
            bodies: texts,
            missing: HashSet::new(),
        };
        let mut summarizer = EchoSummarizer { shut_down: false };

        let report = fx
            .pipeline(&collector, &extractor, &SingleClusterer)
            .run(&mut summarizer, &SilentProgress)
            .await;

        assert!(report.outcome.is_success());
        assert_eq!(report.summarized, 3);
        assert_eq!(report.summary_failures, 1);
        assert_eq!(report.selected, 3);
        assert_eq!(report.errors.errors, 1);
        assert!(fx.archive.get_by_link(&link(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extraction_failures_are_tallied_per_source() {
        let fx = fixture().await;
        let collector = FixedCollector {
            candidates: candidates(5),
        };
        let extractor = FixedExtractor {
            bodies: bodies(5),
            missing: [link(2), link(3)].into_iter().collect(),
        };
        let mut summarizer = EchoSummarizer { shut_down: false };

        let report = fx
            .pipeline(&collector, &extractor, &SingleClusterer)
            .run(&mut summarizer, &SilentProgress)
            .await;

        assert!(report.outcome.is_success());
        assert_eq!(
            report.extraction["Exame"],
            SourceTally {
                success: 3,
                failed: 2,
            }
        );
        assert_eq!(report.selected, 3);
    }

    #[tokio::test]
    async fn zero_candidates_aborts() {
        let fx = fixture().await;
        let collector = FixedCollector { candidates: vec![] };
        let extractor = FixedExtractor {
            bodies: BTreeMap::new(),
            missing: HashSet::new(),
        };
        let mut summarizer = EchoSummarizer { shut_down: false };

        let report = fx
            .pipeline(&collector, &extractor, &SingleClusterer)
            .run(&mut summarizer, &SilentProgress)
            .await;

        assert!(matches!(
            report.outcome,
            RunOutcome::Aborted {
                stage: PipelineStage::Collecting,
                ..
            }
        ));
        assert_eq!(fx.archive.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn zero_extracted_texts_aborts() {
        let fx = fixture().await;
        let collector = FixedCollector {
            candidates: candidates(3),
        };
        let extractor = FixedExtractor {
            bodies: BTreeMap::new(),
            missing: HashSet::new(),
        };
        let mut summarizer = EchoSummarizer { shut_down: false };

        let report = fx
            .pipeline(&collector, &extractor, &SingleClusterer)
            .run(&mut summarizer, &SilentProgress)
            .await;

        assert!(matches!(
            report.outcome,
            RunOutcome::Aborted {
                stage: PipelineStage::Extracting,
                ..
            }
        ));
        assert!(report.errors.warnings >= 3);
    }

    #[tokio::test]
    async fn all_summaries_failing_aborts() {
        let fx = fixture().await;
        let collector = FixedCollector {
            candidates: candidates(2),
        };
        let extractor = FixedExtractor {
            bodies: (0..2).map(|n| (link(n), format!("ERRO {n}"))).collect(),
            missing: HashSet::new(),
        };
        let mut summarizer = EchoSummarizer { shut_down: false };

        let report = fx
            .pipeline(&collector, &extractor, &SingleClusterer)
            .run(&mut summarizer, &SilentProgress)
            .await;

        assert!(matches!(
            report.outcome,
            RunOutcome::Aborted {
                stage: PipelineStage::Summarizing,
                ..
            }
        ));
        assert!(summarizer.shut_down);
        assert_eq!(report.errors.errors, 2);
    }

    #[tokio::test]
    async fn clustering_failure_aborts_and_releases_lock() {
        let fx = fixture().await;
        let collector = FixedCollector {
            candidates: candidates(3),
        };
        let extractor = FixedExtractor {
            bodies: bodies(3),
            missing: HashSet::new(),
        };
        let mut summarizer = EchoSummarizer { shut_down: false };

        let report = fx
            .pipeline(&collector, &extractor, &BrokenClusterer)
            .run(&mut summarizer, &SilentProgress)
            .await;

        assert!(matches!(
            report.outcome,
            RunOutcome::Aborted {
                stage: PipelineStage::Clustering,
                ..
            }
        ));

        // the lock was released, so the next run proceeds
        fx.archive
            .acquire_run_lock("next-run", Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_cluster_labels_abort_without_clustering() {
        let fx = fixture().await;
        let collector = FixedCollector {
            candidates: candidates(3),
        };
        let extractor = FixedExtractor {
            bodies: bodies(3),
            missing: HashSet::new(),
        };
        let mut summarizer = EchoSummarizer { shut_down: false };

        let report = fx
            .pipeline(&collector, &extractor, &ShortClusterer)
            .run(&mut summarizer, &SilentProgress)
            .await;

        match &report.outcome {
            RunOutcome::Aborted { stage, reason } => {
                assert_eq!(*stage, PipelineStage::Clustering);
                assert!(reason.contains("1 labels for 3 items"));
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(report.clustered, 0);
        assert!(report.promotion.is_none());
        assert_eq!(fx.archive.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn held_lock_aborts_before_any_stage() {
        let fx = fixture().await;
        fx.archive
            .acquire_run_lock("other-run", Duration::from_secs(3600))
            .await
            .unwrap();

        let collector = FixedCollector {
            candidates: candidates(3),
        };
        let extractor = FixedExtractor {
            bodies: bodies(3),
            missing: HashSet::new(),
        };
        let mut summarizer = EchoSummarizer { shut_down: false };
        let progress = RecordingProgress::default();

        let report = fx
            .pipeline(&collector, &extractor, &SingleClusterer)
            .run(&mut summarizer, &progress)
            .await;

        assert!(matches!(
            report.outcome,
            RunOutcome::Aborted {
                stage: PipelineStage::PreflightCheck,
                ..
            }
        ));
        assert_eq!(report.staged, 0);
        assert_eq!(
            progress.stages.lock().unwrap().as_slice(),
            [PipelineStage::PreflightCheck]
        );
    }
}
