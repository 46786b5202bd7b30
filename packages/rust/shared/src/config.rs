//! Application configuration for newsdigest.
//!
//! User config lives at `~/.newsdigest/newsdigest.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NewsDigestError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "newsdigest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".newsdigest";

// ---------------------------------------------------------------------------
// Config structs (matching newsdigest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Store locations and maintenance knobs.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Selection and clustering parameters.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Field limits enforced before anything is persisted.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// HTTP client behaviour for collection and extraction.
    #[serde(default)]
    pub http: HttpConfig,

    /// Summarization backend.
    #[serde(default)]
    pub summarizer: SummarizerConfig,

    /// Relevance keyword table.
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// News sources to collect from.
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            validation: ValidationConfig::default(),
            http: HttpConfig::default(),
            summarizer: SummarizerConfig::default(),
            scoring: ScoringConfig::default(),
            sources: default_sources(),
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the per-run staging database.
    #[serde(default = "default_staging_path")]
    pub staging_path: String,

    /// Path of the durable archive database.
    #[serde(default = "default_archive_path")]
    pub archive_path: String,

    /// A run lock older than this is considered abandoned.
    #[serde(default = "default_lock_stale_after")]
    pub lock_stale_after_secs: u64,

    /// Attempts at reclaiming the staging file while it is locked.
    #[serde(default = "default_purge_retries")]
    pub purge_retries: u32,

    /// Pause between reclaim attempts.
    #[serde(default = "default_purge_retry_delay")]
    pub purge_retry_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            staging_path: default_staging_path(),
            archive_path: default_archive_path(),
            lock_stale_after_secs: default_lock_stale_after(),
            purge_retries: default_purge_retries(),
            purge_retry_delay_ms: default_purge_retry_delay(),
        }
    }
}

fn default_staging_path() -> String {
    "data/staging.db".into()
}
fn default_archive_path() -> String {
    "data/archive.db".into()
}
fn default_lock_stale_after() -> u64 {
    3 * 60 * 60
}
fn default_purge_retries() -> u32 {
    3
}
fn default_purge_retry_delay() -> u64 {
    1000
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of items promoted per run.
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Number of topic clusters.
    #[serde(default = "default_cluster_count")]
    pub cluster_count: u32,

    /// Seed for the clustering initialisation.
    #[serde(default = "default_random_seed")]
    pub random_seed: u64,

    /// Independent k-means restarts; the lowest-inertia fit wins.
    #[serde(default = "default_n_init")]
    pub n_init: u32,

    /// Maximum k-means iterations per restart.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Vocabulary size of the TF-IDF vectorizer.
    #[serde(default = "default_max_features")]
    pub max_features: usize,

    /// Human-readable label per cluster id, used in logs.
    #[serde(default = "default_cluster_labels")]
    pub cluster_labels: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            cluster_count: default_cluster_count(),
            random_seed: default_random_seed(),
            n_init: default_n_init(),
            max_iterations: default_max_iterations(),
            max_features: default_max_features(),
            cluster_labels: default_cluster_labels(),
        }
    }
}

impl PipelineConfig {
    /// Label for a cluster id, falling back to the numeric id.
    pub fn cluster_label(&self, cluster: i64) -> String {
        usize::try_from(cluster)
            .ok()
            .and_then(|i| self.cluster_labels.get(i))
            .cloned()
            .unwrap_or_else(|| format!("cluster {cluster}"))
    }
}

fn default_top_n() -> usize {
    15
}
fn default_cluster_count() -> u32 {
    5
}
fn default_random_seed() -> u64 {
    42
}
fn default_n_init() -> u32 {
    10
}
fn default_max_iterations() -> u32 {
    300
}
fn default_max_features() -> usize {
    1000
}
fn default_cluster_labels() -> Vec<String> {
    ["Tema A", "Tema B", "Tema C", "Tema D", "Tema E"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// `[validation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_max_title_length")]
    pub max_title_length: usize,

    #[serde(default = "default_max_summary_length")]
    pub max_summary_length: usize,

    #[serde(default = "default_max_link_length")]
    pub max_link_length: usize,

    /// Accepted source names. Empty accepts any source.
    #[serde(default = "default_allowed_sources")]
    pub allowed_sources: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_title_length: default_max_title_length(),
            max_summary_length: default_max_summary_length(),
            max_link_length: default_max_link_length(),
            allowed_sources: default_allowed_sources(),
        }
    }
}

fn default_max_title_length() -> usize {
    500
}
fn default_max_summary_length() -> usize {
    2000
}
fn default_max_link_length() -> usize {
    1000
}
fn default_allowed_sources() -> Vec<String> {
    [
        "Exame",
        "GKPB",
        "Meio e Mensagem",
        "Mundo do Marketing",
        "Desconhecida",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// `[http]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Fixed pause between article requests.
    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,

    /// User-Agent header sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            request_delay_ms: default_request_delay(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    10
}
fn default_request_delay() -> u64 {
    500
}
fn default_user_agent() -> String {
    concat!("newsdigest/", env!("CARGO_PKG_VERSION")).into()
}

/// Which summarization backend a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizerBackend {
    /// Built-in extractive summarizer (leading sentences).
    Lead,
    /// External model process speaking JSON lines over stdio.
    Bridge,
}

/// `[summarizer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    #[serde(default = "default_backend")]
    pub backend: SummarizerBackend,

    /// Model identifier forwarded to the bridge.
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Input is truncated to this many characters before summarizing.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,

    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,

    #[serde(default = "default_min_new_tokens")]
    pub min_new_tokens: u32,

    #[serde(default = "default_num_beams")]
    pub num_beams: u32,

    /// Executable of the bridge process.
    #[serde(default = "default_bridge_cmd")]
    pub bridge_cmd: String,

    /// Arguments of the bridge process.
    #[serde(default = "default_bridge_args")]
    pub bridge_args: Vec<String>,

    /// Lead summarizer stops adding sentences once this length is reached.
    #[serde(default = "default_lead_min_chars")]
    pub lead_min_chars: usize,

    /// Lead summarizer never exceeds this length.
    #[serde(default = "default_lead_max_chars")]
    pub lead_max_chars: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model_name: default_model_name(),
            max_input_chars: default_max_input_chars(),
            max_new_tokens: default_max_new_tokens(),
            min_new_tokens: default_min_new_tokens(),
            num_beams: default_num_beams(),
            bridge_cmd: default_bridge_cmd(),
            bridge_args: default_bridge_args(),
            lead_min_chars: default_lead_min_chars(),
            lead_max_chars: default_lead_max_chars(),
        }
    }
}

fn default_backend() -> SummarizerBackend {
    SummarizerBackend::Lead
}
fn default_model_name() -> String {
    "unicamp-dl/ptt5-small-portuguese-vocab".into()
}
fn default_max_input_chars() -> usize {
    1024
}
fn default_max_new_tokens() -> u32 {
    150
}
fn default_min_new_tokens() -> u32 {
    40
}
fn default_num_beams() -> u32 {
    4
}
fn default_bridge_cmd() -> String {
    "python3".into()
}
fn default_bridge_args() -> Vec<String> {
    vec!["scripts/summarize_bridge.py".into()]
}
fn default_lead_min_chars() -> usize {
    200
}
fn default_lead_max_chars() -> usize {
    600
}

/// How keyword matches accumulate into a relevance score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    /// Each distinct matching term adds its category weight.
    PerTerm,
    /// Each category adds its weight at most once.
    PerCategory,
}

/// One weighted keyword category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordCategory {
    pub terms: Vec<String>,
    pub weight: u32,
}

/// `[scoring]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_scoring_mode")]
    pub mode: ScoringMode,

    /// Category name to weighted term list.
    #[serde(default = "default_categories")]
    pub categories: BTreeMap<String, KeywordCategory>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            mode: default_scoring_mode(),
            categories: default_categories(),
        }
    }
}

fn default_scoring_mode() -> ScoringMode {
    ScoringMode::PerTerm
}

fn category(terms: &[&str], weight: u32) -> KeywordCategory {
    KeywordCategory {
        terms: terms.iter().map(|t| t.to_string()).collect(),
        weight,
    }
}

fn default_categories() -> BTreeMap<String, KeywordCategory> {
    let mut categories = BTreeMap::new();
    categories.insert(
        "marcas_grandes".to_string(),
        category(
            &[
                "google",
                "apple",
                "microsoft",
                "amazon",
                "samsung",
                "coca-cola",
                "toyota",
                "mercedes-benz",
                "mcdonald's",
                "disney",
                "nike",
                "instagram",
                "facebook",
                "meta",
                "itaú",
                "bradesco",
                "nubank",
                "banco do brasil",
                "petrobras",
                "vale",
                "magalu",
                "natura",
                "ambev",
                "havaianas",
                "renner",
                "netflix",
                "spotify",
                "uber",
            ],
            5,
        ),
    );
    categories.insert(
        "campanhas_e_acoes".to_string(),
        category(
            &[
                "campanha",
                "lançamento",
                "lança",
                "anuncia",
                "patrocina",
                "parceria",
                "colaboração",
                "ativação",
                "evento",
                "marketing",
                "publicidade",
                "anúncio",
                "branding",
                "influenciadores",
            ],
            3,
        ),
    );
    categories.insert(
        "palavras_de_impacto".to_string(),
        category(
            &[
                "revoluciona",
                "transforma",
                "inova",
                "impacto",
                "crescimento",
                "tendência",
                "futuro",
                "inteligência artificial",
                "ia",
                "novo",
            ],
            2,
        ),
    );
    categories
}

/// `[[sources]]` entry: where and how to collect one news site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source name stored with every article.
    pub name: String,
    /// Listing page with the latest articles.
    pub listing_url: String,
    /// Selector matching one article card on the listing page.
    pub article_selector: String,
    /// Selector of the title inside a card.
    pub title_selector: String,
    /// Selector of the link inside a card. Defaults to the title element
    /// (or its first anchor).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_selector: Option<String>,
    /// Selector of the image inside a card.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_selector: Option<String>,
    /// Selector of the body container on the article page.
    pub content_selector: String,
}

fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig {
            name: "Meio e Mensagem".into(),
            listing_url: "https://www.meioemensagem.com.br/marketing".into(),
            article_selector: "article.post".into(),
            title_selector: "h3.titulo".into(),
            link_selector: Some("a[href]".into()),
            image_selector: Some("img[data-src], img[src]".into()),
            content_selector: "div.__content".into(),
        },
        SourceConfig {
            name: "Mundo do Marketing".into(),
            listing_url: "https://mundodomarketing.com.br/noticias".into(),
            article_selector: "div.framer-11hhesp-container".into(),
            title_selector: "div.framer-1r5yzu2 h2.framer-text".into(),
            link_selector: Some("a.framer-1wh61m0".into()),
            image_selector: Some("div[data-framer-name=\"Image\"] img".into()),
            content_selector: "div.framer-1ga874m".into(),
        },
        SourceConfig {
            name: "Exame".into(),
            listing_url: "https://exame.com/marketing/".into(),
            article_selector: "div.sc-dbce6183-0".into(),
            title_selector: "h3.headline-extra-small a".into(),
            link_selector: None,
            image_selector: Some("img.placeholder-image".into()),
            content_selector: "div#news-body".into(),
        },
        SourceConfig {
            name: "GKPB".into(),
            listing_url: "https://gkpb.com.br/category/publicidade/".into(),
            article_selector: "div[class*=\"tdb_module_header\"][class*=\"td_module_wrap\"]"
                .into(),
            title_selector: "h3[class*=\"entry-title\"] a".into(),
            link_selector: None,
            image_selector: Some("div[data-bg]".into()),
            content_selector: "div.td-post-content".into(),
        },
    ]
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.top_n == 0 {
            return Err(NewsDigestError::config("pipeline.top_n must be at least 1"));
        }
        if self.pipeline.cluster_count == 0 {
            return Err(NewsDigestError::config(
                "pipeline.cluster_count must be at least 1",
            ));
        }
        if self.pipeline.n_init == 0 {
            return Err(NewsDigestError::config("pipeline.n_init must be at least 1"));
        }
        if self.storage.staging_path == self.storage.archive_path {
            return Err(NewsDigestError::config(
                "storage.staging_path and storage.archive_path must differ",
            ));
        }
        for (name, category) in &self.scoring.categories {
            if category.weight == 0 {
                return Err(NewsDigestError::config(format!(
                    "scoring category '{name}' has weight 0"
                )));
            }
            if category.terms.iter().all(|t| t.trim().is_empty()) {
                return Err(NewsDigestError::config(format!(
                    "scoring category '{name}' has no terms"
                )));
            }
        }
        if self.sources.is_empty() {
            return Err(NewsDigestError::config("at least one [[sources]] entry is required"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.newsdigest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| NewsDigestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.newsdigest/newsdigest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| NewsDigestError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        NewsDigestError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| NewsDigestError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    if path.exists() {
        return Err(NewsDigestError::config(format!(
            "{} already exists",
            path.display()
        )));
    }

    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| NewsDigestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| NewsDigestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("staging_path"));
        assert!(toml_str.contains("marcas_grandes"));
        assert!(toml_str.contains("[[sources]]"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.pipeline.top_n, 15);
        assert_eq!(parsed.pipeline.cluster_count, 5);
        assert_eq!(parsed.scoring.categories["marcas_grandes"].weight, 5);
        assert_eq!(parsed.sources.len(), 4);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let toml_str = r#"
[pipeline]
top_n = 5

[scoring]
mode = "per_category"

[scoring.categories.marcas]
terms = ["google"]
weight = 5

[[sources]]
name = "Exame"
listing_url = "https://exame.com/marketing/"
article_selector = "article"
title_selector = "h3 a"
content_selector = "div#news-body"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pipeline.top_n, 5);
        assert_eq!(config.pipeline.random_seed, 42);
        assert_eq!(config.scoring.mode, ScoringMode::PerCategory);
        assert_eq!(config.scoring.categories.len(), 1);
        assert_eq!(config.sources.len(), 1);
        assert!(config.sources[0].link_selector.is_none());
        assert_eq!(config.validation.max_title_length, 500);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.pipeline.top_n = 0;
        assert!(config.validate().unwrap_err().to_string().contains("top_n"));

        let mut config = AppConfig::default();
        config.storage.archive_path = config.storage.staging_path.clone();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config
            .scoring
            .categories
            .insert("empty".into(), KeywordCategory { terms: vec![], weight: 1 });
        assert!(config.validate().unwrap_err().to_string().contains("no terms"));
    }

    #[test]
    fn cluster_label_fallback() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.cluster_label(0), "Tema A");
        assert_eq!(pipeline.cluster_label(7), "cluster 7");
        assert_eq!(pipeline.cluster_label(-1), "cluster -1");
    }
}
