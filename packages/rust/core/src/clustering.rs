//! Topic clustering of article summaries.
//!
//! [`TfIdfKMeans`] vectorizes summaries with TF-IDF over a bounded
//! vocabulary and groups them with seeded k-means++. The fitted models are
//! returned as [`ClusterArtifacts`] so later stages can interpret clusters.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};

use newsdigest_shared::{NewsDigestError, PipelineConfig, Result};

/// Groups texts into topics.
pub trait Clusterer: Send + Sync {
    /// Assign a cluster to every text. Deterministic for a fixed seed.
    fn fit_predict(&self, texts: &[String]) -> Result<ClusterOutput>;
}

/// Cluster ids (parallel to the input texts) and the fitted models.
#[derive(Debug, Clone)]
pub struct ClusterOutput {
    pub labels: Vec<i64>,
    pub artifacts: ClusterArtifacts,
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Fitted TF-IDF vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorModel {
    /// Terms in column order (alphabetical).
    pub vocabulary: Vec<String>,
    /// Smoothed inverse document frequency per column.
    pub idf: Vec<f64>,
}

/// Fitted k-means centroids.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterModel {
    pub centroids: Vec<Vec<f64>>,
    /// Sum of squared distances of the training rows to their centroid.
    pub inertia: f64,
}

/// Both fitted models of one clustering pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterArtifacts {
    pub vectors: VectorModel,
    pub clusters: ClusterModel,
}

impl VectorModel {
    /// L2-normalized TF-IDF row of `text` over this vocabulary.
    pub fn transform(&self, text: &str) -> Vec<f64> {
        let index: HashMap<&str, usize> = self
            .vocabulary
            .iter()
            .enumerate()
            .map(|(i, t)| (t.as_str(), i))
            .collect();

        let mut row = vec![0.0; self.vocabulary.len()];
        for token in tokenize(text) {
            if let Some(&col) = index.get(token.as_str()) {
                row[col] += 1.0;
            }
        }
        for (value, idf) in row.iter_mut().zip(&self.idf) {
            *value *= idf;
        }
        normalize(&mut row);
        row
    }
}

impl ClusterModel {
    /// Index of the centroid nearest to `row`.
    pub fn predict(&self, row: &[f64]) -> usize {
        nearest(&self.centroids, row).0
    }

    pub fn len(&self) -> usize {
        self.centroids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }
}

impl ClusterArtifacts {
    /// The `n` highest-weighted terms of a cluster's centroid.
    pub fn top_terms(&self, cluster: usize, n: usize) -> Vec<String> {
        let Some(centroid) = self.clusters.centroids.get(cluster) else {
            return Vec::new();
        };
        let mut order: Vec<usize> = (0..centroid.len()).collect();
        order.sort_by(|&a, &b| centroid[b].total_cmp(&centroid[a]).then(a.cmp(&b)));
        order
            .into_iter()
            .take(n)
            .filter(|&i| centroid[i] > 0.0)
            .filter_map(|i| self.vectors.vocabulary.get(i).cloned())
            .collect()
    }

    /// Cluster of an unseen text.
    pub fn predict(&self, text: &str) -> usize {
        self.clusters.predict(&self.vectors.transform(text))
    }
}

// ---------------------------------------------------------------------------
// TfIdfKMeans
// ---------------------------------------------------------------------------

/// TF-IDF vectorizer followed by k-means++ with restarts.
#[derive(Debug, Clone)]
pub struct TfIdfKMeans {
    pub clusters: usize,
    pub seed: u64,
    pub n_init: usize,
    pub max_iterations: usize,
    pub max_features: usize,
}

impl TfIdfKMeans {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            clusters: config.cluster_count as usize,
            seed: config.random_seed,
            n_init: config.n_init.max(1) as usize,
            max_iterations: config.max_iterations.max(1) as usize,
            max_features: config.max_features,
        }
    }

    fn fit_vectors(&self, docs: &[Vec<String>]) -> VectorModel {
        let mut term_counts: HashMap<&str, usize> = HashMap::new();
        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for doc in docs {
            let mut seen = HashSet::new();
            for token in doc {
                *term_counts.entry(token.as_str()).or_default() += 1;
                if seen.insert(token.as_str()) {
                    *doc_freq.entry(token.as_str()).or_default() += 1;
                }
            }
        }

        // Most frequent terms first, alphabetical among equals.
        let mut ranked: Vec<(&str, usize)> = term_counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked.truncate(self.max_features);

        let mut vocabulary: Vec<String> = ranked.into_iter().map(|(t, _)| t.to_string()).collect();
        vocabulary.sort();

        let n = docs.len() as f64;
        let idf = vocabulary
            .iter()
            .map(|t| {
                let df = doc_freq.get(t.as_str()).copied().unwrap_or(0) as f64;
                ((1.0 + n) / (1.0 + df)).ln() + 1.0
            })
            .collect();

        VectorModel { vocabulary, idf }
    }
}

impl Clusterer for TfIdfKMeans {
    #[instrument(skip_all, fields(texts = texts.len(), k = self.clusters))]
    fn fit_predict(&self, texts: &[String]) -> Result<ClusterOutput> {
        if texts.is_empty() {
            return Err(NewsDigestError::Clustering("no texts to cluster".into()));
        }
        if self.clusters == 0 {
            return Err(NewsDigestError::Clustering("cluster count must be positive".into()));
        }

        let docs: Vec<Vec<String>> = texts.iter().map(|t| tokenize(t)).collect();
        let vectors = self.fit_vectors(&docs);
        if vectors.vocabulary.is_empty() {
            return Err(NewsDigestError::Clustering(
                "texts contain no usable terms after stopword removal".into(),
            ));
        }

        let rows: Vec<Vec<f64>> = texts.iter().map(|t| vectors.transform(t)).collect();
        let k = self.clusters.min(rows.len());

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut best: Option<(Vec<usize>, ClusterModel)> = None;
        for run in 0..self.n_init {
            let (labels, model) = lloyd(&rows, k, self.max_iterations, &mut rng);
            debug!(run, inertia = model.inertia, "k-means run finished");
            if best
                .as_ref()
                .is_none_or(|(_, b)| model.inertia < b.inertia)
            {
                best = Some((labels, model));
            }
        }
        let (labels, clusters) =
            best.ok_or_else(|| NewsDigestError::Clustering("k-means produced no model".into()))?;

        Ok(ClusterOutput {
            labels: labels.into_iter().map(|l| l as i64).collect(),
            artifacts: ClusterArtifacts { vectors, clusters },
        })
    }
}

// ---------------------------------------------------------------------------
// k-means
// ---------------------------------------------------------------------------

fn lloyd(
    rows: &[Vec<f64>],
    k: usize,
    max_iterations: usize,
    rng: &mut StdRng,
) -> (Vec<usize>, ClusterModel) {
    let mut centroids = init_plus_plus(rows, k, rng);
    let mut labels = vec![usize::MAX; rows.len()];

    for _ in 0..max_iterations {
        let mut changed = false;
        for (row, label) in rows.iter().zip(labels.iter_mut()) {
            let (nearest_idx, _) = nearest(&centroids, row);
            if *label != nearest_idx {
                *label = nearest_idx;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let dims = rows[0].len();
        let mut sums = vec![vec![0.0; dims]; k];
        let mut counts = vec![0usize; k];
        for (row, &label) in rows.iter().zip(&labels) {
            counts[label] += 1;
            for (s, v) in sums[label].iter_mut().zip(row) {
                *s += v;
            }
        }
        for (c, (sum, count)) in sums.into_iter().zip(counts).enumerate() {
            // An emptied cluster keeps its previous centroid.
            if count > 0 {
                centroids[c] = sum.into_iter().map(|s| s / count as f64).collect();
            }
        }
    }

    let inertia = rows
        .iter()
        .zip(&labels)
        .map(|(row, &l)| squared_distance(&centroids[l], row))
        .sum();

    (labels, ClusterModel { centroids, inertia })
}

/// k-means++ seeding: each next centroid is drawn with probability
/// proportional to its squared distance from the nearest chosen one.
fn init_plus_plus(rows: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut centroids = vec![rows[rng.random_range(0..rows.len())].clone()];
    while centroids.len() < k {
        let weights: Vec<f64> = rows.iter().map(|r| nearest(&centroids, r).1).collect();
        let total: f64 = weights.iter().sum();
        let pick = if total <= f64::EPSILON {
            rng.random_range(0..rows.len())
        } else {
            let mut target = rng.random::<f64>() * total;
            let mut chosen = rows.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                if target < *w {
                    chosen = i;
                    break;
                }
                target -= w;
            }
            chosen
        };
        centroids.push(rows[pick].clone());
    }
    centroids
}

fn nearest(centroids: &[Vec<f64>], row: &[f64]) -> (usize, f64) {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, squared_distance(c, row)))
        .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn normalize(row: &mut [f64]) {
    let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        row.iter_mut().for_each(|v| *v /= norm);
    }
}

// ---------------------------------------------------------------------------
// Tokenization
// ---------------------------------------------------------------------------

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w\w+\b").expect("valid regex"));

static STOPWORDS: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| PORTUGUESE_STOPWORDS.iter().copied().collect());

/// Lowercased word tokens of two or more characters, stopwords removed.
fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|t| !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

const PORTUGUESE_STOPWORDS: &[&str] = &[
    "a", "à", "ao", "aos", "aquela", "aquelas", "aquele", "aqueles", "aquilo", "as", "às", "até",
    "com", "como", "da", "das", "de", "dela", "delas", "dele", "deles", "depois", "do", "dos", "e",
    "é", "ela", "elas", "ele", "eles", "em", "entre", "era", "eram", "éramos", "essa", "essas",
    "esse", "esses", "esta", "está", "estamos", "estão", "estar", "estas", "estava", "estavam",
    "estávamos", "este", "esteja", "estejam", "estejamos", "estes", "esteve", "estive",
    "estivemos", "estiver", "estivera", "estiveram", "estivéramos", "estiverem", "estivermos",
    "estivesse", "estivessem", "estivéssemos", "estou", "eu", "foi", "fomos", "for", "fora",
    "foram", "fôramos", "forem", "formos", "fosse", "fossem", "fôssemos", "fui", "há", "haja",
    "hajam", "hajamos", "hão", "havemos", "haver", "hei", "houve", "houvemos", "houver",
    "houvera", "houverá", "houveram", "houvéramos", "houverão", "houverei", "houverem",
    "houveremos", "houveria", "houveriam", "houveríamos", "houvermos", "houvesse", "houvessem",
    "houvéssemos", "isso", "isto", "já", "lhe", "lhes", "mais", "mas", "me", "mesmo", "meu",
    "meus", "minha", "minhas", "muito", "na", "não", "nas", "nem", "no", "nos", "nós", "nossa",
    "nossas", "nosso", "nossos", "num", "numa", "o", "os", "ou", "para", "pela", "pelas", "pelo",
    "pelos", "por", "qual", "quando", "que", "quem", "são", "se", "seja", "sejam", "sejamos",
    "sem", "ser", "será", "serão", "serei", "seremos", "seria", "seriam", "seríamos", "seu",
    "seus", "só", "somos", "sou", "sua", "suas", "também", "te", "tem", "tém", "temos", "tenha",
    "tenham", "tenhamos", "tenho", "terá", "terão", "terei", "teremos", "teria", "teriam",
    "teríamos", "teu", "teus", "teve", "tinha", "tinham", "tínhamos", "tive", "tivemos",
    "tiver", "tivera", "tiveram", "tivéramos", "tiverem", "tivermos", "tivesse", "tivessem",
    "tivéssemos", "tu", "tua", "tuas", "um", "uma", "você", "vocês", "vos",
];

/// Cluster sizes of a label vector, keyed by cluster id.
pub fn cluster_sizes(labels: &[i64]) -> BTreeMap<i64, usize> {
    let mut sizes = BTreeMap::new();
    for &label in labels {
        *sizes.entry(label).or_default() += 1;
    }
    sizes
}
