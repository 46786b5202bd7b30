//! Volatile per-run cache of extracted article text.
//!
//! Full article bodies never touch the staging store: extraction puts them
//! here, summarization drains them. The cache also holds the clustering
//! artifacts of the current run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use newsdigest_shared::SUMMARIZE_PREFIX;

use crate::clustering::ClusterArtifacts;

/// Size summary of the cached texts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub count: usize,
    pub total_chars: usize,
    /// Integer mean of the text lengths, 0 when empty.
    pub avg_len: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    next_seq: u64,
    texts: HashMap<String, CachedText>,
    models: Option<Arc<ClusterArtifacts>>,
}

#[derive(Debug)]
struct CachedText {
    seq: u64,
    text: String,
}

/// Link-keyed text cache guarded by a single mutex.
#[derive(Debug, Default)]
pub struct TextCache {
    state: Mutex<CacheState>,
}

impl TextCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // The state stays consistent even if a holder panicked mid-call.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the text for `link`. Replacing a text keeps its original position.
    pub fn put(&self, link: &str, text: impl Into<String>) {
        let mut state = self.lock();
        let text = text.into();
        if let Some(existing) = state.texts.get_mut(link) {
            existing.text = text;
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.texts.insert(link.to_string(), CachedText { seq, text });
    }

    pub fn get(&self, link: &str) -> Option<String> {
        self.lock().texts.get(link).map(|c| c.text.clone())
    }

    /// Remove the text for `link`. Returns whether it was present.
    pub fn remove(&self, link: &str) -> bool {
        self.lock().texts.remove(link).is_some()
    }

    pub fn has(&self, link: &str) -> bool {
        self.lock().texts.contains_key(link)
    }

    /// Take every cached text in insertion order, prefixed for the summarizer.
    ///
    /// The cache holds no texts afterwards; models are kept.
    pub fn drain_for_summarization(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, CachedText)> = self.lock().texts.drain().collect();
        entries.sort_by_key(|(_, c)| c.seq);
        entries
            .into_iter()
            .map(|(link, c)| (link, format!("{SUMMARIZE_PREFIX}{}", c.text)))
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let count = state.texts.len();
        let total_chars: usize = state.texts.values().map(|c| c.text.chars().count()).sum();
        CacheStats {
            count,
            total_chars,
            avg_len: if count == 0 { 0 } else { total_chars / count },
        }
    }

    /// Drop every text and the stored models.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.texts.clear();
        state.models = None;
    }

    pub fn store_models(&self, artifacts: Arc<ClusterArtifacts>) {
        self.lock().models = Some(artifacts);
    }

    pub fn get_models(&self) -> Option<Arc<ClusterArtifacts>> {
        self.lock().models.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::{ClusterModel, VectorModel};

    #[test]
    fn put_get_remove() {
        let cache = TextCache::new();
        cache.put("https://a.com/1", "texto um");
        assert!(cache.has("https://a.com/1"));
        assert_eq!(cache.get("https://a.com/1").as_deref(), Some("texto um"));

        assert!(cache.remove("https://a.com/1"));
        assert!(!cache.remove("https://a.com/1"));
        assert_eq!(cache.get("https://a.com/1"), None);
    }

    #[test]
    fn drain_keeps_insertion_order() {
        let cache = TextCache::new();
        for n in [3, 1, 2] {
            cache.put(&format!("https://a.com/{n}"), format!("texto {n}"));
        }
        // replacing does not move the entry
        cache.put("https://a.com/3", "texto 3 revisto");

        let drained = cache.drain_for_summarization();
        let links: Vec<&str> = drained.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(links, ["https://a.com/3", "https://a.com/1", "https://a.com/2"]);
        assert_eq!(drained[0].1, "summarize: texto 3 revisto");
        assert_eq!(cache.stats().count, 0);
    }

    #[test]
    fn stats_use_integer_average() {
        let cache = TextCache::new();
        assert_eq!(cache.stats(), CacheStats::default());

        cache.put("a", "abc");
        cache.put("b", "abcd");
        assert_eq!(
            cache.stats(),
            CacheStats {
                count: 2,
                total_chars: 7,
                avg_len: 3,
            }
        );
    }

    #[test]
    fn models_slot_and_clear() {
        let cache = TextCache::new();
        assert!(cache.get_models().is_none());

        let artifacts = Arc::new(ClusterArtifacts {
            vectors: VectorModel {
                vocabulary: vec!["marca".into()],
                idf: vec![1.0],
            },
            clusters: ClusterModel {
                centroids: vec![vec![1.0]],
                inertia: 0.0,
            },
        });
        cache.store_models(Arc::clone(&artifacts));
        cache.put("a", "texto");
        assert_eq!(cache.get_models().unwrap().vectors.vocabulary, ["marca"]);

        cache.clear();
        assert!(cache.get_models().is_none());
        assert!(!cache.has("a"));
    }

    #[test]
    fn concurrent_writers() {
        let cache = Arc::new(TextCache::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        cache.put(&format!("{t}-{i}"), "x");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.stats().count, 200);
    }
}
