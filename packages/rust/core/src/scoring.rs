//! Keyword relevance scoring and top-N selection.
//!
//! A score is the sum of category weights over the keywords present in a
//! text. Matching is whole-word and case-insensitive; how often a term occurs
//! does not matter.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;

use newsdigest_shared::{NewsDigestError, Result, ScoringConfig, ScoringMode, StagingItem};

struct CompiledCategory {
    name: String,
    weight: u32,
    terms: Vec<Regex>,
}

/// Deterministic keyword scorer.
pub struct ScoringEngine {
    mode: ScoringMode,
    categories: Vec<CompiledCategory>,
}

/// A staging item with its relevance score attached.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredItem {
    pub item: StagingItem,
    pub relevance: u32,
}

impl ScoringEngine {
    /// Compile every configured term into a whole-word matcher.
    pub fn new(config: &ScoringConfig) -> Result<Self> {
        let mut categories = Vec::with_capacity(config.categories.len());
        for (name, category) in &config.categories {
            let terms = category
                .terms
                .iter()
                .map(|term| {
                    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term.trim()))).map_err(|e| {
                        NewsDigestError::config(format!(
                            "scoring category '{name}': bad term '{term}': {e}"
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            categories.push(CompiledCategory {
                name: name.clone(),
                weight: category.weight,
                terms,
            });
        }

        Ok(Self {
            mode: config.mode,
            categories,
        })
    }

    /// Relevance of `text`. Saturates at `u32::MAX`.
    pub fn score(&self, text: &str) -> u32 {
        self.categories
            .iter()
            .map(|category| {
                let hits = category.terms.iter().filter(|re| re.is_match(text)).count() as u32;
                match self.mode {
                    ScoringMode::PerTerm => hits.saturating_mul(category.weight),
                    ScoringMode::PerCategory => u32::from(hits > 0) * category.weight,
                }
            })
            .fold(0, u32::saturating_add)
    }

    /// Score per category, for diagnostics.
    pub fn breakdown(&self, text: &str) -> BTreeMap<String, u32> {
        self.categories
            .iter()
            .map(|c| {
                let hits = c.terms.iter().filter(|re| re.is_match(text)).count() as u32;
                (c.name.clone(), hits)
            })
            .collect()
    }

    /// Score every item on `title + " " + summary` and keep the best `n`.
    ///
    /// The sort is stable: equal scores keep their input order.
    pub fn select_top_n(&self, items: Vec<StagingItem>, n: usize) -> Vec<ScoredItem> {
        let mut scored: Vec<ScoredItem> = items
            .into_iter()
            .map(|item| {
                let text = format!("{} {}", item.title, item.summary.as_deref().unwrap_or(""));
                ScoredItem {
                    relevance: self.score(&text),
                    item,
                }
            })
            .collect();

        scored.sort_by(|a, b| b.relevance.cmp(&a.relevance));
        scored.truncate(n);
        scored
    }
}

/// Mean relevance of the scored items per cluster.
pub fn cluster_relevance(items: &[ScoredItem]) -> BTreeMap<i64, f64> {
    let mut sums: BTreeMap<i64, (u64, u64)> = BTreeMap::new();
    for scored in items {
        let Some(cluster) = scored.item.cluster else {
            continue;
        };
        let entry = sums.entry(cluster).or_default();
        entry.0 += u64::from(scored.relevance);
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(cluster, (sum, count))| (cluster, sum as f64 / count as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use newsdigest_shared::{KeywordCategory, Stage};

    fn engine(mode: ScoringMode) -> ScoringEngine {
        ScoringEngine::new(&ScoringConfig {
            mode,
            ..ScoringConfig::default()
        })
        .unwrap()
    }

    fn item(n: i64, title: &str, summary: &str, cluster: i64) -> StagingItem {
        StagingItem {
            id: n,
            title: title.into(),
            link: format!("https://exame.com/{n}"),
            image: None,
            source: "Exame".into(),
            summary: Some(summary.into()),
            cluster: Some(cluster),
            collected_at: Utc::now(),
            processed_at: Some(Utc::now()),
            stage: Stage::Clustered,
        }
    }

    #[test]
    fn default_mode_adds_every_matching_term() {
        let e = engine(ScoringMode::PerTerm);
        // google (5) + lança (3) + campanha (3)
        assert_eq!(e.score("Google lança nova campanha"), 11);
    }

    #[test]
    fn per_category_mode_caps_each_category() {
        let e = engine(ScoringMode::PerCategory);
        assert_eq!(e.score("Google lança nova campanha"), 8);
    }

    #[test]
    fn matching_is_whole_word_and_case_insensitive() {
        let e = engine(ScoringMode::PerTerm);
        assert_eq!(e.score("GOOGLE"), 5);
        // "ia" must not match inside "mídia" or "dia"
        assert_eq!(e.score("mídia do dia"), 0);
        assert_eq!(e.score("a IA chegou"), 2);
        assert_eq!(e.score("McDonald's e Coca-Cola"), 10);
    }

    #[test]
    fn presence_not_frequency() {
        let e = engine(ScoringMode::PerTerm);
        assert_eq!(e.score("google google google"), e.score("google"));
    }

    #[test]
    fn adding_a_term_never_lowers_the_score() {
        let headlines = [
            "",
            "Nubank anuncia parceria",
            "Google lança nova campanha",
            "mídia do dia",
            "Apple e Nike fazem evento com IA",
        ];
        let added = [
            "inteligência artificial",
            "google",
            "CAMPANHA",
            "nada relevante",
            "IA",
            "Coca-Cola",
            "Google lança nova campanha",
        ];

        for mode in [ScoringMode::PerTerm, ScoringMode::PerCategory] {
            let e = engine(mode);
            for headline in headlines {
                let base = e.score(headline);
                for term in added {
                    let extended = format!("{headline} {term}");
                    assert!(
                        e.score(&extended) >= base,
                        "{mode:?}: '{extended}' scored below '{headline}'"
                    );
                }
            }
        }
    }

    #[test]
    fn huge_weights_saturate() {
        let mut categories = BTreeMap::new();
        for name in ["a", "b"] {
            categories.insert(
                name.to_string(),
                KeywordCategory {
                    terms: vec!["google".into(), "apple".into()],
                    weight: u32::MAX,
                },
            );
        }
        for mode in [ScoringMode::PerTerm, ScoringMode::PerCategory] {
            let e = ScoringEngine::new(&ScoringConfig {
                mode,
                categories: categories.clone(),
            })
            .unwrap();
            assert_eq!(e.score("google e apple"), u32::MAX);
            assert_eq!(e.score("nada"), 0);
        }
    }

    #[test]
    fn select_is_bounded_sorted_and_stable() {
        let e = engine(ScoringMode::PerTerm);
        let items = vec![
            item(1, "Sem palavras", "nada aqui", 0),
            item(2, "Google", "", 1),
            item(3, "Apple", "", 1),
            item(4, "Campanha", "da Nike", 2),
        ];

        let top = e.select_top_n(items.clone(), 3);
        let ids: Vec<i64> = top.iter().map(|s| s.item.id).collect();
        assert_eq!(ids, [4, 2, 3]);
        assert!(top.windows(2).all(|w| w[0].relevance >= w[1].relevance));

        assert_eq!(e.select_top_n(items.clone(), 10).len(), 4);
        assert!(e.select_top_n(items, 0).is_empty());
    }

    #[test]
    fn per_cluster_mean() {
        let e = engine(ScoringMode::PerTerm);
        let scored = e.select_top_n(
            vec![
                item(1, "Google", "", 0),
                item(2, "nada", "", 0),
                item(3, "Apple evento", "", 1),
            ],
            3,
        );
        let means = cluster_relevance(&scored);
        assert_eq!(means[&0], 2.5);
        assert_eq!(means[&1], 8.0);
    }

    #[test]
    fn breakdown_counts_hits() {
        let e = engine(ScoringMode::PerTerm);
        let b = e.breakdown("Google lança nova campanha");
        assert_eq!(b["marcas_grandes"], 1);
        assert_eq!(b["campanhas_e_acoes"], 2);
        assert_eq!(b["palavras_de_impacto"], 0);
    }
}
