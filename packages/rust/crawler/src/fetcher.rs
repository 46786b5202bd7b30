//! HTTP side of collection and extraction.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use newsdigest_shared::{Candidate, HttpConfig, NewsDigestError, Result, SourceConfig};

use crate::sources::SourceRegistry;

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Produces candidate articles from the configured sites.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Collect from every source. Per-source failures are reported, not raised.
    async fn collect(&self) -> CollectionReport;
}

/// Fetches the full body text of one article.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// `Ok(None)` when the page was fetched but has no readable body.
    async fn extract_text(&self, link: &str, source: &str) -> Result<Option<String>>;
}

/// Success/failure counts for one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceTally {
    pub success: usize,
    pub failed: usize,
}

/// Outcome of one collection pass.
#[derive(Debug, Clone, Default)]
pub struct CollectionReport {
    pub candidates: Vec<Candidate>,
    /// Candidates found per source; `failed` is 1 when the listing could not be read.
    pub per_source: BTreeMap<String, SourceTally>,
    /// Errors encountered (source, error message).
    pub errors: Vec<(String, String)>,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// NewsFetcher
// ---------------------------------------------------------------------------

/// Sequential HTTP fetcher over the configured sources.
pub struct NewsFetcher {
    client: Client,
    registry: SourceRegistry,
    request_delay: Duration,
}

impl NewsFetcher {
    /// Build the HTTP client and compile every source.
    pub fn new(http: &HttpConfig, sources: &[SourceConfig]) -> Result<Self> {
        let client = Client::builder()
            .user_agent(http.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(http.timeout_secs))
            .build()
            .map_err(|e| NewsDigestError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            registry: SourceRegistry::from_config(sources)?,
            request_delay: Duration::from_millis(http.request_delay_ms),
        })
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    async fn fetch_html(&self, url: &str) -> Result<String> {
        debug!(%url, "fetching");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| NewsDigestError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NewsDigestError::Network(format!("{url}: HTTP {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| NewsDigestError::Network(format!("{url}: body read failed: {e}")))
    }

    async fn pause(&self) {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
    }
}

#[async_trait]
impl Collector for NewsFetcher {
    #[instrument(skip_all, fields(sources = self.registry.len()))]
    async fn collect(&self) -> CollectionReport {
        let start = Instant::now();
        let mut report = CollectionReport::default();

        for (i, scraper) in self.registry.iter().enumerate() {
            if i > 0 {
                self.pause().await;
            }
            let tally = report
                .per_source
                .entry(scraper.name().to_string())
                .or_default();

            match self.fetch_html(scraper.listing_url().as_str()).await {
                Ok(html) => {
                    let found = scraper.parse_listing(&html);
                    info!(source = scraper.name(), found = found.len(), "listing parsed");
                    tally.success = found.len();
                    report.candidates.extend(found);
                }
                Err(e) => {
                    warn!(source = scraper.name(), error = %e, "listing fetch failed");
                    tally.failed = 1;
                    report.errors.push((scraper.name().to_string(), e.to_string()));
                }
            }
        }

        report.duration = start.elapsed();
        report
    }
}

#[async_trait]
impl TextExtractor for NewsFetcher {
    async fn extract_text(&self, link: &str, source: &str) -> Result<Option<String>> {
        let html = self.fetch_html(link).await;
        self.pause().await;
        Ok(self.registry.extract_text(source, &html?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http() -> HttpConfig {
        HttpConfig {
            timeout_secs: 5,
            request_delay_ms: 0,
            ..HttpConfig::default()
        }
    }

    fn source(name: &str, listing_url: String) -> SourceConfig {
        SourceConfig {
            name: name.into(),
            listing_url,
            article_selector: "article.post".into(),
            title_selector: "h3 a".into(),
            link_selector: None,
            image_selector: None,
            content_selector: "div.__content".into(),
        }
    }

    #[tokio::test]
    async fn collects_from_every_source() {
        let server = MockServer::start().await;

        let listing = r#"<html><body>
            <article class="post"><h3><a href="/noticia-1">Primeira</a></h3></article>
            <article class="post"><h3><a href="/noticia-2">Segunda</a></h3></article>
        </body></html>"#;

        Mock::given(method("GET"))
            .and(path("/marketing"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/quebrado"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sources = vec![
            source("Meio e Mensagem", format!("{}/marketing", server.uri())),
            source("GKPB", format!("{}/quebrado", server.uri())),
        ];
        let fetcher = NewsFetcher::new(&http(), &sources).unwrap();
        let report = fetcher.collect().await;

        assert_eq!(report.candidates.len(), 2);
        assert_eq!(
            report.candidates[0].link,
            format!("{}/noticia-1", server.uri())
        );
        assert_eq!(
            report.per_source["Meio e Mensagem"],
            SourceTally {
                success: 2,
                failed: 0
            }
        );
        assert_eq!(report.per_source["GKPB"].failed, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].1.contains("503"));
    }

    #[tokio::test]
    async fn extracts_article_text() {
        let server = MockServer::start().await;

        let article = r#"<html><body><div class="__content">
            <p>A marca anunciou uma campanha.</p><p>O lançamento será em maio.</p>
        </div></body></html>"#;

        Mock::given(method("GET"))
            .and(path("/noticia-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(article))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/paywall"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>Assine</p>"))
            .mount(&server)
            .await;

        let sources = vec![source("Meio e Mensagem", format!("{}/marketing", server.uri()))];
        let fetcher = NewsFetcher::new(&http(), &sources).unwrap();

        let text = fetcher
            .extract_text(&format!("{}/noticia-1", server.uri()), "Meio e Mensagem")
            .await
            .unwrap();
        assert_eq!(
            text.as_deref(),
            Some("A marca anunciou uma campanha. O lançamento será em maio.")
        );

        let none = fetcher
            .extract_text(&format!("{}/paywall", server.uri()), "Meio e Mensagem")
            .await
            .unwrap();
        assert_eq!(none, None);

        let err = fetcher
            .extract_text(&format!("{}/missing", server.uri()), "Meio e Mensagem")
            .await
            .unwrap_err();
        assert!(matches!(err, NewsDigestError::Network(_)));
    }
}
