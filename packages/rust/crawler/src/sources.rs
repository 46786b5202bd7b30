//! Per-site scrapers built from `[[sources]]` configuration.
//!
//! A [`SourceScraper`] knows how to read one site's listing page into
//! candidates and how to pull the body text out of one of its articles.
//! [`SourceRegistry`] holds them in configuration order.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use newsdigest_shared::{Candidate, NewsDigestError, Result, SourceConfig};

use crate::extract::{fallback_text, paragraph_text};

// ---------------------------------------------------------------------------
// SourceScraper
// ---------------------------------------------------------------------------

/// Compiled selectors for one news site.
#[derive(Debug)]
pub struct SourceScraper {
    name: String,
    listing_url: Url,
    article: Selector,
    title: Selector,
    link: Option<Selector>,
    image: Option<Selector>,
    content: Selector,
}

impl SourceScraper {
    /// Compile a source's selectors. Fails on an invalid URL or selector.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let listing_url = Url::parse(&config.listing_url).map_err(|e| {
            NewsDigestError::config(format!(
                "source '{}': invalid listing_url '{}': {e}",
                config.name, config.listing_url
            ))
        })?;

        Ok(Self {
            name: config.name.clone(),
            listing_url,
            article: compile(&config.name, &config.article_selector)?,
            title: compile(&config.name, &config.title_selector)?,
            link: config
                .link_selector
                .as_deref()
                .map(|s| compile(&config.name, s))
                .transpose()?,
            image: config
                .image_selector
                .as_deref()
                .map(|s| compile(&config.name, s))
                .transpose()?,
            content: compile(&config.name, &config.content_selector)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listing_url(&self) -> &Url {
        &self.listing_url
    }

    /// Read every article card of a listing page.
    ///
    /// Links and images are resolved against the listing URL; cards without a
    /// title or link are skipped and repeated links keep their first card.
    pub fn parse_listing(&self, html: &str) -> Vec<Candidate> {
        let doc = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for card in doc.select(&self.article) {
            let Some(title_el) = card.select(&self.title).next() else {
                continue;
            };
            let title = element_text(title_el);
            if title.is_empty() {
                continue;
            }

            let Some(link) = self.card_link(card, title_el) else {
                continue;
            };
            if !seen.insert(link.clone()) {
                continue;
            }

            candidates.push(Candidate {
                title,
                link,
                image: self.card_image(card),
                source: self.name.clone(),
            });
        }

        candidates
    }

    /// Body text of an article page, or `None` if the content block is
    /// missing or has no paragraphs.
    pub fn extract_text(&self, html: &str) -> Option<String> {
        let doc = Html::parse_document(html);
        paragraph_text(&doc, &self.content)
    }

    fn card_link(&self, card: ElementRef<'_>, title_el: ElementRef<'_>) -> Option<String> {
        let href = match &self.link {
            Some(sel) => card
                .select(sel)
                .find_map(|el| el.value().attr("href")),
            None => title_el
                .value()
                .attr("href")
                .or_else(|| first_href(title_el))
                .or_else(|| first_href(card)),
        }?;
        self.resolve(href)
    }

    fn card_image(&self, card: ElementRef<'_>) -> Option<String> {
        let sel = self.image.as_ref()?;
        card.select(sel)
            .find_map(|el| {
                ["src", "data-src", "data-bg"]
                    .into_iter()
                    .filter_map(|attr| el.value().attr(attr))
                    .find(|v| !v.trim().is_empty() && !v.starts_with("data:"))
            })
            .and_then(|src| self.resolve(src))
    }

    fn resolve(&self, href: &str) -> Option<String> {
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
            return None;
        }
        let mut url = self.listing_url.join(href).ok()?;
        url.set_fragment(None);
        Some(url.to_string())
    }
}

fn compile(source: &str, selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| {
        NewsDigestError::parse(format!(
            "source '{source}': invalid selector '{selector}': {e}"
        ))
    })
}

static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));

fn first_href<'a>(el: ElementRef<'a>) -> Option<&'a str> {
    el.select(&ANCHOR).find_map(|a| a.value().attr("href"))
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Holds the configured scrapers in configuration order.
#[derive(Debug)]
pub struct SourceRegistry {
    scrapers: Vec<SourceScraper>,
}

impl SourceRegistry {
    /// Compile every configured source. The first invalid one aborts.
    pub fn from_config(sources: &[SourceConfig]) -> Result<Self> {
        let scrapers = sources
            .iter()
            .map(SourceScraper::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { scrapers })
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceScraper> {
        self.scrapers.iter()
    }

    pub fn len(&self) -> usize {
        self.scrapers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scrapers.is_empty()
    }

    /// Find a scraper by source name.
    pub fn get(&self, name: &str) -> Option<&SourceScraper> {
        self.scrapers.iter().find(|s| s.name == name)
    }

    /// Body text for an article of `source`.
    ///
    /// Unknown sources fall back to the paragraphs of the page's `<article>`.
    pub fn extract_text(&self, source: &str, html: &str) -> Option<String> {
        match self.get(source) {
            Some(scraper) => scraper.extract_text(html),
            None => fallback_text(&Html::parse_document(html)),
        }
    }
}
