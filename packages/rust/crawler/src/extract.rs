//! Article body text extraction.
//!
//! The body of an article is the text of every `<p>` inside its content
//! block, each paragraph trimmed and joined with single spaces.

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

static PARAGRAPH: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p").expect("valid selector"));

static ARTICLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("article").expect("valid selector"));

/// Paragraph text of the first element matching `container`.
pub fn paragraph_text(doc: &Html, container: &Selector) -> Option<String> {
    let block = doc.select(container).next()?;
    join_paragraphs(block)
}

/// Paragraph text of the page's first `<article>`.
pub fn fallback_text(doc: &Html) -> Option<String> {
    paragraph_text(doc, &ARTICLE)
}

fn join_paragraphs(block: ElementRef<'_>) -> Option<String> {
    let paragraphs: Vec<String> = block
        .select(&PARAGRAPH)
        .map(|p| {
            p.text()
                .flat_map(str::split_whitespace)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|t| !t.is_empty())
        .collect();

    if paragraphs.is_empty() {
        None
    } else {
        Some(paragraphs.join(" "))
    }
}
