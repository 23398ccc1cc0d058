//! Field extraction from fetched HTML.

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::collections::BTreeMap;
use url::Url;

use super::ScrapeMethod;

const MAX_LINKS: usize = 50;
const MAX_IMAGES: usize = 20;

/// Value extracted for one named selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Exactly one element matched.
    Text(String),
    /// Zero or several elements matched.
    List(Vec<String>),
    /// The selector could not be parsed.
    Missing,
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Payload of a successful scrape.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapedItem {
    pub url: String,
    pub title: Option<String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub links: Vec<String>,
    pub images: Vec<String>,
    /// Structured data returned by an official API.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub method: ScrapeMethod,
    pub scraped_at: DateTime<Utc>,
}

impl ScrapedItem {
    /// Wraps an API payload; there is no markup to extract from.
    pub fn from_payload(url: &Url, payload: serde_json::Value, method: ScrapeMethod) -> Self {
        Self {
            url: url.to_string(),
            title: None,
            fields: BTreeMap::new(),
            links: Vec::new(),
            images: Vec::new(),
            payload: Some(payload),
            method,
            scraped_at: Utc::now(),
        }
    }
}

/// Applies `selectors` to `html` and collects title, links and images.
///
/// Relative link and image URLs are resolved against `base_url`.
pub fn extract_item(
    html: &str,
    selectors: &BTreeMap<String, String>,
    base_url: &Url,
    method: ScrapeMethod,
) -> ScrapedItem {
    let document = Html::parse_document(html);

    let fields = selectors
        .iter()
        .map(|(name, raw)| (name.clone(), extract_field(&document, name, raw)))
        .collect();

    ScrapedItem {
        url: base_url.to_string(),
        title: extract_title(&document),
        fields,
        links: collect_attr(&document, "a[href]", "href", base_url, MAX_LINKS),
        images: collect_attr(&document, "img[src]", "src", base_url, MAX_IMAGES),
        payload: None,
        method,
        scraped_at: Utc::now(),
    }
}

fn extract_field(document: &Html, name: &str, raw: &str) -> FieldValue {
    let selector = match Selector::parse(raw) {
        Ok(selector) => selector,
        Err(err) => {
            log::warn!("selector `{}` for field `{}` is invalid: {}", raw, name, err);
            return FieldValue::Missing;
        }
    };

    let mut values: Vec<String> = document.select(&selector).map(element_text).collect();
    if values.len() == 1 {
        FieldValue::Text(values.remove(0))
    } else {
        FieldValue::List(values)
    }
}

fn extract_title(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(element_text)
        .filter(|title| !title.is_empty())
}

fn collect_attr(document: &Html, css: &str, attr: &str, base_url: &Url, limit: usize) -> Vec<String> {
    let Ok(selector) = Selector::parse(css) else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|el| el.value().attr(attr))
        .filter_map(|value| base_url.join(value.trim()).ok())
        .map(|url| url.to_string())
        .take(limit)
        .collect()
}

/// Element text with whitespace runs collapsed.
fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
