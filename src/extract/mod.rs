pub mod description;
pub mod price;
pub mod title;

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};

use crate::error::ExtractError;
use crate::model::Product;

pub use price::normalize_price;

/// Elements whose text never reaches the rendered page.
const HIDDEN: &[&str] = &["script", "style", "noscript", "template"];

/// Derive a detached [`Product`] from raw page markup.
///
/// Every field walks its own fallback ladder; a candidate that does not
/// match simply falls through. The only hard failure is a payload that is
/// not text markup at all.
#[instrument(level = "debug", skip(markup), fields(bytes = markup.len()))]
pub fn extract(url: &str, markup: &str) -> Result<Product, ExtractError> {
    if looks_binary(markup) {
        return Err(ExtractError::MalformedMarkup { url: url.to_string() });
    }

    let doc = Html::parse_document(markup);
    let title = title::extract(&doc);
    let price = price::extract(&doc);
    let description = description::extract(&doc);

    debug!(%title, %price, description_len = description.len(), "fields extracted");
    Ok(Product::detached(url, title, price, description))
}

fn looks_binary(markup: &str) -> bool {
    markup.as_bytes().iter().take(1024).any(|b| *b == 0)
}

/// Run an ordered ladder of candidates and return the first accepted value,
/// logging which rung produced it.
fn climb<T>(
    field: &str,
    doc: &Html,
    ladder: &[(&str, fn(&Html) -> Option<T>)],
    accept: impl Fn(&T) -> bool,
) -> Option<T> {
    ladder.iter().find_map(|(rung, candidate)| {
        let value = candidate(doc).filter(|v| accept(v))?;
        debug!(field, rung, "candidate accepted");
        Some(value)
    })
}

/// Rendered text of an element with whitespace collapsed, skipping
/// script and style bodies.
pub(crate) fn text_of(el: ElementRef<'_>) -> String {
    collapse(el.descendants().filter_map(|node| {
        let text = node.value().as_text()?;
        let parent = node.parent().and_then(ElementRef::wrap)?;
        (!HIDDEN.contains(&parent.value().name())).then_some(&**text)
    }))
}

/// Text nodes that are direct children of `el`.
pub(crate) fn own_text(el: ElementRef<'_>) -> String {
    collapse(el.children().filter_map(|node| node.value().as_text().map(|t| &**t)))
}

fn collapse<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for word in parts.flat_map(str::split_whitespace) {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Text of the first element matching `selector`, if it has any.
pub(crate) fn first_text(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector)
        .next()
        .map(text_of)
        .filter(|t| !t.is_empty())
}

/// Value of `attr` on the first matching element that carries it.
pub(crate) fn first_attr(doc: &Html, selector: &Selector, attr: &str) -> Option<String> {
    doc.select(selector)
        .find_map(|el| el.value().attr(attr))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
