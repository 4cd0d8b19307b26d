use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::{climb, first_attr, first_text, own_text, text_of};

static OFFERS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"[itemprop="offers"]"#).unwrap());
static PRICE_SPAN: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"span[itemprop="price"]"#).unwrap());
static PRICE_TAGGED: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"[itemprop="price"]"#).unwrap());
static META_AMOUNT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[property="product:price:amount"]"#).unwrap());
static DATA_PRICE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[data-price]").unwrap());
static PRICE_CLASS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"[class*="price"]"#).unwrap());
static BODY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

// "89 999 руб", "1 299,90 ₽", "4990р."
static BODY_PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)((?:\d{1,3}(?:\s\d{3})+|\d+)(?:[.,]\d{2})?)\s*(?:₽|руб|р\.|rub\b)").unwrap()
});

const LADDER: [(&str, fn(&Html) -> Option<Decimal>); 7] = [
    ("offer container", offer_containers),
    ("meta product:price:amount", meta_amount),
    ("itemprop price content", itemprop_content),
    ("itemprop price span", price_span),
    ("data-price", data_price),
    ("price class", price_class),
    ("body text scan", body_scan),
];

/// Walk the price ladder. A candidate parsing to zero counts as not found.
pub fn extract(doc: &Html) -> Decimal {
    climb("price", doc, &LADDER, |p: &Decimal| *p > Decimal::ZERO).unwrap_or(Decimal::ZERO)
}

/// Normalize a human-written price.
///
/// Everything except digits, `,` and `.` is dropped and `,` becomes `.`.
/// Empty or unparseable input yields zero.
pub fn normalize_price(text: &str) -> Decimal {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if cleaned.is_empty() {
        return Decimal::ZERO;
    }
    match Decimal::from_str(&cleaned) {
        Ok(value) => value.max(Decimal::ZERO),
        Err(e) => {
            debug!(raw = text, %cleaned, error = %e, "unparseable price");
            Decimal::ZERO
        }
    }
}

fn offer_containers(doc: &Html) -> Option<Decimal> {
    doc.select(&OFFERS).find_map(offer_price)
}

fn offer_price(offer: ElementRef<'_>) -> Option<Decimal> {
    let candidates = [
        offer.select(&PRICE_SPAN).next().map(text_of),
        offer
            .select(&PRICE_TAGGED)
            .find_map(|el| el.value().attr("content"))
            .map(str::to_string),
        offer.select(&PRICE_TAGGED).next().map(text_of),
        Some(own_text(offer)),
        Some(text_of(offer)),
    ];
    candidates
        .into_iter()
        .flatten()
        .map(|text| normalize_price(&text))
        .find(|p| *p > Decimal::ZERO)
}

fn meta_amount(doc: &Html) -> Option<Decimal> {
    first_attr(doc, &META_AMOUNT, "content").map(|t| normalize_price(&t))
}

fn itemprop_content(doc: &Html) -> Option<Decimal> {
    first_attr(doc, &PRICE_TAGGED, "content").map(|t| normalize_price(&t))
}

fn price_span(doc: &Html) -> Option<Decimal> {
    first_text(doc, &PRICE_SPAN).map(|t| normalize_price(&t))
}

fn data_price(doc: &Html) -> Option<Decimal> {
    first_attr(doc, &DATA_PRICE, "data-price").map(|t| normalize_price(&t))
}

fn price_class(doc: &Html) -> Option<Decimal> {
    let el = doc.select(&PRICE_CLASS).next()?;
    let raw = match el.value().attr("data-price").map(str::trim) {
        Some(attr) if !attr.is_empty() => attr.to_string(),
        _ => text_of(el),
    };
    Some(normalize_price(&raw))
}

fn body_scan(doc: &Html) -> Option<Decimal> {
    let body = doc.select(&BODY).next().map(text_of)?;
    let caps = BODY_PRICE_RE.captures(&body)?;
    Some(normalize_price(&caps[1]))
}
