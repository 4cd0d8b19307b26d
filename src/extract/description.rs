use std::sync::LazyLock;

use scraper::{Html, Selector};

use super::{climb, first_attr, text_of};

static PRODUCT_DESCRIPTION: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"[itemtype*="schema.org/Product"] [itemprop="description"]"#).unwrap()
});
static OG_DESCRIPTION: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[property="og:description"]"#).unwrap());
static META_DESCRIPTION: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[name="description"]"#).unwrap());
static DESCRIPTION_BLOCKS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        r#".description, .product-description, [class*="description"], [itemprop="description"], .product-info, .product-details"#,
    )
    .unwrap()
});

const LADDER: [(&str, fn(&Html) -> Option<String>); 4] = [
    ("product microdata", product_microdata),
    ("og:description", og_description),
    ("meta description", meta_description),
    ("description block", description_block),
];

pub fn extract(doc: &Html) -> String {
    climb("description", doc, &LADDER, |d: &String| !d.is_empty()).unwrap_or_default()
}

fn product_microdata(doc: &Html) -> Option<String> {
    let el = doc.select(&PRODUCT_DESCRIPTION).next()?;
    let text = text_of(el);
    if !text.is_empty() {
        return Some(text);
    }
    el.value().attr("content").map(|c| c.trim().to_string())
}

fn og_description(doc: &Html) -> Option<String> {
    first_attr(doc, &OG_DESCRIPTION, "content")
}

fn meta_description(doc: &Html) -> Option<String> {
    first_attr(doc, &META_DESCRIPTION, "content")
}

fn description_block(doc: &Html) -> Option<String> {
    doc.select(&DESCRIPTION_BLOCKS)
        .map(text_of)
        .find(|t| !t.is_empty())
}
