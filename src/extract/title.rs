use std::sync::LazyLock;

use scraper::{Html, Selector};

use super::{climb, first_attr, first_text};
use crate::model::UNTITLED;

static MICRODATA_NAME: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"h1[itemprop="name"], h2[itemprop="name"]"#).unwrap());
static SECTION_TITLE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("h1.section-title, h2.section-title, .section-title h1").unwrap()
});
static OG_TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[property="og:title"]"#).unwrap());
static META_TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[name="title"]"#).unwrap());
static H1: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").unwrap());
static DOC_TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());

const LADDER: [(&str, fn(&Html) -> Option<String>); 6] = [
    ("microdata name", microdata_name),
    ("section title", section_title),
    ("og:title", og_title),
    ("meta title", meta_title),
    ("h1", first_h1),
    ("document title", document_title),
];

pub fn extract(doc: &Html) -> String {
    climb("title", doc, &LADDER, |t: &String| !t.is_empty())
        .unwrap_or_else(|| UNTITLED.to_string())
}

fn microdata_name(doc: &Html) -> Option<String> {
    first_text(doc, &MICRODATA_NAME)
}

fn section_title(doc: &Html) -> Option<String> {
    first_text(doc, &SECTION_TITLE)
}

fn og_title(doc: &Html) -> Option<String> {
    first_attr(doc, &OG_TITLE, "content")
}

fn meta_title(doc: &Html) -> Option<String> {
    first_attr(doc, &META_TITLE, "content")
}

fn first_h1(doc: &Html) -> Option<String> {
    first_text(doc, &H1)
}

fn document_title(doc: &Html) -> Option<String> {
    first_text(doc, &DOC_TITLE)
}
