use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{error, info, warn};
use url::Url;

use crate::fetch::Fetcher;

/// Load the product backlog: a JSON array of paths joined onto `base_url`.
///
/// Any problem with the file yields an empty backlog.
pub fn load_links_file(path: &Path, base_url: &str) -> Vec<String> {
    match read_links(path, base_url) {
        Ok(urls) => {
            info!("loaded {} product links from {}", urls.len(), path.display());
            urls
        }
        Err(e) => {
            error!("failed to load product links from {}: {:#}", path.display(), e);
            Vec::new()
        }
    }
}

fn read_links(path: &Path, base_url: &str) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path).context("cannot read links file")?;
    let paths: Vec<String> =
        serde_json::from_str(&raw).context("links file must be a JSON array of strings")?;
    Ok(paths
        .iter()
        .filter_map(|p| match absolute(base_url, p) {
            Some(url) => Some(url),
            None => {
                warn!("skipping unusable link {:?}", p);
                None
            }
        })
        .collect())
}

fn absolute(base_url: &str, path: &str) -> Option<String> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    if let Ok(url) = Url::parse(path) {
        return matches!(url.scheme(), "http" | "https").then(|| url.to_string());
    }
    Some(format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/')))
}

/// Fetch a sitemap and keep the `<loc>` URLs matching `pattern`.
pub async fn fetch_sitemap_urls(
    fetcher: &dyn Fetcher,
    sitemap_url: &str,
    pattern: &Regex,
) -> Result<Vec<String>> {
    info!("fetching sitemap: {}", sitemap_url);
    let xml = fetcher
        .fetch(sitemap_url)
        .await
        .context("failed to fetch sitemap")?;

    let all_urls = parse_urlset(&xml)?;
    info!("total urls in sitemap: {}", all_urls.len());

    let filtered: Vec<String> = all_urls.into_iter().filter(|u| pattern.is_match(u)).collect();
    info!("product pages after filtering: {}", filtered.len());
    Ok(filtered)
}

/// Parse a urlset XML and return all <loc> URLs.
fn parse_urlset(xml: &str) -> Result<Vec<String>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut urls = Vec::new();
    let mut in_url = false;
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.name().as_ref() {
                b"url" => in_url = true,
                b"loc" if in_url => in_loc = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(e)) if in_loc => {
                let loc = e.unescape()?;
                let loc = loc.trim();
                if !loc.is_empty() {
                    urls.push(loc.to_string());
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.name().as_ref() {
                b"loc" => in_loc = false,
                b"url" => in_url = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
        buf.clear();
    }
    Ok(urls)
}
