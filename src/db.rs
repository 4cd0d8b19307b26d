use std::cmp::Ordering;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rayon::prelude::*;
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;

use crate::error::PersistError;
use crate::model::Product;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS products (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            url         TEXT UNIQUE NOT NULL,
            title       TEXT NOT NULL,
            price       TEXT NOT NULL DEFAULT '0',
            description TEXT NOT NULL DEFAULT '',
            parsed_at   TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_products_parsed_at ON products(parsed_at);
        ",
    )?;
    Ok(())
}

/// Persistent products keyed by URL.
pub trait ProductStore: Send + Sync {
    fn find_by_url(&self, url: &str) -> Result<Option<Product>, PersistError>;

    fn exists_by_url(&self, url: &str) -> Result<bool, PersistError>;

    /// Update the row for `product.id`, or insert when the product is
    /// detached. Returns the stored row with id and created_at populated.
    fn upsert(&self, product: &Product) -> Result<Product, PersistError>;

    fn find_filtered(
        &self,
        filter: &ProductFilter,
        page: &PageRequest,
    ) -> Result<Page<Product>, PersistError>;

    /// Products priced above `threshold`, most expensive first.
    fn find_expensive(&self, threshold: Decimal) -> Result<Vec<Product>, PersistError>;

    fn count(&self) -> Result<usize, PersistError>;
}

// ── Reads ──

#[derive(Debug, Clone, Default)]
pub struct ProductFilter {
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    /// Case-insensitive substring of the title.
    pub title_contains: Option<String>,
}

impl ProductFilter {
    fn matches(&self, product: &Product, needle: Option<&str>) -> bool {
        self.min_price.map_or(true, |min| product.price >= min)
            && self.max_price.map_or(true, |max| product.price <= max)
            && needle.map_or(true, |n| product.title.to_lowercase().contains(n))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Id,
    Title,
    Price,
    ParsedAt,
    CreatedAt,
}

impl FromStr for SortKey {
    type Err = std::convert::Infallible;

    /// Unknown keys sort by id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().replace('_', "").as_str() {
            "title" => SortKey::Title,
            "price" => SortKey::Price,
            "parsedat" => SortKey::ParsedAt,
            "createdat" => SortKey::CreatedAt,
            _ => SortKey::Id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortOrder {
    pub key: SortKey,
    pub descending: bool,
}

impl SortOrder {
    /// Parse `"price"`, `"price,desc"` or `"title,asc"`.
    pub fn parse(spec: &str) -> SortOrder {
        let mut parts = spec.splitn(2, ',');
        let key = parts.next().unwrap_or_default().parse().unwrap_or(SortKey::Id);
        let descending = parts
            .next()
            .map(|d| d.trim().eq_ignore_ascii_case("desc"))
            .unwrap_or(false);
        SortOrder { key, descending }
    }

    fn compare(&self, a: &Product, b: &Product) -> Ordering {
        let ord = match self.key {
            SortKey::Id => a.id.cmp(&b.id),
            SortKey::Title => a.title.cmp(&b.title),
            SortKey::Price => a.price.cmp(&b.price),
            SortKey::ParsedAt => a.parsed_at.cmp(&b.parsed_at),
            SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
        };
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    /// Zero-based.
    pub page: usize,
    pub size: usize,
    pub sort: Vec<SortOrder>,
}

impl Default for PageRequest {
    fn default() -> Self {
        PageRequest { page: 0, size: 20, sort: Vec::new() }
    }
}

impl PageRequest {
    fn compare(&self, a: &Product, b: &Product) -> Ordering {
        self.sort
            .iter()
            .map(|order| order.compare(a, b))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| a.id.cmp(&b.id))
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub size: usize,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> usize {
        if self.size == 0 {
            0
        } else {
            self.total.div_ceil(self.size)
        }
    }
}

// ── SQLite ──

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

pub struct StoreStats {
    pub products: usize,
    pub priced: usize,
    pub last_parsed_at: Option<DateTime<Utc>>,
}

const COLUMNS: &str = "id, url, title, price, description, parsed_at, created_at";

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = connect(path)?;
        init_schema(&conn)?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PersistError> {
        self.conn.lock().map_err(|_| PersistError::Poisoned)
    }

    fn load_all(&self) -> Result<Vec<Product>, PersistError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM products", COLUMNS))?;
        let rows = stmt
            .query_map([], RawRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRow::into_product).collect()
    }

    pub fn stats(&self) -> Result<StoreStats, PersistError> {
        let products = self.load_all()?;
        Ok(StoreStats {
            priced: products.iter().filter(|p| p.has_price()).count(),
            last_parsed_at: products.iter().map(|p| p.parsed_at).max(),
            products: products.len(),
        })
    }

    fn insert_or_merge(conn: &Connection, product: &Product) -> Result<Product, PersistError> {
        // A concurrent insert for the same URL turns into an update (last write wins).
        let sql = format!(
            "INSERT INTO products (url, title, price, description, parsed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                price = excluded.price,
                description = excluded.description,
                parsed_at = excluded.parsed_at
             RETURNING {}",
            COLUMNS
        );
        let raw = conn.query_row(
            &sql,
            rusqlite::params![
                product.url,
                product.title,
                product.price.to_string(),
                product.description,
                timestamp(&product.parsed_at),
            ],
            RawRow::read,
        )?;
        raw.into_product()
    }
}

impl ProductStore for SqliteStore {
    fn find_by_url(&self, url: &str) -> Result<Option<Product>, PersistError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM products WHERE url = ?1", COLUMNS),
                [url],
                RawRow::read,
            )
            .optional()?;
        raw.map(RawRow::into_product).transpose()
    }

    fn exists_by_url(&self, url: &str) -> Result<bool, PersistError> {
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM products WHERE url = ?1)",
            [url],
            |r| r.get(0),
        )?;
        Ok(exists)
    }

    fn upsert(&self, product: &Product) -> Result<Product, PersistError> {
        let conn = self.lock()?;
        let Some(id) = product.id else {
            return Self::insert_or_merge(&conn, product);
        };
        let updated = conn
            .query_row(
                &format!(
                    "UPDATE products
                     SET title = ?2, price = ?3, description = ?4, parsed_at = ?5
                     WHERE id = ?1
                     RETURNING {}",
                    COLUMNS
                ),
                rusqlite::params![
                    id,
                    product.title,
                    product.price.to_string(),
                    product.description,
                    timestamp(&product.parsed_at),
                ],
                RawRow::read,
            )
            .optional()?;
        match updated {
            Some(raw) => raw.into_product(),
            // Row vanished between lookup and save.
            None => Self::insert_or_merge(&conn, product),
        }
    }

    fn find_filtered(
        &self,
        filter: &ProductFilter,
        page: &PageRequest,
    ) -> Result<Page<Product>, PersistError> {
        let needle = filter
            .title_contains
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);

        let mut matching: Vec<Product> = self
            .load_all()?
            .into_par_iter()
            .filter(|p| filter.matches(p, needle.as_deref()))
            .collect();
        matching.par_sort_by(|a, b| page.compare(a, b));

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(page.page.saturating_mul(page.size))
            .take(page.size)
            .collect();
        Ok(Page { items, total, page: page.page, size: page.size })
    }

    fn find_expensive(&self, threshold: Decimal) -> Result<Vec<Product>, PersistError> {
        let mut expensive: Vec<Product> = self
            .load_all()?
            .into_par_iter()
            .filter(|p| p.price > threshold)
            .collect();
        expensive.par_sort_by(|a, b| b.price.cmp(&a.price));
        Ok(expensive)
    }

    fn count(&self) -> Result<usize, PersistError> {
        let conn = self.lock()?;
        let n: usize = conn.query_row("SELECT COUNT(*) FROM products", [], |r| r.get(0))?;
        Ok(n)
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

struct RawRow {
    id: i64,
    url: String,
    title: String,
    price: String,
    description: String,
    parsed_at: String,
    created_at: String,
}

impl RawRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            id: row.get(0)?,
            url: row.get(1)?,
            title: row.get(2)?,
            price: row.get(3)?,
            description: row.get(4)?,
            parsed_at: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_product(self) -> Result<Product, PersistError> {
        let corrupt = |message: String| PersistError::Corrupt { url: self.url.clone(), message };
        let price = Decimal::from_str(&self.price).map_err(|e| corrupt(format!("price: {}", e)))?;
        let parsed_at = parse_time(&self.parsed_at).map_err(|e| corrupt(format!("parsed_at: {}", e)))?;
        let created_at =
            parse_time(&self.created_at).map_err(|e| corrupt(format!("created_at: {}", e)))?;
        Ok(Product {
            id: Some(self.id),
            url: self.url,
            title: self.title,
            price,
            description: self.description,
            parsed_at,
            created_at: Some(created_at),
        })
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc))
}
