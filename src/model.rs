use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Title stored when no title candidate matched.
pub const UNTITLED: &str = "untitled";

/// A parsed product page.
///
/// Values produced by the extractor are *detached*: `id` and `created_at`
/// are `None` until the orchestrator resolves the record against the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Option<i64>,
    pub url: String,
    pub title: String,
    /// Zero means "no price found". Never negative.
    pub price: Decimal,
    pub description: String,
    pub parsed_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Product {
    pub fn detached(
        url: impl Into<String>,
        title: impl Into<String>,
        price: Decimal,
        description: impl Into<String>,
    ) -> Self {
        Product {
            id: None,
            url: url.into(),
            title: title.into(),
            price: price.max(Decimal::ZERO),
            description: description.into(),
            parsed_at: now(),
            created_at: None,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.id.is_none()
    }

    /// Carry the stored identity onto a fresh extraction so saving it
    /// updates the existing row.
    pub fn adopt_identity(&mut self, existing: &Product) {
        self.id = existing.id;
        self.created_at = existing.created_at;
    }

    pub fn has_price(&self) -> bool {
        self.price > Decimal::ZERO
    }
}

/// Current time at the precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
