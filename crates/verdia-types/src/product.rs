use serde::{Deserialize, Serialize};

/// Canonical product record, post-normalization. Wire field names follow the
/// widget payloads (camelCase).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    #[serde(default)]
    pub reference: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: f64,
    pub price_tax_incl: f64,
    /// `None` when no stock data was available for this id.
    #[serde(default)]
    pub stock: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_url: Option<String>,
    #[serde(default)]
    pub active: bool,
}

impl Product {
    /// Whether the product may be shown to a shopper. `batch_has_stock`
    /// reflects whether the snapshot carried any stock data at all: when it
    /// did, an id with no entry is treated as unavailable; when the whole
    /// batch lacked stock data, unknown stock does not exclude the product.
    pub fn displayable(&self, batch_has_stock: bool) -> bool {
        if !self.active {
            return false;
        }
        match self.stock {
            Some(quantity) => quantity > 0,
            None => !batch_has_stock,
        }
    }
}
