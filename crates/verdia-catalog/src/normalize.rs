use std::collections::HashMap;

use serde_json::Value;

use verdia_types::Product;

use crate::decode::{self, Decoded};

pub const DESCRIPTION_MAX_CHARS: usize = 300;

/// Per-tax-group IVA percentages. Overridable via `TAX_RATES_JSON`
/// (a `{"group": percent}` map).
#[derive(Debug, Clone)]
pub struct TaxTable {
    rates: HashMap<String, f64>,
}

impl Default for TaxTable {
    fn default() -> Self {
        let mut rates = HashMap::new();
        rates.insert("1".to_string(), 0.0);
        rates.insert("2".to_string(), 10.0);
        rates.insert("3".to_string(), 21.0);
        Self { rates }
    }
}

impl TaxTable {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let parsed: HashMap<String, f64> = serde_json::from_str(raw)?;
        Ok(Self { rates: parsed })
    }

    pub fn percent_for(&self, group: &str) -> Option<f64> {
        self.rates.get(group).copied()
    }
}

/// Independently fetched per-id side tables merged into the canonical
/// record. Missing ids are tolerated everywhere.
#[derive(Debug, Clone, Default)]
pub struct SideTables {
    pub stock: HashMap<String, i64>,
    pub default_image: HashMap<String, String>,
    pub price_tax_incl: HashMap<String, f64>,
}

impl SideTables {
    /// Whether the batch carried any stock data at all. Drives the
    /// graceful-degradation rule for products with unknown stock.
    pub fn has_stock_data(&self) -> bool {
        !self.stock.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Language id preferred when resolving multi-language fields.
    pub preferred_lang: String,
    /// Storefront base URL used to build product and image links.
    pub shop_front_url: String,
    pub tax_table: TaxTable,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            preferred_lang: "1".to_string(),
            shop_front_url: String::new(),
            tax_table: TaxTable::default(),
        }
    }
}

/// Normalize one raw shop record. Fails only when the record has no usable
/// id or name; batch callers skip such records.
pub fn normalize_record(
    raw: &Value,
    side: &SideTables,
    opts: &NormalizeOptions,
) -> anyhow::Result<Product> {
    let id = decode::wrapped_string(raw.get("id"))
        .parsed()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("record has no id"))?;

    let name = match decode::localized_text(raw.get("name"), &opts.preferred_lang) {
        Decoded::Parsed(name) if !name.trim().is_empty() => name,
        Decoded::Unparsed => anyhow::bail!("record {id} has an unparseable name field"),
        _ => anyhow::bail!("record {id} has no name"),
    };

    let description = {
        let short = decode::localized_text(raw.get("description_short"), &opts.preferred_lang);
        let resolved = match short {
            Decoded::Parsed(text) if !text.trim().is_empty() => text,
            _ => decode::localized_text(raw.get("description"), &opts.preferred_lang)
                .parsed()
                .unwrap_or_default(),
        };
        truncate_chars(&strip_html(&resolved), DESCRIPTION_MAX_CHARS)
    };

    let price = match decode::wrapped_number(raw.get("price")) {
        Decoded::Parsed(price) => price,
        Decoded::Missing => 0.0,
        Decoded::Unparsed => {
            tracing::warn!(target: "verdia.catalog", product_id = %id, "unparsed price field, defaulting to 0");
            0.0
        }
    };

    let price_tax_incl = side.price_tax_incl.get(&id).copied().unwrap_or_else(|| {
        let group = decode::wrapped_string(raw.get("id_tax_rules_group"))
            .parsed()
            .unwrap_or_default();
        let percent = opts.tax_table.percent_for(&group).unwrap_or(0.0);
        round2(price * (1.0 + percent / 100.0))
    });

    let reference = decode::wrapped_string(raw.get("reference"))
        .parsed()
        .unwrap_or_default();

    let active = decode::flag(raw.get("active")).parsed().unwrap_or(false);

    let image_id = side
        .default_image
        .get(&id)
        .cloned()
        .or_else(|| decode::wrapped_string(raw.get("id_default_image")).parsed())
        .filter(|img| !img.trim().is_empty());
    // Served through this backend's image proxy; the widget resolves the
    // relative path against its API base.
    let image_url = image_id
        .as_ref()
        .map(|img| format!("/api/articulos/image/{id}/{img}"));

    let product_url = {
        let rewrite = decode::localized_text(raw.get("link_rewrite"), &opts.preferred_lang)
            .parsed()
            .filter(|r| !r.trim().is_empty());
        let base = opts.shop_front_url.trim_end_matches('/');
        if base.is_empty() {
            None
        } else {
            Some(match rewrite {
                Some(rewrite) => format!("{base}/{id}-{rewrite}.html"),
                None => format!("{base}/index.php?controller=product&id_product={id}"),
            })
        }
    };

    Ok(Product {
        stock: side.stock.get(&id).copied(),
        id,
        reference,
        name,
        description,
        price,
        price_tax_incl,
        image_id,
        image_url,
        product_url,
        active,
    })
}

/// Normalize a whole fetch. Malformed records are skipped with a warning,
/// never batch-fatal.
pub fn normalize_batch(
    raws: &[Value],
    side: &SideTables,
    opts: &NormalizeOptions,
) -> Vec<Product> {
    let mut products = Vec::with_capacity(raws.len());
    for raw in raws {
        match normalize_record(raw, side, opts) {
            Ok(product) => products.push(product),
            Err(error) => {
                tracing::warn!(target: "verdia.catalog", %error, "skipping malformed catalog record");
            }
        }
    }
    products
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    // Collapse the whitespace runs left behind by removed block tags.
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let truncated: String = input.chars().take(max_chars).collect();
    format!("{}…", truncated.trim_end())
}
