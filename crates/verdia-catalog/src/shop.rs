//! PrestaShop-style webservice client. All methods return `anyhow::Error`
//! on transport failure; callers downgrade per the catalog error policy.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::decode;
use crate::normalize::SideTables;

const SHOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ShopClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl ShopClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: Client::builder()
                .timeout(SHOP_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    async fn get_json(&self, path: &str, extra: &[(&str, &str)]) -> anyhow::Result<Value> {
        let mut request = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(&[("ws_key", self.api_key.as_str()), ("output_format", "JSON")]);
        for (key, value) in extra {
            request = request.query(&[(*key, *value)]);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("shop API {path} failed with status {status}");
        }
        Ok(response.json().await?)
    }

    /// Full product listing, raw records as the shop emits them.
    pub async fn list_products(&self) -> anyhow::Result<Vec<Value>> {
        let value = self.get_json("/api/products", &[("display", "full")]).await?;
        Ok(value
            .get("products")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Stock side table: product id to available quantity.
    pub async fn list_stock(&self) -> anyhow::Result<HashMap<String, i64>> {
        let value = self
            .get_json(
                "/api/stock_availables",
                &[("display", "[id_product,quantity]")],
            )
            .await?;
        let rows = value
            .get("stock_availables")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let mut stock = HashMap::with_capacity(rows.len());
        for row in &rows {
            let Some(id) = decode::wrapped_string(row.get("id_product")).parsed() else {
                continue;
            };
            let quantity = decode::wrapped_number(row.get("quantity"))
                .parsed()
                .unwrap_or(0.0) as i64;
            // Combinations share a product id; keep the highest quantity.
            let entry = stock.entry(id).or_insert(quantity);
            *entry = (*entry).max(quantity);
        }
        Ok(stock)
    }

    /// Image side table: product id to default image id.
    pub async fn list_default_images(&self) -> anyhow::Result<HashMap<String, String>> {
        let value = self
            .get_json("/api/products", &[("display", "[id,id_default_image]")])
            .await?;
        let rows = value
            .get("products")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let mut images = HashMap::with_capacity(rows.len());
        for row in &rows {
            let (Some(id), Some(image)) = (
                decode::wrapped_string(row.get("id")).parsed(),
                decode::wrapped_string(row.get("id_default_image")).parsed(),
            ) else {
                continue;
            };
            if !image.trim().is_empty() {
                images.insert(id, image);
            }
        }
        Ok(images)
    }

    /// Tax-inclusive price side table, computed server-side by the shop.
    pub async fn list_prices_tax_incl(&self) -> anyhow::Result<HashMap<String, f64>> {
        let value = self
            .get_json(
                "/api/products",
                &[
                    ("display", "[id,price]"),
                    ("price[final][use_tax]", "1"),
                ],
            )
            .await?;
        let rows = value
            .get("products")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let mut prices = HashMap::with_capacity(rows.len());
        for row in &rows {
            let Some(id) = decode::wrapped_string(row.get("id")).parsed() else {
                continue;
            };
            let final_price = row
                .get("price")
                .and_then(|p| p.get("final"))
                .or_else(|| row.get("price"));
            if let Some(price) = decode::wrapped_number(final_price).parsed() {
                prices.insert(id, price);
            }
        }
        Ok(prices)
    }

    /// Fetch the three side tables. Each table failing independently leaves
    /// that table empty rather than failing the refresh; the normalizer
    /// tolerates missing side data.
    pub async fn fetch_side_tables(&self) -> SideTables {
        let (stock, images, prices) = tokio::join!(
            self.list_stock(),
            self.list_default_images(),
            self.list_prices_tax_incl(),
        );
        SideTables {
            stock: stock.unwrap_or_else(|error| {
                tracing::warn!(target: "verdia.catalog", %error, "stock side table unavailable");
                HashMap::new()
            }),
            default_image: images.unwrap_or_else(|error| {
                tracing::warn!(target: "verdia.catalog", %error, "image side table unavailable");
                HashMap::new()
            }),
            price_tax_incl: prices.unwrap_or_else(|error| {
                tracing::warn!(target: "verdia.catalog", %error, "price side table unavailable");
                HashMap::new()
            }),
        }
    }

    /// Fetch one product image. The image store serves most images without
    /// credentials; on rejection, retry once with webservice auth.
    pub async fn fetch_image(&self, product_id: &str, image_id: &str) -> anyhow::Result<Vec<u8>> {
        let url = format!(
            "{}/api/images/products/{}/{}",
            self.base_url, product_id, image_id
        );
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            return Ok(response.bytes().await?.to_vec());
        }

        let first_status = response.status();
        let retry = self
            .client
            .get(&url)
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await?;
        if retry.status().is_success() {
            return Ok(retry.bytes().await?.to_vec());
        }
        anyhow::bail!(
            "image {product_id}/{image_id} rejected (first {first_status}, retry {})",
            retry.status()
        )
    }
}
