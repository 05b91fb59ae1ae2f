use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use verdia_providers::{EmbeddingClient, VectorIndex, DEFAULT_TOP_K};
use verdia_types::Product;

use crate::cache::CatalogCache;
use crate::normalize::round2;

/// Candidates returned to the model per search, both strategies.
pub const RESULT_CAP: usize = 8;

/// Free-text product search. Never errors: any upstream failure degrades to
/// an empty result list, which callers treat as a normal terminal outcome.
#[async_trait]
pub trait ProductSearch: Send + Sync {
    async fn search(&self, term: &str, web_only: bool) -> Vec<Product>;
}

/// Substring matching over the cached snapshot, diacritic- and
/// case-insensitive, returned in cache order.
pub struct LexicalSearch {
    cache: Arc<CatalogCache>,
}

impl LexicalSearch {
    pub fn new(cache: Arc<CatalogCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl ProductSearch for LexicalSearch {
    async fn search(&self, term: &str, _web_only: bool) -> Vec<Product> {
        let needle = fold_for_match(term);
        if needle.is_empty() {
            return Vec::new();
        }
        let (products, batch_has_stock) = self.cache.ensure_fresh().await;
        products
            .iter()
            .filter(|product| product.displayable(batch_has_stock))
            .filter(|product| {
                fold_for_match(&product.name).contains(&needle)
                    || fold_for_match(&product.reference).contains(&needle)
                    || fold_for_match(&product.description).contains(&needle)
            })
            .take(RESULT_CAP)
            .cloned()
            .collect()
    }
}

/// Embedding similarity against the vector index. Neighbor metadata is the
/// ingested catalog record; no minimum score is enforced.
pub struct VectorSearch {
    embeddings: EmbeddingClient,
    index: Arc<dyn VectorIndex>,
}

impl VectorSearch {
    pub fn new(embeddings: EmbeddingClient, index: Arc<dyn VectorIndex>) -> Self {
        Self { embeddings, index }
    }
}

#[async_trait]
impl ProductSearch for VectorSearch {
    async fn search(&self, term: &str, web_only: bool) -> Vec<Product> {
        let vector = match self.embeddings.embed(term).await {
            Ok(vector) => vector,
            Err(error) => {
                tracing::warn!(target: "verdia.catalog", %error, "query embedding failed");
                return Vec::new();
            }
        };
        let matches = match self.index.query(&vector, DEFAULT_TOP_K, web_only).await {
            Ok(matches) => matches,
            Err(error) => {
                tracing::warn!(target: "verdia.catalog", %error, "vector index query failed");
                return Vec::new();
            }
        };
        matches
            .into_iter()
            .filter_map(|hit| product_from_metadata(&hit.id, &hit.metadata))
            .filter(|product| product.displayable(true))
            .take(RESULT_CAP)
            .collect()
    }
}

/// Map an ingested vector record back to the canonical product shape. The
/// index stores the ingestion-job field names.
fn product_from_metadata(id: &str, metadata: &Value) -> Option<Product> {
    let meta = metadata.as_object()?;

    let text = |key: &str| {
        meta.get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != "N/A")
            .map(|s| s.to_string())
    };
    let number = |key: &str| meta.get(key).and_then(|v| v.as_f64());

    let reference = text("codigo_referencia").unwrap_or_else(|| id.to_string());
    let name = text("denominacion_web")
        .or_else(|| text("denominacion_grupo"))
        .or_else(|| text("denominacion_familia"))?;
    let description = text("descripcion_de_cada_articulo")
        .or_else(|| text("descripcion_bandeja"))
        .unwrap_or_default();

    let price = number("pvp").or_else(|| number("precio")).unwrap_or(0.0);
    let stock_web = number("stock_web").map(|v| v as i64);
    let stock_fisico = number("stock_fisico").map(|v| v as i64);
    let stock = match (stock_web, stock_fisico) {
        (None, None) => None,
        (web, fisico) => Some(web.unwrap_or(0).max(fisico.unwrap_or(0))),
    };

    Some(Product {
        id: id.to_string(),
        reference,
        name,
        description,
        // Ingested prices are customer-facing, tax included.
        price: round2(price),
        price_tax_incl: round2(price),
        stock,
        image_id: None,
        image_url: text("imagen_url"),
        product_url: text("url"),
        active: true,
    })
}

/// Lowercase and strip the diacritics that show up in the catalog's Spanish
/// product names, so `cipres` matches `Ciprés`.
pub fn fold_for_match(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .chars()
        .map(|ch| match ch {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            'ç' => 'c',
            _ => ch,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CatalogSource;
    use serde_json::json;
    use std::time::Duration;

    struct FixedSource(Vec<Product>, bool);

    #[async_trait]
    impl CatalogSource for FixedSource {
        async fn fetch(&self) -> anyhow::Result<(Vec<Product>, bool)> {
            Ok((self.0.clone(), self.1))
        }
    }

    fn product(id: &str, name: &str, stock: Option<i64>, active: bool) -> Product {
        Product {
            id: id.to_string(),
            reference: format!("REF-{id}"),
            name: name.to_string(),
            description: String::new(),
            price: 5.0,
            price_tax_incl: 6.05,
            stock,
            image_id: None,
            image_url: None,
            product_url: None,
            active,
        }
    }

    fn lexical(products: Vec<Product>, batch_has_stock: bool) -> LexicalSearch {
        let source = Arc::new(FixedSource(products, batch_has_stock));
        LexicalSearch::new(Arc::new(CatalogCache::new(source, Duration::from_secs(60))))
    }

    #[tokio::test]
    async fn search_is_diacritic_insensitive() {
        let search = lexical(vec![product("1", "Ciprés Común", Some(4), true)], true);
        let results = search.search("cipres", false).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "Ciprés Común");
    }

    #[tokio::test]
    async fn inactive_and_out_of_stock_products_never_surface() {
        let search = lexical(
            vec![
                product("1", "Ciprés Común", Some(0), true),
                product("2", "Ciprés Azul", Some(3), false),
                product("3", "Ciprés Limón", Some(3), true),
            ],
            true,
        );
        let results = search.search("cipres", false).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "3");
    }

    #[tokio::test]
    async fn results_are_capped_in_cache_order() {
        let products = (0..20)
            .map(|i| product(&i.to_string(), &format!("Rosal {i}"), Some(1), true))
            .collect();
        let search = lexical(products, true);
        let results = search.search("rosal", false).await;
        assert_eq!(results.len(), RESULT_CAP);
        assert_eq!(results[0].id, "0");
    }

    #[tokio::test]
    async fn reference_field_is_matched_too() {
        let search = lexical(vec![product("9", "Abeto", Some(2), true)], true);
        let results = search.search("ref-9", false).await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn blank_term_returns_nothing() {
        let search = lexical(vec![product("1", "Abeto", Some(2), true)], true);
        assert!(search.search("   ", false).await.is_empty());
    }

    #[test]
    fn metadata_maps_to_canonical_product() {
        let metadata = json!({
            "codigo_referencia": "ART-77",
            "denominacion_web": "Ciprés Común",
            "descripcion_de_cada_articulo": "Conífera de seto, maceta 3L",
            "pvp": 12.10,
            "stock_web": 6.0,
            "stock_fisico": 2.0,
        });
        let product = product_from_metadata("ART-77", &metadata).expect("mapped");
        assert_eq!(product.reference, "ART-77");
        assert_eq!(product.name, "Ciprés Común");
        assert_eq!(product.price_tax_incl, 12.10);
        assert_eq!(product.stock, Some(6));
        assert!(product.displayable(true));
    }

    #[test]
    fn metadata_without_any_name_is_dropped() {
        let metadata = json!({"codigo_referencia": "X", "pvp": 3.0});
        assert!(product_from_metadata("X", &metadata).is_none());
    }

    #[test]
    fn na_placeholders_are_ignored() {
        let metadata = json!({
            "denominacion_web": "N/A",
            "denominacion_familia": "Coníferas",
            "stock_web": 1.0,
        });
        let product = product_from_metadata("Y", &metadata).expect("mapped");
        assert_eq!(product.name, "Coníferas");
    }
}
