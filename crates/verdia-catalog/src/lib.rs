mod cache;
mod decode;
mod normalize;
mod search;
mod shop;

pub use cache::{CatalogCache, CatalogSource, ShopCatalogSource, DEFAULT_TTL};
pub use decode::{flag, localized_text, wrapped_number, wrapped_string, Decoded};
pub use normalize::{
    normalize_batch, normalize_record, NormalizeOptions, SideTables, TaxTable,
    DESCRIPTION_MAX_CHARS,
};
pub use search::{fold_for_match, LexicalSearch, ProductSearch, VectorSearch, RESULT_CAP};
pub use shop::ShopClient;
