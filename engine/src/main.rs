use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use verdia_catalog::{
    CatalogCache, LexicalSearch, NormalizeOptions, ProductSearch, ShopCatalogSource, ShopClient,
    TaxTable, VectorSearch, DEFAULT_TTL,
};
use verdia_observability::{init_logging, logs_dir_from_state_dir};
use verdia_orchestrator::Orchestrator;
use verdia_providers::{EmbeddingClient, OpenAiChatProvider, PineconeIndex};
use verdia_server::{serve, AppState};
use verdia_store::{ConversationStore, HistoryPersistence, MongoDataApi, NoopPersistence};
use verdia_types::{Product, WidgetConfig};

const DEFAULT_SYSTEM_PROMPT: &str = "Eres un asistente virtual amable y profesional de una tienda de jardinería. Responde de forma clara y concisa en español. Cuando el cliente pregunte por productos, usa la herramienta de búsqueda y recomienda solo artículos encontrados.";

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "verdia-engine")]
#[command(about = "Verdia retail chatbot backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "0.0.0.0")]
        hostname: String,
        #[arg(long, env = "PORT", default_value_t = 3000)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Refresh the catalog once and optionally run a lexical search
    /// against it. Useful for checking shop credentials.
    Catalog {
        #[arg(long)]
        query: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = logs_dir_from_state_dir(&state_dir);
            let (_log_guard, log_info) = init_logging(&logs_dir, LOG_RETENTION_DAYS)?;
            info!(target: "verdia.engine", ?log_info, "logging initialized");

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let config = EngineConfig::from_env();
            log_configuration(&config);
            let state = build_state(&config)?;

            if let Some(cache) = state.catalog.clone() {
                // Warm the snapshot so the first chat does not pay the
                // full shop round trip.
                tokio::spawn(async move {
                    let (products, _) = cache.ensure_fresh().await;
                    info!(
                        target: "verdia.engine",
                        products = products.len(),
                        "catalog warmed"
                    );
                });
            }

            info!(target: "verdia.engine", %addr, "starting verdia-engine");
            serve(addr, state).await?;
        }
        Command::Catalog { query } => {
            let config = EngineConfig::from_env();
            let (shop_url, shop_key) = config
                .shop_api_url
                .clone()
                .zip(config.shop_api_key.clone())
                .context("SHOP_API_URL and SHOP_API_KEY are required")?;
            let client = ShopClient::new(shop_url, shop_key);
            let source = ShopCatalogSource::new(client, normalize_options(&config)?);
            let cache = Arc::new(CatalogCache::new(Arc::new(source), catalog_ttl(&config)?));
            let (products, batch_has_stock) = cache.ensure_fresh().await;
            println!(
                "catalog: {} products (stock data: {})",
                products.len(),
                if batch_has_stock { "yes" } else { "no" }
            );
            if let Some(query) = query {
                let search = LexicalSearch::new(cache);
                for product in search.search(&query, false).await {
                    println!(
                        "  {} (ref {}) {:.2} €",
                        product.name, product.reference, product.price_tax_incl
                    );
                }
            }
        }
    }

    Ok(())
}

/// Everything resolved from the environment, once, at startup. Absent
/// integrations leave the service in a degraded but working mode.
#[derive(Debug, Clone, Default)]
struct EngineConfig {
    openai_api_key: Option<String>,
    openai_model: Option<String>,
    pinecone_api_key: Option<String>,
    pinecone_index_host: Option<String>,
    shop_api_url: Option<String>,
    shop_api_key: Option<String>,
    shop_front_url: Option<String>,
    mongo_data_api_url: Option<String>,
    mongo_data_api_key: Option<String>,
    allowed_origins: Option<String>,
    bot_name: Option<String>,
    bot_welcome_message: Option<String>,
    primary_color: Option<String>,
    widget_position: Option<String>,
    system_prompt: Option<String>,
    catalog_ttl_secs: Option<String>,
    tax_rates_json: Option<String>,
}

impl EngineConfig {
    fn from_env() -> Self {
        Self {
            openai_api_key: resolve_env("OPENAI_API_KEY"),
            openai_model: resolve_env("OPENAI_MODEL"),
            pinecone_api_key: resolve_env("PINECONE_API_KEY"),
            pinecone_index_host: resolve_env("PINECONE_INDEX_HOST"),
            shop_api_url: resolve_env("SHOP_API_URL"),
            shop_api_key: resolve_env("SHOP_API_KEY"),
            shop_front_url: resolve_env("SHOP_FRONT_URL"),
            mongo_data_api_url: resolve_env("MONGO_DATA_API_URL"),
            mongo_data_api_key: resolve_env("MONGO_DATA_API_KEY"),
            allowed_origins: resolve_env("ALLOWED_ORIGINS"),
            bot_name: resolve_env("BOT_NAME"),
            bot_welcome_message: resolve_env("BOT_WELCOME_MESSAGE"),
            primary_color: resolve_env("PRIMARY_COLOR"),
            widget_position: resolve_env("WIDGET_POSITION"),
            system_prompt: resolve_env("SYSTEM_PROMPT"),
            catalog_ttl_secs: resolve_env("CATALOG_TTL_SECS"),
            tax_rates_json: resolve_env("TAX_RATES_JSON"),
        }
    }
}

fn resolve_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Some(dir) = resolve_env("VERDIA_STATE_DIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from(".verdia")
}

fn build_state(config: &EngineConfig) -> anyhow::Result<AppState> {
    let persistence: Arc<dyn HistoryPersistence> = match config
        .mongo_data_api_url
        .clone()
        .zip(config.mongo_data_api_key.clone())
    {
        Some((url, key)) => Arc::new(MongoDataApi::new(url, key)),
        None => Arc::new(NoopPersistence),
    };
    let store = Arc::new(ConversationStore::new(persistence));

    let mut state = AppState::new(widget_config(config), store)
        .with_allowed_origins(parse_allowed_origins(config.allowed_origins.as_deref()));

    let shop = config
        .shop_api_url
        .clone()
        .zip(config.shop_api_key.clone())
        .map(|(url, key)| Arc::new(ShopClient::new(url, key)));

    let catalog = match &shop {
        Some(shop) => {
            let source = ShopCatalogSource::new((**shop).clone(), normalize_options(config)?);
            Some(Arc::new(CatalogCache::new(
                Arc::new(source),
                catalog_ttl(config)?,
            )))
        }
        None => None,
    };

    if let Some(shop) = shop {
        state = state.with_shop(shop);
    }
    if let Some(catalog) = catalog.clone() {
        state = state.with_catalog(catalog);
    }

    let Some(openai_key) = config.openai_api_key.clone() else {
        tracing::warn!(
            target: "verdia.engine",
            "OPENAI_API_KEY missing; serving widget and history only"
        );
        return Ok(state);
    };

    let search = product_search(config, &openai_key, catalog);
    let provider = OpenAiChatProvider::new(openai_key, config.openai_model.clone());
    let orchestrator = Orchestrator::new(
        Arc::new(provider),
        search,
        config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
    );
    Ok(state.with_orchestrator(Arc::new(orchestrator)))
}

/// One search strategy per deployment: vector search when Pinecone is
/// configured, lexical over the catalog cache otherwise, empty results
/// when neither backend exists.
fn product_search(
    config: &EngineConfig,
    openai_key: &str,
    catalog: Option<Arc<CatalogCache>>,
) -> Arc<dyn ProductSearch> {
    if let Some((host, key)) = config
        .pinecone_index_host
        .clone()
        .zip(config.pinecone_api_key.clone())
    {
        let index = PineconeIndex::new(host, key);
        return Arc::new(VectorSearch::new(
            EmbeddingClient::new(openai_key),
            Arc::new(index),
        ));
    }
    if let Some(cache) = catalog {
        return Arc::new(LexicalSearch::new(cache));
    }
    tracing::warn!(
        target: "verdia.engine",
        "no search backend configured; product search returns nothing"
    );
    Arc::new(NoSearch)
}

struct NoSearch;

#[async_trait::async_trait]
impl ProductSearch for NoSearch {
    async fn search(&self, _term: &str, _web_only: bool) -> Vec<Product> {
        Vec::new()
    }
}

fn widget_config(config: &EngineConfig) -> WidgetConfig {
    let mut widget = WidgetConfig::default();
    if let Some(name) = &config.bot_name {
        widget.bot_name = name.clone();
    }
    if let Some(message) = &config.bot_welcome_message {
        widget.welcome_message = message.clone();
    }
    if let Some(color) = &config.primary_color {
        widget.primary_color = color.clone();
    }
    if let Some(position) = &config.widget_position {
        widget.position = normalize_position(position);
    }
    widget
}

fn normalize_position(raw: &str) -> String {
    match raw.trim().to_lowercase().as_str() {
        "left" => "left".to_string(),
        _ => "right".to_string(),
    }
}

fn parse_allowed_origins(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize_options(config: &EngineConfig) -> anyhow::Result<NormalizeOptions> {
    let tax_table = match &config.tax_rates_json {
        Some(raw) => TaxTable::from_json(raw).context("invalid TAX_RATES_JSON")?,
        None => TaxTable::default(),
    };
    Ok(NormalizeOptions {
        shop_front_url: storefront_url(config),
        tax_table,
        ..NormalizeOptions::default()
    })
}

/// The storefront base for product links. Defaults to the shop API URL
/// with its `/api` suffix removed, the usual webservice layout.
fn storefront_url(config: &EngineConfig) -> String {
    if let Some(front) = &config.shop_front_url {
        return front.trim_end_matches('/').to_string();
    }
    let api = config.shop_api_url.as_deref().unwrap_or_default();
    api.trim_end_matches('/')
        .trim_end_matches("/api")
        .trim_end_matches('/')
        .to_string()
}

fn catalog_ttl(config: &EngineConfig) -> anyhow::Result<Duration> {
    match &config.catalog_ttl_secs {
        Some(raw) => {
            let secs: u64 = raw.parse().context("invalid CATALOG_TTL_SECS")?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(DEFAULT_TTL),
    }
}

fn log_configuration(config: &EngineConfig) {
    info!(
        target: "verdia.engine",
        chat = config.openai_api_key.is_some(),
        vector_search = config.pinecone_index_host.is_some(),
        shop = config.shop_api_url.is_some(),
        persistence = config.mongo_data_api_url.is_some(),
        "integration configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_origins_splits_and_trims() {
        let origins =
            parse_allowed_origins(Some(" https://a.example , https://b.example ,, "));
        assert_eq!(origins, vec!["https://a.example", "https://b.example"]);
        assert!(parse_allowed_origins(None).is_empty());
    }

    #[test]
    fn storefront_url_strips_api_suffix() {
        let config = EngineConfig {
            shop_api_url: Some("https://tienda.example.com/api/".to_string()),
            ..EngineConfig::default()
        };
        assert_eq!(storefront_url(&config), "https://tienda.example.com");
    }

    #[test]
    fn explicit_front_url_wins() {
        let config = EngineConfig {
            shop_api_url: Some("https://tienda.example.com/api".to_string()),
            shop_front_url: Some("https://www.example.com/".to_string()),
            ..EngineConfig::default()
        };
        assert_eq!(storefront_url(&config), "https://www.example.com");
    }

    #[test]
    fn ttl_parses_and_defaults() {
        let config = EngineConfig {
            catalog_ttl_secs: Some("120".to_string()),
            ..EngineConfig::default()
        };
        assert_eq!(catalog_ttl(&config).expect("ttl"), Duration::from_secs(120));
        assert_eq!(
            catalog_ttl(&EngineConfig::default()).expect("ttl"),
            DEFAULT_TTL
        );
        assert!(catalog_ttl(&EngineConfig {
            catalog_ttl_secs: Some("soon".to_string()),
            ..EngineConfig::default()
        })
        .is_err());
    }

    #[test]
    fn widget_position_normalizes() {
        assert_eq!(normalize_position(" LEFT "), "left");
        assert_eq!(normalize_position("center"), "right");
    }

    #[test]
    fn bad_tax_rates_json_is_rejected() {
        let config = EngineConfig {
            tax_rates_json: Some("not json".to_string()),
            ..EngineConfig::default()
        };
        assert!(normalize_options(&config).is_err());
    }
}
