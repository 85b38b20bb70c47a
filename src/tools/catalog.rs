use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;

use crate::cli::CatalogBackend;
use crate::config::RuntimeConfig;
use crate::error::ToolError;

use super::{number_from_f64, value_as_i64, value_as_number, value_as_text};

pub const REQUIRED_PRODUCT_FIELDS: [&str; 6] = [
    "product_id",
    "product",
    "storage",
    "color",
    "price",
    "quantity",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub product_id: String,
    pub product: String,
    pub storage: String,
    pub color: String,
    pub price: Number,
    pub quantity: i64,
}

impl Product {
    /// Builds a product from a loosely typed document; every field in
    /// `REQUIRED_PRODUCT_FIELDS` must be present.
    pub fn from_value(raw: &Value) -> Result<Self, ToolError> {
        let Some(fields) = raw.as_object() else {
            return Err(ToolError::invalid_input("product must be a JSON object"));
        };

        let missing = REQUIRED_PRODUCT_FIELDS
            .iter()
            .filter(|name| fields.get(**name).is_none_or(Value::is_null))
            .map(|name| name.to_string())
            .collect::<Vec<String>>();
        if !missing.is_empty() {
            return Err(ToolError::missing_fields(missing));
        }

        let text = |key: &str| {
            value_as_text(fields.get(key))
                .ok_or_else(|| ToolError::invalid_input(format!("{key} must be a string")))
        };

        Ok(Product {
            id: None,
            product_id: text("product_id")?,
            product: text("product")?,
            storage: text("storage")?,
            color: text("color")?,
            price: value_as_number(fields.get("price"))
                .ok_or_else(|| ToolError::invalid_input("price must be a number"))?,
            quantity: value_as_i64(fields.get("quantity"))
                .ok_or_else(|| ToolError::invalid_input("quantity must be an integer"))?,
        })
    }
}

/// Case-insensitive substring filter over name, storage and color.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductQuery {
    pub product: String,
    pub storage: Option<String>,
    pub color: Option<String>,
}

impl ProductQuery {
    pub fn new(product: &str, storage: Option<&str>, color: Option<&str>) -> Self {
        let clean = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Self {
            product: product.trim().to_string(),
            storage: clean(storage),
            color: clean(color),
        }
    }

    pub fn from_arguments(arguments: &Value) -> Result<Self, ToolError> {
        let product = value_as_text(arguments.get("product")).unwrap_or_default();
        if product.is_empty() {
            return Err(ToolError::invalid_input("product name is required"));
        }
        let storage = value_as_text(arguments.get("storage"));
        let color = value_as_text(arguments.get("color"));
        Ok(Self::new(&product, storage.as_deref(), color.as_deref()))
    }

    pub fn matches(&self, product: &Product) -> bool {
        contains_ignore_case(&product.product, &self.product)
            && self
                .storage
                .as_deref()
                .is_none_or(|storage| contains_ignore_case(&product.storage, storage))
            && self
                .color
                .as_deref()
                .is_none_or(|color| contains_ignore_case(&product.color, color))
    }

    pub fn describe(&self) -> String {
        format!(
            "product='{}', storage='{}', color='{}'",
            self.product,
            self.storage.as_deref().unwrap_or("any"),
            self.color.as_deref().unwrap_or("any")
        )
    }
}

pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    fn backend_name(&self) -> &'static str;
    async fn insert_product(&self, product: Product) -> Result<String>;
    async fn find_products(&self, query: &ProductQuery) -> Result<Vec<Product>>;
    async fn count_products(&self) -> Result<usize>;
}

#[derive(Default)]
pub struct MemoryProductStore {
    products: RwLock<Vec<Product>>,
}

impl MemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(products: Vec<Product>) -> Self {
        let products = products
            .into_iter()
            .enumerate()
            .map(|(index, mut product)| {
                product.id = Some(format!("mem-{}", index + 1));
                product
            })
            .collect();
        Self {
            products: RwLock::new(products),
        }
    }

    /// Loads a JSON array of product documents; invalid entries are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "catalog file not found; starting with an empty catalog");
            return Ok(Self::new());
        }

        let documents = read_product_documents(path)?;
        let mut products = Vec::with_capacity(documents.len());
        for document in documents {
            match Product::from_value(&document) {
                Ok(product) => products.push(product),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping invalid catalog entry");
                }
            }
        }

        tracing::info!(path = %path.display(), products = products.len(), "catalog loaded");
        Ok(Self::with_products(products))
    }
}

#[async_trait]
impl ProductStore for MemoryProductStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn insert_product(&self, mut product: Product) -> Result<String> {
        let mut products = self.products.write().await;
        let id = format!("mem-{}", products.len() + 1);
        product.id = Some(id.clone());
        products.push(product);
        Ok(id)
    }

    async fn find_products(&self, query: &ProductQuery) -> Result<Vec<Product>> {
        let products = self.products.read().await;
        Ok(products
            .iter()
            .filter(|product| query.matches(product))
            .cloned()
            .collect())
    }

    async fn count_products(&self) -> Result<usize> {
        Ok(self.products.read().await.len())
    }
}

pub struct SqliteProductStore {
    pool: SqlitePool,
}

impl SqliteProductStore {
    pub async fn open(db_url: &str) -> Result<Self> {
        ensure_parent_dir_for_sqlite_url(db_url)?;
        let options = SqliteConnectOptions::from_str(db_url)
            .context("invalid sqlite catalog url")?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("failed to open sqlite catalog database")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                product_id TEXT NOT NULL,
                product TEXT NOT NULL,
                storage TEXT NOT NULL,
                color TEXT NOT NULL,
                price REAL NOT NULL,
                quantity INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .context("failed to run sqlite catalog migrations")?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl ProductStore for SqliteProductStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn insert_product(&self, product: Product) -> Result<String> {
        let result = sqlx::query(
            "INSERT INTO products (product_id, product, storage, color, price, quantity)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&product.product_id)
        .bind(&product.product)
        .bind(&product.storage)
        .bind(&product.color)
        .bind(product.price.as_f64().unwrap_or_default())
        .bind(product.quantity)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert product '{}'", product.product))?;

        Ok(result.last_insert_rowid().to_string())
    }

    // SQLite's LOWER() only folds ASCII, so matching happens here instead of in SQL.
    async fn find_products(&self, query: &ProductQuery) -> Result<Vec<Product>> {
        let rows = sqlx::query(
            "SELECT id, product_id, product, storage, color, price, quantity
             FROM products ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to query sqlite catalog")?;

        let mut products = Vec::new();
        for row in rows {
            let product = Product {
                id: Some(row.try_get::<i64, _>("id")?.to_string()),
                product_id: row.try_get("product_id")?,
                product: row.try_get("product")?,
                storage: row.try_get("storage")?,
                color: row.try_get("color")?,
                price: number_from_f64(row.try_get::<f64, _>("price")?),
                quantity: row.try_get("quantity")?,
            };
            if query.matches(&product) {
                products.push(product);
            }
        }
        Ok(products)
    }

    async fn count_products(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await
            .context("failed to count sqlite catalog products")?;
        Ok(count.max(0) as usize)
    }
}

pub fn ensure_parent_dir_for_sqlite_url(db_url: &str) -> Result<()> {
    let Some(db_path) = sqlite_path_from_url(db_url) else {
        return Ok(());
    };

    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create directory for sqlite catalog: {}",
                parent.display()
            )
        })?;
    }

    Ok(())
}

pub fn sqlite_path_from_url(db_url: &str) -> Option<PathBuf> {
    if !db_url.starts_with("sqlite://") {
        return None;
    }

    let path_with_params = db_url.trim_start_matches("sqlite://");
    let path_without_params = path_with_params
        .split_once('?')
        .map(|(path, _)| path)
        .unwrap_or(path_with_params);

    if path_without_params.is_empty() || path_without_params == ":memory:" {
        return None;
    }

    Some(Path::new(path_without_params).to_path_buf())
}

fn read_product_documents(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog file '{}'", path.display()))?;
    serde_json::from_str::<Vec<Value>>(&content).with_context(|| {
        format!(
            "invalid catalog file '{}': expected a JSON array of products",
            path.display()
        )
    })
}

pub async fn build_product_store(cfg: &RuntimeConfig) -> Result<Arc<dyn ProductStore>> {
    match cfg.catalog_backend {
        CatalogBackend::Memory => Ok(Arc::new(MemoryProductStore::load(Path::new(
            &cfg.catalog_path,
        ))?)),
        CatalogBackend::Sqlite => Ok(Arc::new(SqliteProductStore::open(&cfg.catalog_db_url).await?)),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub inserted: usize,
    pub skipped: Vec<String>,
}

pub async fn seed_catalog(store: &dyn ProductStore, path: &Path) -> Result<SeedReport> {
    let documents = read_product_documents(path)?;
    let mut report = SeedReport::default();

    for document in documents {
        let label = value_as_text(document.get("product")).unwrap_or_else(|| "<unnamed>".to_string());
        match Product::from_value(&document) {
            Ok(product) => {
                let id = store.insert_product(product).await?;
                tracing::info!(product = %label, id = %id, "inserted product");
                report.inserted += 1;
            }
            Err(err) => {
                tracing::warn!(product = %label, error = %err, "skipping product");
                report.skipped.push(format!("{label}: {}", err.message));
            }
        }
    }

    Ok(report)
}

pub async fn run_catalog_seed(cfg: &RuntimeConfig, path: &str) -> Result<()> {
    if cfg.catalog_backend == CatalogBackend::Memory {
        println!(
            "Catalog backend is memory; products are read from '{}' at startup. \
             Use --catalog-backend sqlite to persist a seeded catalog.",
            cfg.catalog_path
        );
    }

    let store = build_product_store(cfg).await?;
    let report = seed_catalog(store.as_ref(), Path::new(path)).await?;
    println!(
        "Seeded {} product(s) into {} catalog ({} skipped).",
        report.inserted,
        store.backend_name(),
        report.skipped.len()
    );
    for skipped in report.skipped {
        println!("- skipped {skipped}");
    }
    Ok(())
}

pub async fn run_catalog_search(
    cfg: &RuntimeConfig,
    product: &str,
    storage: Option<&str>,
    color: Option<&str>,
) -> Result<()> {
    let store = build_product_store(cfg).await?;
    let query = ProductQuery::new(product, storage, color);
    let products = store.find_products(&query).await?;
    if products.is_empty() {
        println!("No product found matching {}.", query.describe());
        return Ok(());
    }

    println!("{}", serde_json::to_string_pretty(&products)?);
    Ok(())
}
