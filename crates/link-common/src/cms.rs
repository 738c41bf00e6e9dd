/// CMS access: the article/product model, the repository trait the pipeline depends on, a
/// Payload REST implementation and an in-memory implementation for tests and dry runs.
///
/// Collections are read with `depth=0`, so relationships (categories, tags, link targets)
/// arrive as ids. Category and tag labels therefore fall back to ids, which is enough for
/// overlap scoring.
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::document::{editor_state, id_string, DocumentNode, EditorState};
use crate::error::CommonError;
use crate::extract::plain_text;

pub const ARTICLES: &str = "posts";
pub const PRODUCTS: &str = "affiliate-products";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Ja,
    En,
    /// Products only: usable from articles in either language.
    Both,
}

impl Language {
    pub fn accepts(self, other: Language) -> bool {
        self == other || self == Language::Both || other == Language::Both
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    #[default]
    Draft,
    Published,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    #[default]
    Active,
    Inactive,
    Discontinued,
}

/// Processing marker written by the internal-link stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkMetadata {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "lastProcessed", default)]
    pub last_processed: Option<String>,
    #[serde(rename = "linksAdded", default)]
    pub links_added: Vec<LinkRecord>,
    #[serde(rename = "contentHash", default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    #[serde(rename = "targetSlug", default)]
    pub target_slug: Option<String>,
    #[serde(rename = "anchorText", default)]
    pub anchor_text: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
}

/// Processing marker written when affiliate product links are added.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AffiliateMetadata {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "lastProcessed", default)]
    pub last_processed: Option<String>,
    #[serde(rename = "linksAdded", default)]
    pub links_added: Vec<AffiliateRecord>,
    #[serde(rename = "contentHash", default)]
    pub content_hash: Option<String>,
    #[serde(rename = "excludeFromAffiliates", default)]
    pub exclude_from_affiliates: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AffiliateRecord {
    #[serde(rename = "productId", default)]
    pub product_id: Option<String>,
    #[serde(rename = "productName", default)]
    pub product_name: Option<String>,
    #[serde(rename = "anchorText", default)]
    pub anchor_text: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ArticleMeta {
    #[serde(default)]
    pub description: Option<String>,
    /// Comma-separated SEO keywords.
    #[serde(default)]
    pub keywords: Option<String>,
    #[serde(rename = "focusKeyphrase", default)]
    pub focus_keyphrase: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Article {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub title: String,
    #[serde(default, deserialize_with = "de_string_or_null")]
    pub slug: String,
    #[serde(default, deserialize_with = "de_language")]
    pub language: Language,
    #[serde(rename = "content", with = "editor_state")]
    pub body: DocumentNode,
    #[serde(rename = "_status", default)]
    pub status: ArticleStatus,
    #[serde(default, deserialize_with = "de_labels")]
    pub categories: Vec<String>,
    #[serde(default, deserialize_with = "de_labels")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub excerpt: Option<Value>,
    #[serde(default, deserialize_with = "de_meta")]
    pub meta: ArticleMeta,
    #[serde(rename = "internalLinksMetadata", default)]
    pub link_metadata: Option<LinkMetadata>,
    #[serde(rename = "affiliateLinksMetadata", default)]
    pub affiliate_metadata: Option<AffiliateMetadata>,
}

impl Article {
    /// Excerpt as plain text. The CMS stores it as rich text; plain strings are accepted too.
    pub fn excerpt_text(&self) -> String {
        match &self.excerpt {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(value @ Value::Object(_)) => serde_json::from_value::<EditorState>(value.clone())
                .map(|state| plain_text(&state.root))
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    pub fn excluded_from_affiliates(&self) -> bool {
        self.affiliate_metadata
            .as_ref()
            .is_some_and(|m| m.exclude_from_affiliates)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Product {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(rename = "product_name")]
    pub name: String,
    #[serde(default)]
    pub keyword_research: Option<String>,
    #[serde(default, deserialize_with = "de_keywords")]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub affiliate_url: Option<String>,
    #[serde(default)]
    pub clean_url: Option<String>,
    #[serde(default)]
    pub product_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "de_language")]
    pub language: Language,
    #[serde(default)]
    pub status: ProductStatus,
}

impl Product {
    /// The url to link to: the cleaned affiliate url, then the product page, then the raw
    /// affiliate field when it is a bare url rather than an HTML snippet.
    pub fn link_url(&self) -> Option<&str> {
        [&self.clean_url, &self.product_url, &self.affiliate_url]
            .into_iter()
            .filter_map(|u| u.as_deref().map(str::trim))
            .find(|u| u.starts_with("http://") || u.starts_with("https://"))
    }

    pub fn is_active(&self) -> bool {
        self.status == ProductStatus::Active
    }
}

/// Fields written back to an article.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticleUpdate {
    #[serde(rename = "content", with = "editor_state")]
    pub body: DocumentNode,
    #[serde(rename = "internalLinksMetadata", skip_serializing_if = "Option::is_none")]
    pub link_metadata: Option<LinkMetadata>,
    #[serde(rename = "affiliateLinksMetadata", skip_serializing_if = "Option::is_none")]
    pub affiliate_metadata: Option<AffiliateMetadata>,
}

/// The pipeline's only view of the CMS.
#[allow(async_fn_in_trait)]
pub trait ArticleRepository {
    /// Published articles, at most `limit` when given.
    async fn find_published(&self, limit: Option<usize>) -> Result<Vec<Article>, CommonError>;

    async fn get(&self, id: &str) -> Result<Article, CommonError>;

    /// Persist a new body (and markers) for one article.
    async fn put(&self, id: &str, update: &ArticleUpdate) -> Result<(), CommonError>;

    /// Active affiliate products, at most `limit` when given.
    async fn find_products(&self, limit: Option<usize>) -> Result<Vec<Product>, CommonError>;
}

#[derive(Clone, Debug)]
pub struct PayloadConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub page_size: usize,
    pub timeout: Duration,
}

impl PayloadConfig {
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("PAYLOAD_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        let api_key = std::env::var("PAYLOAD_API_KEY").ok().filter(|k| !k.is_empty());

        let page_size = std::env::var("PAYLOAD_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(100);

        let timeout = std::env::var("PAYLOAD_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(30));

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            page_size,
            timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    docs: Vec<Value>,
    #[serde(rename = "hasNextPage", default)]
    has_next_page: bool,
}

/// Payload CMS REST client.
#[derive(Clone)]
pub struct PayloadClient {
    config: PayloadConfig,
    http: reqwest::Client,
}

impl PayloadClient {
    pub fn new(config: PayloadConfig) -> Result<Self, CommonError> {
        let http = reqwest::Client::builder()
            .user_agent("link-pipeline/cms")
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, http })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/api/{}", self.config.base_url, path);
        let builder = self.http.request(method, url);
        match &self.config.api_key {
            Some(key) => builder.header("Authorization", format!("users API-Key {key}")),
            None => builder,
        }
    }

    /// Fetch documents page by page, skipping those that do not deserialize.
    async fn find_all<T: for<'de> Deserialize<'de>>(
        &self,
        collection: &str,
        filter: (&str, &str),
        limit: Option<usize>,
    ) -> Result<Vec<T>, CommonError> {
        let mut out = Vec::new();
        let mut page = 1usize;
        loop {
            let page_size = limit.map_or(self.config.page_size, |l| l.min(self.config.page_size));
            let resp = self
                .request(reqwest::Method::GET, collection)
                .query(&[
                    (filter.0, filter.1.to_string()),
                    ("limit", page_size.to_string()),
                    ("depth", "0".to_string()),
                    ("page", page.to_string()),
                ])
                .send()
                .await?;
            let body: Page = check_status(resp, collection).await?.json().await?;

            debug!(collection, page, docs = body.docs.len(), "fetched page");
            for doc in body.docs {
                let id = doc.get("id").and_then(id_string).unwrap_or_default();
                match serde_json::from_value::<T>(doc) {
                    Ok(item) => out.push(item),
                    Err(e) => warn!(collection, id = %id, error = %e, "skipping malformed document"),
                }
                if limit.is_some_and(|l| out.len() >= l) {
                    return Ok(out);
                }
            }
            if !body.has_next_page {
                return Ok(out);
            }
            page += 1;
        }
    }
}

impl ArticleRepository for PayloadClient {
    async fn find_published(&self, limit: Option<usize>) -> Result<Vec<Article>, CommonError> {
        let articles: Vec<Article> = self
            .find_all(ARTICLES, ("where[_status][equals]", "published"), limit)
            .await?;
        info!(count = articles.len(), "fetched published articles");
        Ok(articles)
    }

    async fn get(&self, id: &str) -> Result<Article, CommonError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("{ARTICLES}/{id}"))
            .query(&[("depth", "0")])
            .send()
            .await?;
        let value: Value = check_status(resp, id).await?.json().await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn put(&self, id: &str, update: &ArticleUpdate) -> Result<(), CommonError> {
        let resp = self
            .request(reqwest::Method::PATCH, &format!("{ARTICLES}/{id}"))
            .query(&[("depth", "0")])
            .json(update)
            .send()
            .await?;
        check_status(resp, id).await?;
        debug!(id, "article written");
        Ok(())
    }

    async fn find_products(&self, limit: Option<usize>) -> Result<Vec<Product>, CommonError> {
        let products: Vec<Product> = self
            .find_all(PRODUCTS, ("where[status][equals]", "active"), limit)
            .await?;
        info!(count = products.len(), "fetched affiliate products");
        Ok(products)
    }
}

async fn check_status(resp: reqwest::Response, id: &str) -> Result<reqwest::Response, CommonError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > 2048 {
        let mut cut = 2048;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    match status {
        StatusCode::BAD_REQUEST => Err(CommonError::ValidationRejected {
            id: id.to_string(),
            message: body,
        }),
        StatusCode::NOT_FOUND => Err(CommonError::Cms(format!("{id} not found"))),
        _ => Err(CommonError::Cms(format!("{id}: status {status}: {body}"))),
    }
}

/// In-memory repository. Records every successful write.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    articles: Mutex<BTreeMap<String, Article>>,
    products: Vec<Product>,
    rejected: HashSet<String>,
    writes: Mutex<Vec<String>>,
}

impl MemoryRepository {
    pub fn new(articles: Vec<Article>, products: Vec<Product>) -> Self {
        Self {
            articles: Mutex::new(articles.into_iter().map(|a| (a.id.clone(), a)).collect()),
            products,
            rejected: HashSet::new(),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Reject writes to `id` the way the CMS rejects invalid documents.
    pub fn reject_writes_to(mut self, id: &str) -> Self {
        self.rejected.insert(id.to_string());
        self
    }

    /// Ids of successful writes, in order.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn article(&self, id: &str) -> Option<Article> {
        self.articles.lock().ok()?.get(id).cloned()
    }

    fn lock_articles(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Article>>, CommonError> {
        self.articles
            .lock()
            .map_err(|_| CommonError::Cms("article store poisoned".to_string()))
    }
}

impl ArticleRepository for MemoryRepository {
    async fn find_published(&self, limit: Option<usize>) -> Result<Vec<Article>, CommonError> {
        let articles = self.lock_articles()?;
        Ok(articles
            .values()
            .filter(|a| a.status == ArticleStatus::Published)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Article, CommonError> {
        self.lock_articles()?
            .get(id)
            .cloned()
            .ok_or_else(|| CommonError::Cms(format!("{id} not found")))
    }

    async fn put(&self, id: &str, update: &ArticleUpdate) -> Result<(), CommonError> {
        if self.rejected.contains(id) || !update.body.is_root() {
            return Err(CommonError::ValidationRejected {
                id: id.to_string(),
                message: "content is not a valid editor state".to_string(),
            });
        }
        let mut articles = self.lock_articles()?;
        let article = articles
            .get_mut(id)
            .ok_or_else(|| CommonError::Cms(format!("{id} not found")))?;
        article.body = update.body.clone();
        if let Some(meta) = &update.link_metadata {
            article.link_metadata = Some(meta.clone());
        }
        if let Some(meta) = &update.affiliate_metadata {
            article.affiliate_metadata = Some(meta.clone());
        }
        drop(articles);

        if let Ok(mut writes) = self.writes.lock() {
            writes.push(id.to_string());
        }
        Ok(())
    }

    async fn find_products(&self, limit: Option<usize>) -> Result<Vec<Product>, CommonError> {
        Ok(self
            .products
            .iter()
            .filter(|p| p.is_active())
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    id_string(&value).ok_or_else(|| serde::de::Error::custom(format!("invalid id: {value}")))
}

fn de_string_or_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn de_language<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Language, D::Error> {
    Ok(Option::<Language>::deserialize(deserializer)?.unwrap_or_default())
}

fn de_meta<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ArticleMeta, D::Error> {
    Ok(Option::<ArticleMeta>::deserialize(deserializer)?.unwrap_or_default())
}

/// Relationship labels: the `title` or `name` of populated documents, the id otherwise.
fn de_labels<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let values = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(values
        .iter()
        .filter_map(|v| match v {
            Value::Object(map) => map
                .get("title")
                .or_else(|| map.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| id_string(v)),
            other => id_string(other),
        })
        .collect())
}

fn de_keywords<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    struct Entry {
        keyword: Option<String>,
    }
    let entries = Option::<Vec<Entry>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(entries
        .into_iter()
        .filter_map(|e| e.keyword)
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect())
}
