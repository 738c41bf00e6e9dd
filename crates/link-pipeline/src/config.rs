use std::path::{Path, PathBuf};

use link_common::matcher::PolicyTable;
use link_common::similarity::ScoreWeights;
use serde::Deserialize;

use crate::anchors::AnchorProfile;
use crate::error::AppError;

/// Which embedding backend `generate-embeddings` uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The HTTP embedding service, optionally supervised.
    Http,
    /// fastembed in-process.
    Local,
}

/// Deployment configuration loaded from environment variables.
///
/// CMS and embedding-service connection settings are read by `PayloadConfig::from_env`
/// and `EmbeddingClientConfig::from_env` in `link-common`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the JSON artifacts (`LINKS_DATA_DIR`).
    pub data_dir: PathBuf,
    pub backend: BackendKind,
    /// Command that starts the embedding service (`EMBEDDING_SERVICE_CMD`). Without it a
    /// dead service is not restarted.
    pub service_command: Option<String>,
    pub embed_batch_size: usize,
    /// Also link affiliate products (`LINKS_INCLUDE_PRODUCTS`).
    pub include_products: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional:
    /// - `LINKS_DATA_DIR`: artifact directory (default `data/internal-links`)
    /// - `EMBEDDING_BACKEND`: `http` (default) or `local`
    /// - `EMBEDDING_SERVICE_CMD`: command line that starts the embedding service
    /// - `EMBEDDING_BATCH_SIZE`: texts per embedding request (default 32)
    /// - `LINKS_INCLUDE_PRODUCTS`: `1`/`true` to link affiliate products
    pub fn from_env() -> Result<Self, AppError> {
        let data_dir = std::env::var("LINKS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/internal-links"));

        let backend = match std::env::var("EMBEDDING_BACKEND").as_deref() {
            Err(_) | Ok("") | Ok("http") => BackendKind::Http,
            Ok("local") => BackendKind::Local,
            Ok(other) => {
                return Err(AppError::Config(format!(
                    "EMBEDDING_BACKEND must be `http` or `local`, got `{other}`"
                )))
            }
        };

        let service_command = std::env::var("EMBEDDING_SERVICE_CMD")
            .ok()
            .filter(|c| !c.trim().is_empty());

        let embed_batch_size = match std::env::var("EMBEDDING_BATCH_SIZE") {
            Ok(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| {
                    AppError::Config(format!("EMBEDDING_BATCH_SIZE must be a positive integer, got `{raw}`"))
                })?,
            Err(_) => 32,
        };

        let include_products = std::env::var("LINKS_INCLUDE_PRODUCTS")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            data_dir,
            backend,
            service_command,
            embed_batch_size,
            include_products,
        })
    }
}

/// How `apply-links` treats articles that were linked before.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum RelinkPolicy {
    /// Skip articles whose text is unchanged since they were last processed.
    #[default]
    Skip,
    /// Process again, only adding links to targets not yet linked.
    Additive,
    /// Remove existing internal links, then link from scratch.
    Replace,
}

/// Per-invocation options from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    pub limit: Option<usize>,
    pub skip_index: bool,
    pub relink: RelinkPolicy,
    pub include_products: bool,
    pub embed_batch_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            limit: None,
            skip_index: false,
            relink: RelinkPolicy::Skip,
            include_products: false,
            embed_batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimilaritySettings {
    pub weights: ScoreWeights,
    /// Minimum combined score for a related article.
    pub threshold: f64,
    pub max_similar: usize,
    pub product_threshold: f64,
    /// A product whose keywords alone score this much is kept regardless of threshold.
    pub product_keyword_threshold: f64,
    pub max_products: usize,
}

impl Default for SimilaritySettings {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            threshold: 0.1,
            max_similar: 20,
            product_threshold: 0.3,
            product_keyword_threshold: 0.4,
            max_products: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LinkingSettings {
    pub max_links: usize,
    /// Most similar articles considered as targets.
    pub max_targets: usize,
    /// Anchor phrases taken from each target's index entry.
    pub max_phrases_per_target: usize,
    pub max_product_links: usize,
    pub link_in_headings: bool,
}

impl Default for LinkingSettings {
    fn default() -> Self {
        Self {
            max_links: 5,
            max_targets: 10,
            max_phrases_per_target: 20,
            max_product_links: 3,
            link_in_headings: false,
        }
    }
}

/// Tuning profile: boundary policy, anchor vocabulary and scoring limits. Every section
/// is optional; the defaults target Japanese golf content.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub boundary: PolicyTable,
    pub anchors: AnchorProfile,
    pub similarity: SimilaritySettings,
    pub linking: LinkingSettings,
}

impl Profile {
    /// Load a TOML profile, or the built-in defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("failed to read profile {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| AppError::Config(format!("invalid profile {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
