use std::collections::BTreeMap;

use link_common::cms::Language;
use serde::{Deserialize, Serialize};

pub const ARTIFACT_VERSION: &str = "1.0.0";

/// `posts-index.json`: everything later stages need to know about articles and products.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostsIndex {
    pub version: String,
    pub posts: Vec<PostEntry>,
    #[serde(default)]
    pub products: Vec<ProductEntry>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostEntry {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub excerpt: String,
    pub content_summary: String,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub language: Language,
    pub keywords: Vec<String>,
    pub anchor_phrases: Vec<String>,
    /// SHA-256 of the flattened body text.
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductEntry {
    pub id: String,
    pub name: String,
    pub url: String,
    pub language: Language,
    pub primary_keyword: Option<String>,
    pub keywords: Vec<String>,
    pub anchor_phrases: Vec<String>,
    pub description: String,
}

/// `embeddings.json`, keyed by article id or `product:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsArtifact {
    pub model: String,
    pub dimension: usize,
    pub embeddings: BTreeMap<String, EmbeddingEntry>,
    pub timestamp: i64,
}

impl EmbeddingsArtifact {
    pub fn new(model: &str, dimension: usize) -> Self {
        Self {
            model: model.to_string(),
            dimension,
            embeddings: BTreeMap::new(),
            timestamp: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingEntry {
    pub slug: String,
    pub vector: Vec<f32>,
    /// SHA-256 of the embedded text.
    pub text_hash: String,
}

pub fn product_key(id: &str) -> String {
    format!("product:{id}")
}

/// `similarity-matrix.json`, keyed by article id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatrix {
    pub version: String,
    pub threshold: f64,
    pub similarities: BTreeMap<String, SimilarityEntry>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEntry {
    pub slug: String,
    pub similar: Vec<SimilarPost>,
    #[serde(default)]
    pub products: Vec<SimilarProduct>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarPost {
    pub id: String,
    pub slug: String,
    pub score: f64,
    pub category_overlap: f64,
    pub tag_overlap: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarProduct {
    pub id: String,
    pub name: String,
    pub score: f64,
    pub matched_keywords: Vec<String>,
}
