/// The linking pipeline: build-index → generate-embeddings → compute-similarity →
/// apply-links, plus the remove-links cleanup pass and a statistics report.
///
/// Stages communicate only through the JSON artifacts in the data directory, so each one
/// can be re-run on its own. Per-article failures are logged and counted; only failures
/// that make the whole stage meaningless (missing artifacts, an unreachable embedding
/// service) abort it.
use std::collections::{HashMap, HashSet};

use chrono::{SecondsFormat, Utc};
use link_common::cms::{
    AffiliateMetadata, AffiliateRecord, Article, ArticleRepository,
    ArticleUpdate, LinkMetadata, LinkRecord, Product,
};
use link_common::document::{DocumentNode, LinkTarget};
use link_common::embedding::Embedder;
use link_common::error::CommonError;
use link_common::extract::{extract_text, plain_text, FlatText};
use link_common::inject::{
    self, count_links, inject_links, link_targets, InjectOptions, Injection, LinkFilter, LinkSpan,
};
use link_common::matcher::{BoundaryPolicy, MatchOptions, Phrase};
use link_common::similarity::{
    cosine_similarity, jaccard, rank_candidates, EmbeddingIndex, EmbeddingVector,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::anchors::{
    compose_embedding_text, compose_product_text, content_hash, truncate_chars, AnchorExtractor,
    EXCERPT_CHARS, SUMMARY_CHARS,
};
use crate::artifacts::{ArtifactStore, EMBEDDINGS, POSTS_INDEX, SIMILARITY_MATRIX};
use crate::config::{LinkingSettings, Profile, RelinkPolicy, RunOptions, SimilaritySettings};
use crate::error::AppError;
use crate::model::{
    product_key, EmbeddingEntry, EmbeddingsArtifact, PostEntry, PostsIndex, ProductEntry,
    SimilarPost, SimilarProduct, SimilarityEntry, SimilarityMatrix, ARTIFACT_VERSION,
};

/// Version written into processing markers.
const MARKER_VERSION: &str = "1.0";
const PRODUCT_KEYWORD_WEIGHT: f64 = 0.4;
const PRODUCT_SEMANTIC_WEIGHT: f64 = 0.6;
const INLINE_LINK: &str = "inline";

/// Counters reported by every stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub stage: &'static str,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub links_added: usize,
    pub links_removed: usize,
}

impl StageReport {
    fn new(stage: &'static str) -> Self {
        Self {
            stage,
            ..Self::default()
        }
    }

    pub fn log(&self) {
        info!(
            stage = self.stage,
            processed = self.processed,
            skipped = self.skipped,
            errors = self.errors,
            links_added = self.links_added,
            links_removed = self.links_removed,
            "stage complete"
        );
    }
}

/// What happened to one article in `apply-links`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Linked(usize),
    Skipped(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStats {
    pub articles: usize,
    /// Articles carrying an internal-link processing marker.
    pub processed_articles: usize,
    pub internal_links: usize,
    pub external_links: usize,
    pub sponsored_links: usize,
    pub indexed_posts: Option<usize>,
    pub indexed_products: Option<usize>,
    pub embeddings: Option<usize>,
    pub similarity_entries: Option<usize>,
}

pub struct Pipeline<R, E> {
    repo: R,
    embedder: Option<E>,
    store: ArtifactStore,
    policy: BoundaryPolicy,
    extractor: AnchorExtractor,
    similarity: SimilaritySettings,
    linking: LinkingSettings,
    options: RunOptions,
}

impl<R: ArticleRepository, E: Embedder> Pipeline<R, E> {
    /// `embedder` is only needed by `generate-embeddings`.
    pub fn new(
        repo: R,
        embedder: Option<E>,
        store: ArtifactStore,
        profile: Profile,
        options: RunOptions,
    ) -> Result<Self, AppError> {
        Ok(Self {
            repo,
            embedder,
            store,
            policy: BoundaryPolicy::from(profile.boundary),
            extractor: AnchorExtractor::new(profile.anchors)?,
            similarity: profile.similarity,
            linking: profile.linking,
            options,
        })
    }

    #[cfg(test)]
    pub fn repo(&self) -> &R {
        &self.repo
    }

    #[cfg(test)]
    pub fn options_mut(&mut self) -> &mut RunOptions {
        &mut self.options
    }

    /// Stages 1–4 in order. With `skip_index`, the existing index and embeddings are reused.
    pub async fn run(&self) -> Result<Vec<StageReport>, AppError> {
        let mut reports = Vec::new();
        if self.options.skip_index {
            info!("reusing existing index and embeddings");
        } else {
            reports.push(self.build_index().await?);
            reports.push(self.generate_embeddings().await?);
        }
        reports.push(self.compute_similarity()?);
        reports.push(self.apply_links().await?);
        Ok(reports)
    }

    pub async fn build_index(&self) -> Result<StageReport, AppError> {
        let mut report = StageReport::new("build-index");

        // The whole corpus is indexed: `limit` only caps the articles that get rewritten.
        let articles = self.repo.find_published(None).await?;
        let mut posts = Vec::with_capacity(articles.len());
        for article in &articles {
            posts.push(self.index_article(article));
            report.processed += 1;
        }

        let mut products = Vec::new();
        if self.options.include_products {
            for product in self.repo.find_products(None).await? {
                match self.index_product(&product) {
                    Some(entry) => {
                        products.push(entry);
                        report.processed += 1;
                    }
                    None => {
                        warn!(id = %product.id, name = %product.name, "product has no usable url, skipping");
                        report.skipped += 1;
                    }
                }
            }
        }

        info!(posts = posts.len(), products = products.len(), "index built");
        let index = PostsIndex {
            version: ARTIFACT_VERSION.to_string(),
            posts,
            products,
            timestamp: Utc::now().timestamp_millis(),
        };
        self.store.save(POSTS_INDEX, &index)?;
        report.log();
        Ok(report)
    }

    fn index_article(&self, article: &Article) -> PostEntry {
        let text = plain_text(&article.body);
        let entry = PostEntry {
            id: article.id.clone(),
            slug: article.slug.clone(),
            title: article.title.clone(),
            excerpt: truncate_chars(&article.excerpt_text(), EXCERPT_CHARS),
            content_summary: truncate_chars(&text, SUMMARY_CHARS),
            categories: article.categories.clone(),
            tags: article.tags.clone(),
            language: article.language,
            keywords: self.extractor.extract_keywords(article, &text),
            anchor_phrases: self.extractor.extract_anchor_phrases(&text, &article.title),
            content_hash: body_hash(&article.body),
        };
        debug!(
            id = %entry.id,
            keywords = entry.keywords.len(),
            anchor_phrases = entry.anchor_phrases.len(),
            "indexed article"
        );
        entry
    }

    fn index_product(&self, product: &Product) -> Option<ProductEntry> {
        let url = product.link_url()?.to_string();
        Some(ProductEntry {
            id: product.id.clone(),
            name: product.name.clone(),
            url,
            language: product.language,
            primary_keyword: product.keyword_research.clone().filter(|k| !k.trim().is_empty()),
            keywords: product.keywords.clone(),
            anchor_phrases: self.extractor.product_anchor_phrases(product),
            description: product.description.clone().unwrap_or_default(),
        })
    }

    /// Embed every index entry whose text changed since the last run. The artifact is
    /// written after each batch.
    pub async fn generate_embeddings(&self) -> Result<StageReport, AppError> {
        let mut report = StageReport::new("generate-embeddings");
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| AppError::Config("no embedding backend configured".to_string()))?;
        let index: PostsIndex = self.store.require(POSTS_INDEX)?;

        let mut artifact = match self.store.load::<EmbeddingsArtifact>(EMBEDDINGS)? {
            Some(cached)
                if cached.model == embedder.model() && cached.dimension == embedder.dimension() =>
            {
                cached
            }
            Some(cached) => {
                info!(
                    cached_model = %cached.model,
                    model = %embedder.model(),
                    "embedding model changed, discarding cached vectors"
                );
                EmbeddingsArtifact::new(embedder.model(), embedder.dimension())
            }
            None => EmbeddingsArtifact::new(embedder.model(), embedder.dimension()),
        };

        // 1. Compose texts
        let items: Vec<(String, String, String)> = index
            .posts
            .iter()
            .map(|p| (p.id.clone(), p.slug.clone(), compose_embedding_text(p)))
            .chain(
                index
                    .products
                    .iter()
                    .map(|p| (product_key(&p.id), p.name.clone(), compose_product_text(p))),
            )
            .collect();

        // 2. Drop vectors of entries that left the index
        let live: HashSet<&str> = items.iter().map(|(key, _, _)| key.as_str()).collect();
        let before = artifact.embeddings.len();
        artifact.embeddings.retain(|key, _| live.contains(key.as_str()));
        if artifact.embeddings.len() < before {
            info!(removed = before - artifact.embeddings.len(), "pruned stale embeddings");
        }

        // 3. Keep cached vectors whose text is unchanged
        let mut pending = Vec::new();
        for (key, slug, text) in items {
            let text_hash = content_hash(&text);
            if artifact
                .embeddings
                .get(&key)
                .is_some_and(|cached| cached.text_hash == text_hash)
            {
                report.skipped += 1;
                continue;
            }
            pending.push((key, slug, text, text_hash));
        }
        info!(pending = pending.len(), cached = report.skipped, "embedding texts prepared");

        // 4. Embed in batches
        let batch_size = self.options.embed_batch_size.max(1);
        for batch in pending.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, _, text, _)| text.clone()).collect();
            let vectors = match embedder.embed(&texts).await {
                Ok(vectors) => vectors,
                Err(e @ CommonError::ServiceUnavailable { .. }) => {
                    error!(
                        error = %e,
                        embedded = report.processed,
                        remaining = pending.len() - report.processed - report.errors,
                        "embedding service unavailable, aborting"
                    );
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(error = %e, batch = batch.len(), "embedding batch failed");
                    report.errors += batch.len();
                    continue;
                }
            };
            if vectors.len() != batch.len() {
                warn!(expected = batch.len(), actual = vectors.len(), "embedding count mismatch");
                report.errors += batch.len();
                continue;
            }

            for ((key, slug, _, text_hash), vector) in batch.iter().zip(vectors) {
                if vector.len() != artifact.dimension {
                    warn!(key = %key, expected = artifact.dimension, actual = vector.len(), "dimension mismatch");
                    report.errors += 1;
                    continue;
                }
                artifact.embeddings.insert(
                    key.clone(),
                    EmbeddingEntry {
                        slug: slug.clone(),
                        vector,
                        text_hash: text_hash.clone(),
                    },
                );
                report.processed += 1;
            }
            artifact.timestamp = Utc::now().timestamp_millis();
            self.store.save(EMBEDDINGS, &artifact)?;
            debug!(embedded = report.processed, "batch saved");
        }

        if pending.is_empty() {
            artifact.timestamp = Utc::now().timestamp_millis();
            self.store.save(EMBEDDINGS, &artifact)?;
        }
        report.log();
        Ok(report)
    }

    /// Rank related articles and relevant products for every indexed article.
    pub fn compute_similarity(&self) -> Result<StageReport, AppError> {
        let mut report = StageReport::new("compute-similarity");
        let index: PostsIndex = self.store.require(POSTS_INDEX)?;
        let embeddings: EmbeddingsArtifact = self.store.require(EMBEDDINGS)?;

        let posts: HashMap<&str, &PostEntry> =
            index.posts.iter().map(|p| (p.id.as_str(), p)).collect();
        let vectors: EmbeddingIndex = index
            .posts
            .iter()
            .filter_map(|p| {
                embeddings
                    .embeddings
                    .get(&p.id)
                    .map(|e| EmbeddingVector::new(p.id.clone(), e.vector.clone()))
            })
            .collect();
        let targets = vectors.vectors();
        let product_vectors: Vec<(&ProductEntry, &[f32])> = index
            .products
            .iter()
            .filter_map(|p| {
                embeddings
                    .embeddings
                    .get(&product_key(&p.id))
                    .map(|e| (p, e.vector.as_slice()))
            })
            .collect();

        let mut matrix = SimilarityMatrix {
            version: ARTIFACT_VERSION.to_string(),
            threshold: self.similarity.threshold,
            similarities: Default::default(),
            timestamp: Utc::now().timestamp_millis(),
        };

        for post in &index.posts {
            let source = match vectors.get(&post.id) {
                Ok(source) => source,
                Err(e) => {
                    warn!(id = %post.id, error = %e, "skipping article");
                    report.skipped += 1;
                    continue;
                }
            };

            let mut similar: Vec<SimilarPost> = rank_candidates(source, &targets, f64::MIN, targets.len())
                .into_iter()
                .filter_map(|ranked| {
                    let target = posts.get(ranked.target.owner_id.as_str())?;
                    let category_overlap = jaccard(&post.categories, &target.categories);
                    let tag_overlap = jaccard(&post.tags, &target.tags);
                    let score = self.similarity.weights.combine(
                        ranked.score,
                        category_overlap,
                        tag_overlap,
                        post.language == target.language,
                    );
                    (score >= self.similarity.threshold).then(|| SimilarPost {
                        id: target.id.clone(),
                        slug: target.slug.clone(),
                        score,
                        category_overlap,
                        tag_overlap,
                    })
                })
                .collect();
            similar.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
            similar.truncate(self.similarity.max_similar);

            let products = self.relevant_products(post, &source.values, &product_vectors);

            debug!(id = %post.id, similar = similar.len(), products = products.len(), "ranked");
            matrix.similarities.insert(
                post.id.clone(),
                SimilarityEntry {
                    slug: post.slug.clone(),
                    similar,
                    products,
                },
            );
            report.processed += 1;
        }

        self.store.save(SIMILARITY_MATRIX, &matrix)?;
        report.log();
        Ok(report)
    }

    /// Products scored by keyword presence and embedding similarity. A strong keyword match
    /// qualifies a product on its own.
    fn relevant_products(
        &self,
        post: &PostEntry,
        source: &[f32],
        products: &[(&ProductEntry, &[f32])],
    ) -> Vec<SimilarProduct> {
        let post_text = [
            post.title.as_str(),
            post.content_summary.as_str(),
            &post.keywords.join(" "),
            &post.anchor_phrases.join(" "),
        ]
        .join(" ")
        .to_lowercase();

        let mut relevant: Vec<SimilarProduct> = products
            .iter()
            .filter(|(product, _)| product.language.accepts(post.language))
            .filter_map(|(product, vector)| {
                let semantic = match cosine_similarity(source, vector) {
                    Ok(score) => score,
                    Err(e) => {
                        warn!(id = %post.id, product = %product.id, error = %e, "skipping product");
                        return None;
                    }
                };
                let (keyword_score, matched_keywords) = keyword_match(&post_text, product);
                let score = PRODUCT_KEYWORD_WEIGHT * keyword_score + PRODUCT_SEMANTIC_WEIGHT * semantic;
                let qualifies = score >= self.similarity.product_threshold
                    || keyword_score >= self.similarity.product_keyword_threshold;
                qualifies.then(|| SimilarProduct {
                    id: product.id.clone(),
                    name: product.name.clone(),
                    score,
                    matched_keywords,
                })
            })
            .collect();
        relevant.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        relevant.truncate(self.similarity.max_products);
        relevant
    }

    /// Link every published article (up to `limit`) to its most similar targets and write
    /// it back.
    pub async fn apply_links(&self) -> Result<StageReport, AppError> {
        let articles = self.repo.find_published(self.options.limit).await?;
        self.link_articles(&articles).await
    }

    /// `apply-links` for a single article fetched by id.
    pub async fn link_post(&self, id: &str) -> Result<StageReport, AppError> {
        let article = self.repo.get(id).await?;
        self.link_articles(std::slice::from_ref(&article)).await
    }

    async fn link_articles(&self, articles: &[Article]) -> Result<StageReport, AppError> {
        let mut report = StageReport::new("apply-links");
        let index: PostsIndex = self.store.require(POSTS_INDEX)?;
        let matrix: SimilarityMatrix = self.store.require(SIMILARITY_MATRIX)?;
        let posts: HashMap<&str, &PostEntry> =
            index.posts.iter().map(|p| (p.id.as_str(), p)).collect();
        let products: HashMap<&str, &ProductEntry> =
            index.products.iter().map(|p| (p.id.as_str(), p)).collect();

        info!(
            articles = articles.len(),
            relink = ?self.options.relink,
            dry_run = self.options.dry_run,
            "applying links"
        );

        for article in articles {
            match self.link_article(article, &matrix, &posts, &products).await {
                Ok(Outcome::Linked(links)) => {
                    report.processed += 1;
                    report.links_added += links;
                }
                Ok(Outcome::Skipped(reason)) => {
                    debug!(id = %article.id, reason, "article skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(id = %article.id, error = %e, "failed to link article");
                    report.errors += 1;
                }
            }
        }

        report.log();
        Ok(report)
    }

    async fn link_article(
        &self,
        article: &Article,
        matrix: &SimilarityMatrix,
        posts: &HashMap<&str, &PostEntry>,
        products: &HashMap<&str, &ProductEntry>,
    ) -> Result<Outcome, AppError> {
        let hash = body_hash(&article.body);
        let relink = self.options.relink;
        if relink == RelinkPolicy::Skip
            && article
                .link_metadata
                .as_ref()
                .and_then(|m| m.content_hash.as_deref())
                == Some(hash.as_str())
        {
            return Ok(Outcome::Skipped("unchanged since last run"));
        }

        let with_products = self.options.include_products && !article.excluded_from_affiliates();
        let Some(entry) = matrix.similarities.get(&article.id) else {
            return Ok(Outcome::Skipped("no similar articles"));
        };
        if entry.similar.is_empty() && (!with_products || entry.products.is_empty()) {
            return Ok(Outcome::Skipped("no similar articles"));
        }

        let mut body = article.body.clone();
        if relink == RelinkPolicy::Replace {
            let (cleaned, removed) = inject::remove_links(&body, LinkFilter::Internal);
            body = cleaned;
            if with_products {
                let (cleaned, removed_products) = inject::remove_links(&body, LinkFilter::Sponsored);
                body = cleaned;
                debug!(id = %article.id, removed, removed_products, "existing links removed");
            } else {
                debug!(id = %article.id, removed, "existing links removed");
            }
        }

        // 1. Affiliate product links claim their keywords first
        let mut product_records = Vec::new();
        if with_products && !entry.products.is_empty() {
            let injection = self.link_products(&body, entry, products)?;
            let by_url: HashMap<&str, &ProductEntry> =
                products.values().map(|p| (p.url.as_str(), *p)).collect();
            product_records = injection
                .applied
                .iter()
                .map(|link| {
                    let product = match &link.target {
                        LinkTarget::External { url, .. } => by_url.get(url.as_str()),
                        LinkTarget::Article(_) => None,
                    };
                    AffiliateRecord {
                        product_id: product.map(|p| p.id.clone()),
                        product_name: product.map(|p| p.name.clone()),
                        anchor_text: Some(link.anchor_text.clone()),
                        position: Some(link.start.to_string()),
                        kind: Some(INLINE_LINK.to_string()),
                    }
                })
                .collect();
            body = injection.document;
        }

        // 2. Internal links in the remaining text
        let internal = self.link_internal(&body, article, entry, posts)?;
        let internal_records: Vec<LinkRecord> = internal
            .applied
            .iter()
            .map(|link| LinkRecord {
                target_slug: match &link.target {
                    LinkTarget::Article(id) => posts.get(id.as_str()).map(|p| p.slug.clone()),
                    LinkTarget::External { url, .. } => Some(url.clone()),
                },
                anchor_text: Some(link.anchor_text.clone()),
                position: Some(link.start.to_string()),
            })
            .collect();
        let body = internal.document;

        let links = internal_records.len() + product_records.len();
        if links == 0 {
            return Ok(Outcome::Skipped("no suitable anchor text"));
        }

        // 3. Processing markers
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut link_metadata = article.link_metadata.clone().unwrap_or_default();
        if relink == RelinkPolicy::Replace {
            link_metadata.links_added.clear();
        }
        link_metadata.version = Some(MARKER_VERSION.to_string());
        link_metadata.last_processed = Some(now.clone());
        link_metadata.content_hash = Some(hash.clone());
        link_metadata.links_added.extend(internal_records);

        let affiliate_metadata = with_products.then(|| {
            let mut meta = article.affiliate_metadata.clone().unwrap_or_default();
            if relink == RelinkPolicy::Replace {
                meta.links_added.clear();
            }
            meta.version = Some(MARKER_VERSION.to_string());
            meta.last_processed = Some(now);
            meta.content_hash = Some(hash);
            meta.links_added.extend(product_records);
            meta
        });

        if self.options.dry_run {
            info!(id = %article.id, title = %article.title, links, "dry run, not writing");
            return Ok(Outcome::Linked(links));
        }

        let update = ArticleUpdate {
            body,
            link_metadata: Some(link_metadata),
            affiliate_metadata,
        };
        self.repo.put(&article.id, &update).await?;
        info!(id = %article.id, title = %article.title, links, "article linked");
        Ok(Outcome::Linked(links))
    }

    fn link_internal(
        &self,
        body: &DocumentNode,
        article: &Article,
        entry: &SimilarityEntry,
        posts: &HashMap<&str, &PostEntry>,
    ) -> Result<Injection, AppError> {
        let existing = link_targets(body);
        let mut phrases = Vec::new();
        for similar in entry.similar.iter().take(self.linking.max_targets) {
            let Some(target_entry) = posts.get(similar.id.as_str()) else {
                debug!(target = %similar.id, "similar article not in index");
                continue;
            };
            let target = LinkTarget::Article(similar.id.clone());
            if similar.id == article.id || existing.contains(&target) {
                continue;
            }
            phrases.extend(
                self.extractor
                    .target_phrases(target_entry, &self.linking)
                    .into_iter()
                    .map(|text| Phrase {
                        text,
                        score: similar.score,
                        payload: target.clone(),
                    }),
            );
        }

        let spans = self.match_spans(body, &phrases);
        let options = InjectOptions {
            allow_duplicate_targets: false,
            max_links: Some(self.linking.max_links),
            link_in_headings: self.linking.link_in_headings,
        };
        Ok(inject_links(body, Some(&article.id), spans, &options)?)
    }

    fn link_products(
        &self,
        body: &DocumentNode,
        entry: &SimilarityEntry,
        products: &HashMap<&str, &ProductEntry>,
    ) -> Result<Injection, AppError> {
        let existing = link_targets(body);
        let mut phrases = Vec::new();
        for relevant in &entry.products {
            let Some(product) = products.get(relevant.id.as_str()) else {
                continue;
            };
            let target = LinkTarget::External {
                url: product.url.clone(),
                sponsored: true,
            };
            if existing.contains(&target) {
                continue;
            }
            let mut seen = HashSet::new();
            let candidates = product
                .primary_keyword
                .iter()
                .chain(&product.keywords)
                .chain(&product.anchor_phrases)
                .filter(|text| seen.insert(text.as_str()));
            for text in candidates {
                phrases.push(Phrase {
                    text: text.clone(),
                    score: relevant.score,
                    payload: target.clone(),
                });
            }
        }

        let spans = self.match_spans(body, &phrases);
        let options = InjectOptions {
            allow_duplicate_targets: false,
            max_links: Some(self.linking.max_product_links),
            link_in_headings: self.linking.link_in_headings,
        };
        Ok(inject_links(body, None, spans, &options)?)
    }

    /// Boundary-safe matches of `phrases` in leaves that may still receive a link.
    fn match_spans(&self, body: &DocumentNode, phrases: &[Phrase<LinkTarget>]) -> Vec<LinkSpan> {
        if phrases.is_empty() {
            return Vec::new();
        }
        let flat = extract_text(body);
        let link_in_headings = self.linking.link_in_headings;
        let eligible = |start: usize, end: usize| linkable_range(&flat, start, end, link_in_headings);
        self.policy
            .find_matches(&flat.text, phrases, &MatchOptions::default(), eligible)
            .into_iter()
            .map(|m| LinkSpan {
                span: m.span,
                target: m.payload,
            })
            .collect()
    }

    /// Unwrap links matching `filter` from every published article and reset the markers
    /// of the link kinds removed.
    pub async fn remove_links(&self, filter: LinkFilter) -> Result<StageReport, AppError> {
        let mut report = StageReport::new("remove-links");
        let articles = self.repo.find_published(self.options.limit).await?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        for article in &articles {
            let (body, removed) = inject::remove_links(&article.body, filter);
            if removed == 0 {
                report.skipped += 1;
                continue;
            }

            let resets_internal = matches!(filter, LinkFilter::Internal | LinkFilter::All);
            let resets_affiliate = !matches!(filter, LinkFilter::Internal);
            let update = ArticleUpdate {
                body,
                link_metadata: resets_internal.then(|| LinkMetadata {
                    version: Some(MARKER_VERSION.to_string()),
                    last_processed: Some(now.clone()),
                    ..LinkMetadata::default()
                }),
                affiliate_metadata: resets_affiliate.then(|| AffiliateMetadata {
                    version: Some(MARKER_VERSION.to_string()),
                    last_processed: Some(now.clone()),
                    exclude_from_affiliates: article.excluded_from_affiliates(),
                    ..AffiliateMetadata::default()
                }),
            };

            if self.options.dry_run {
                info!(id = %article.id, removed, "dry run, not writing");
            } else if let Err(e) = self.repo.put(&article.id, &update).await {
                warn!(id = %article.id, error = %e, "failed to remove links");
                report.errors += 1;
                continue;
            }
            report.processed += 1;
            report.links_removed += removed;
        }

        report.log();
        Ok(report)
    }

    /// Link counts across published articles plus artifact sizes.
    pub async fn stats(&self) -> Result<LinkStats, AppError> {
        let articles = self.repo.find_published(None).await?;
        let mut stats = LinkStats {
            articles: articles.len(),
            ..LinkStats::default()
        };
        for article in &articles {
            let counts = count_links(&article.body);
            stats.internal_links += counts.internal;
            stats.external_links += counts.external;
            stats.sponsored_links += counts.sponsored;
            if article.link_metadata.as_ref().is_some_and(|m| m.content_hash.is_some()) {
                stats.processed_articles += 1;
            }
        }

        if let Some(index) = self.store.load::<PostsIndex>(POSTS_INDEX)? {
            stats.indexed_posts = Some(index.posts.len());
            stats.indexed_products = Some(index.products.len());
        }
        if let Some(embeddings) = self.store.load::<EmbeddingsArtifact>(EMBEDDINGS)? {
            stats.embeddings = Some(embeddings.embeddings.len());
        }
        if let Some(matrix) = self.store.load::<SimilarityMatrix>(SIMILARITY_MATRIX)? {
            stats.similarity_entries = Some(matrix.similarities.len());
        }
        Ok(stats)
    }
}

/// Hash of the flattened body text. Adding or removing links leaves it unchanged.
fn body_hash(body: &DocumentNode) -> String {
    content_hash(&extract_text(body).text)
}

fn linkable_range(flat: &FlatText, start: usize, end: usize, link_in_headings: bool) -> bool {
    flat.leaf_containing(start, end).is_some_and(|leaf| {
        !leaf.context.in_link && (link_in_headings || !leaf.context.in_heading)
    })
}

/// Keyword relevance of a product to a lowercased article text, in [0, 1], and the
/// keywords found.
fn keyword_match(post_text: &str, product: &ProductEntry) -> (f64, Vec<String>) {
    let mut score: f64 = 0.0;
    let mut matched: Vec<String> = Vec::new();
    let found = |keyword: &str| !keyword.is_empty() && post_text.contains(&keyword.to_lowercase());

    if let Some(primary) = product.primary_keyword.as_deref().filter(|&k| found(k)) {
        matched.push(primary.to_string());
        score += 0.4;
    }
    for keyword in product.keywords.iter().filter(|k| found(k.as_str())) {
        matched.push(keyword.clone());
        score += 0.2;
    }
    for phrase in &product.anchor_phrases {
        if found(phrase.as_str()) && !matched.contains(phrase) {
            matched.push(phrase.clone());
            score += 0.1;
        }
    }
    (score.min(1.0), matched)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::path::Path;

    use link_common::cms::MemoryRepository;
    use serde_json::json;

    use super::*;

    /// Vectors count a few golf terms, so articles sharing terms are similar.
    #[derive(Default)]
    struct FakeEmbedder {
        calls: Cell<usize>,
        fail_from_call: Option<usize>,
    }

    impl Embedder for FakeEmbedder {
        fn model(&self) -> &str {
            "fake"
        }

        fn dimension(&self) -> usize {
            4
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            if self.fail_from_call.is_some_and(|n| call >= n) {
                return Err(CommonError::ServiceUnavailable {
                    attempts: 3,
                    message: "connection refused".to_string(),
                });
            }
            Ok(texts
                .iter()
                .map(|t| {
                    vec![
                        t.matches("スイング").count() as f32,
                        t.matches("パター").count() as f32,
                        t.matches("ドライバー").count() as f32,
                        1.0,
                    ]
                })
                .collect())
        }
    }

    fn article(id: &str, slug: &str, title: &str, body: &str) -> Article {
        serde_json::from_value(json!({
            "id": id,
            "title": title,
            "slug": slug,
            "language": "ja",
            "_status": "published",
            "content": {"root": {"type": "root", "children": [
                {"type": "paragraph", "children": [{"type": "text", "text": body, "format": 0}]}
            ]}}
        }))
        .unwrap()
    }

    fn articles() -> Vec<Article> {
        vec![
            article("1", "swing-basics", "スイングの基本", "ドライバーのスイングを練習する。パターも大切です。"),
            article("2", "choosing-a-driver", "ドライバーの選び方", "スイングが安定したらドライバーを選ぶ。"),
            article("3", "putting-practice", "パターの練習", "パターの距離感はスイングと同じく大切。"),
            article("4", "around-the-green", "グリーン周りの寄せ", "寄せの技術を磨こう。"),
        ]
    }

    fn driver_product() -> Product {
        serde_json::from_value(json!({
            "id": 7,
            "product_name": "テーラーメイド ドライバー",
            "keyword_research": "ドライバー",
            "clean_url": "https://shop.example/driver",
            "language": "ja"
        }))
        .unwrap()
    }

    fn pipeline(
        repo: MemoryRepository,
        dir: &Path,
        options: RunOptions,
    ) -> Pipeline<MemoryRepository, FakeEmbedder> {
        Pipeline::new(
            repo,
            Some(FakeEmbedder::default()),
            ArtifactStore::new(dir),
            Profile::default(),
            options,
        )
        .unwrap()
    }

    fn paragraph_children(body: &DocumentNode) -> Vec<DocumentNode> {
        body.children().unwrap()[0].children().unwrap().to_vec()
    }

    #[tokio::test]
    async fn run_links_articles_once() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(MemoryRepository::new(articles(), Vec::new()), dir.path(), RunOptions::default());

        let reports = p.run().await.unwrap();
        let stages: Vec<&str> = reports.iter().map(|r| r.stage).collect();
        assert_eq!(
            stages,
            ["build-index", "generate-embeddings", "compute-similarity", "apply-links"]
        );

        let apply = &reports[3];
        assert_eq!((apply.processed, apply.skipped, apply.errors), (3, 1, 0));
        assert_eq!(apply.links_added, 4);
        assert_eq!(p.repo().writes(), vec!["1", "2", "3"]);

        // The longest anchor wins: ドライバー goes to the driver article, which leaves
        // スイング for the next target.
        let linked = p.repo().article("1").unwrap();
        let children = paragraph_children(&linked.body);
        assert_eq!(children.len(), 4);
        let expected = [(0, "2", "ドライバー"), (2, "3", "スイング")];
        for (index, target, anchor) in expected {
            match &children[index] {
                DocumentNode::Link(link) => {
                    assert_eq!(link.target(), Some(LinkTarget::Article(target.to_string())));
                    assert_eq!(plain_text(&children[index]), anchor);
                }
                other => panic!("expected a link, got {other:?}"),
            }
        }
        assert_eq!(
            extract_text(&linked.body).text,
            "ドライバーのスイングを練習する。パターも大切です。"
        );

        let marker = linked.link_metadata.unwrap();
        assert_eq!(marker.content_hash, Some(body_hash(&linked.body)));
        let records: Vec<(Option<&str>, Option<&str>, Option<&str>)> = marker
            .links_added
            .iter()
            .map(|r| (r.target_slug.as_deref(), r.anchor_text.as_deref(), r.position.as_deref()))
            .collect();
        assert_eq!(
            records,
            [
                (Some("choosing-a-driver"), Some("ドライバー"), Some("0")),
                (Some("putting-practice"), Some("スイング"), Some("18")),
            ]
        );
        let processed_at = marker.last_processed.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&processed_at).is_ok());
        assert!(processed_at.ends_with('Z'));
        assert_eq!(processed_at.len(), "2024-05-01T12:00:00.123Z".len());
        assert!(linked.affiliate_metadata.is_none());

        // Articles 2 and 3 link back to the closest match, never to themselves.
        for id in ["2", "3"] {
            let body = p.repo().article(id).unwrap().body;
            assert_eq!(link_targets(&body), HashSet::from([LinkTarget::Article("1".to_string())]));
        }
    }

    #[tokio::test]
    async fn rerun_skips_unchanged_articles() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(MemoryRepository::new(articles(), Vec::new()), dir.path(), RunOptions::default());
        p.run().await.unwrap();

        let report = p.apply_links().await.unwrap();
        assert_eq!((report.processed, report.skipped), (0, 4));
        assert_eq!(p.repo().writes().len(), 3);
    }

    #[tokio::test]
    async fn additive_relink_does_not_duplicate_links() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(MemoryRepository::new(articles(), Vec::new()), dir.path(), RunOptions::default());
        p.run().await.unwrap();
        let before = p.repo().article("1").unwrap().body;

        p.options_mut().relink = RelinkPolicy::Additive;
        let report = p.apply_links().await.unwrap();
        assert_eq!(report.links_added, 0);
        assert_eq!(p.repo().article("1").unwrap().body, before);
        assert_eq!(count_links(&before).internal, 2);
    }

    #[tokio::test]
    async fn replace_relink_rebuilds_the_same_links() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(MemoryRepository::new(articles(), Vec::new()), dir.path(), RunOptions::default());
        p.run().await.unwrap();
        let before = p.repo().article("1").unwrap();

        p.options_mut().relink = RelinkPolicy::Replace;
        let report = p.apply_links().await.unwrap();
        assert_eq!((report.processed, report.links_added), (3, 4));
        assert_eq!(p.repo().writes().len(), 6);

        let after = p.repo().article("1").unwrap();
        assert_eq!(after.body, before.body);
        assert_eq!(after.link_metadata.unwrap().links_added.len(), 2);
    }

    #[tokio::test]
    async fn limit_caps_linked_articles_but_not_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(MemoryRepository::new(articles(), Vec::new()), dir.path(), RunOptions::default());
        p.build_index().await.unwrap();
        p.generate_embeddings().await.unwrap();

        p.options_mut().limit = Some(1);
        let reports = p.run().await.unwrap();

        let store = ArtifactStore::new(dir.path());
        let index: PostsIndex = store.require(POSTS_INDEX).unwrap();
        assert_eq!(index.posts.len(), 4);
        assert_eq!((reports[1].processed, reports[1].skipped), (0, 4));
        assert_eq!(p.embedder.as_ref().unwrap().calls.get(), 1);
        let embeddings: EmbeddingsArtifact = store.require(EMBEDDINGS).unwrap();
        assert_eq!(embeddings.embeddings.len(), 4);
        let matrix: SimilarityMatrix = store.require(SIMILARITY_MATRIX).unwrap();
        assert_eq!(matrix.similarities.len(), 4);
        assert_eq!(matrix.similarities["1"].similar.len(), 3);

        assert_eq!((reports[3].processed, reports[3].links_added), (1, 2));
        assert_eq!(p.repo().writes(), vec!["1"]);
    }

    #[tokio::test]
    async fn single_article_is_linked_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(MemoryRepository::new(articles(), Vec::new()), dir.path(), RunOptions::default());
        p.build_index().await.unwrap();
        p.generate_embeddings().await.unwrap();
        p.compute_similarity().unwrap();

        let report = p.link_post("3").await.unwrap();
        assert_eq!((report.processed, report.skipped, report.links_added), (1, 0, 1));
        assert_eq!(p.repo().writes(), vec!["3"]);
        let body = p.repo().article("3").unwrap().body;
        assert_eq!(link_targets(&body), HashSet::from([LinkTarget::Article("1".to_string())]));

        assert!(matches!(
            p.link_post("99").await,
            Err(AppError::Common(CommonError::Cms(_)))
        ));
    }

    #[tokio::test]
    async fn dry_run_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let p = pipeline(MemoryRepository::new(articles(), Vec::new()), dir.path(), options);

        let reports = p.run().await.unwrap();
        assert_eq!(reports[3].processed, 3);
        assert!(p.repo().writes().is_empty());
        assert!(p.repo().article("1").unwrap().link_metadata.is_none());
    }

    #[tokio::test]
    async fn rejected_write_is_counted_and_the_batch_continues() {
        let dir = tempfile::tempdir().unwrap();
        let repo = MemoryRepository::new(articles(), Vec::new()).reject_writes_to("2");
        let p = pipeline(repo, dir.path(), RunOptions::default());

        let reports = p.run().await.unwrap();
        assert_eq!((reports[3].processed, reports[3].errors), (2, 1));
        assert_eq!(p.repo().writes(), vec!["1", "3"]);
    }

    #[tokio::test]
    async fn embeddings_are_cached_by_text_hash() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(MemoryRepository::new(articles(), Vec::new()), dir.path(), RunOptions::default());
        p.build_index().await.unwrap();

        let first = p.generate_embeddings().await.unwrap();
        assert_eq!((first.processed, first.skipped), (4, 0));
        let second = p.generate_embeddings().await.unwrap();
        assert_eq!((second.processed, second.skipped), (0, 4));
        assert_eq!(p.embedder.as_ref().unwrap().calls.get(), 1);
    }

    #[tokio::test]
    async fn partial_embeddings_survive_an_unavailable_service() {
        let dir = tempfile::tempdir().unwrap();
        let options = RunOptions {
            embed_batch_size: 2,
            ..RunOptions::default()
        };
        let p = Pipeline::new(
            MemoryRepository::new(articles(), Vec::new()),
            Some(FakeEmbedder {
                fail_from_call: Some(2),
                ..FakeEmbedder::default()
            }),
            ArtifactStore::new(dir.path()),
            Profile::default(),
            options,
        )
        .unwrap();
        p.build_index().await.unwrap();

        let err = p.generate_embeddings().await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Common(CommonError::ServiceUnavailable { .. })
        ));
        let saved: EmbeddingsArtifact = ArtifactStore::new(dir.path()).require(EMBEDDINGS).unwrap();
        assert_eq!(saved.embeddings.len(), 2);
    }

    #[tokio::test]
    async fn similarity_requires_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(MemoryRepository::new(articles(), Vec::new()), dir.path(), RunOptions::default());
        p.build_index().await.unwrap();
        assert!(matches!(
            p.compute_similarity(),
            Err(AppError::MissingArtifact { stage: "generate-embeddings", .. })
        ));
    }

    #[tokio::test]
    async fn similarity_matrix_ranks_related_articles() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(MemoryRepository::new(articles(), Vec::new()), dir.path(), RunOptions::default());
        p.build_index().await.unwrap();
        p.generate_embeddings().await.unwrap();
        p.compute_similarity().unwrap();

        let matrix: SimilarityMatrix = ArtifactStore::new(dir.path()).require(SIMILARITY_MATRIX).unwrap();
        let similar: Vec<&str> = matrix.similarities["1"].similar.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(similar, ["2", "3", "4"]);
        let scores: Vec<f64> = matrix.similarities["1"].similar.iter().map(|s| s.score).collect();
        assert!((scores[0] - scores[1]).abs() < 1e-12);
        assert!(scores[1] > scores[2]);
        assert!(matrix.similarities.values().all(|e| e.similar.iter().all(|s| s.score <= 1.0)));
    }

    #[tokio::test]
    async fn products_are_linked_as_sponsored() {
        let dir = tempfile::tempdir().unwrap();
        let options = RunOptions {
            include_products: true,
            ..RunOptions::default()
        };
        let repo = MemoryRepository::new(articles(), vec![driver_product()]);
        let p = pipeline(repo, dir.path(), options);
        p.run().await.unwrap();

        let matrix: SimilarityMatrix = ArtifactStore::new(dir.path()).require(SIMILARITY_MATRIX).unwrap();
        assert_eq!(matrix.similarities["1"].products.len(), 1);
        assert_eq!(matrix.similarities["1"].products[0].matched_keywords, vec!["ドライバー"]);
        assert!(matrix.similarities["3"].products.is_empty());

        // The product claims ドライバー; the internal link falls back to スイング.
        let linked = p.repo().article("1").unwrap();
        let counts = count_links(&linked.body);
        assert_eq!((counts.internal, counts.sponsored), (1, 1));
        let internal = linked.link_metadata.unwrap();
        assert_eq!(internal.links_added.len(), 1);
        assert_eq!(internal.links_added[0].target_slug.as_deref(), Some("choosing-a-driver"));
        assert_eq!(internal.links_added[0].anchor_text.as_deref(), Some("スイング"));
        let affiliate = linked.affiliate_metadata.unwrap();
        assert_eq!(affiliate.links_added.len(), 1);
        assert_eq!(affiliate.links_added[0].product_id.as_deref(), Some("7"));
        assert_eq!(affiliate.links_added[0].anchor_text.as_deref(), Some("ドライバー"));
        assert_eq!(affiliate.links_added[0].kind.as_deref(), Some("inline"));
    }

    #[tokio::test]
    async fn remove_links_restores_bodies_and_resets_markers() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(MemoryRepository::new(articles(), Vec::new()), dir.path(), RunOptions::default());
        p.run().await.unwrap();

        let report = p.remove_links(LinkFilter::Internal).await.unwrap();
        assert_eq!((report.processed, report.skipped, report.links_removed), (3, 1, 4));

        let original = &articles()[0];
        let restored = p.repo().article("1").unwrap();
        assert_eq!(restored.body, original.body);
        let marker = restored.link_metadata.unwrap();
        assert!(marker.links_added.is_empty());
        assert!(marker.content_hash.is_none());

        let stats = p.stats().await.unwrap();
        assert_eq!(stats.internal_links, 0);
        assert_eq!(stats.processed_articles, 0);
        assert_eq!(stats.indexed_posts, Some(4));
    }

    #[test]
    fn keyword_match_weights() {
        let product = ProductEntry {
            id: "1".to_string(),
            name: "パター".to_string(),
            url: "https://shop.example/putter".to_string(),
            language: link_common::cms::Language::Ja,
            primary_keyword: Some("パター".to_string()),
            keywords: vec!["Putter".to_string(), "グリップ".to_string()],
            anchor_phrases: vec!["パター".to_string(), "距離感".to_string()],
            description: String::new(),
        };
        let (score, matched) = keyword_match("パターの距離感 putter", &product);
        assert!((score - 0.7).abs() < 1e-9);
        assert_eq!(matched, vec!["パター", "Putter", "距離感"]);
    }
}
