/// Anchor phrase and keyword extraction for the index stage.
///
/// Anchor phrases are the strings other articles may later be linked *with*: dictionary
/// terms found in the body, the same terms extended by a short katakana or kanji suffix
/// (`スイング軌道`), short kana/kanji runs that contain a term, title parts and
/// number-with-counter phrases (`90%`, `3秒`). Keywords feed the embedding text and the
/// product keyword score.
use std::collections::{HashMap, HashSet};

use link_common::cms::{Article, Product};
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::LinkingSettings;
use crate::error::AppError;
use crate::model::{PostEntry, ProductEntry};

/// A term followed by up to four katakana or one or two kanji.
const TERM_EXTENSION: &str = r"(?:[ァ-ヶー]{1,4}|[\x{4E00}-\x{9FAF}]{1,2})";
const NOUN_RUN: &str = r"[\x{30A0}-\x{30FF}\x{4E00}-\x{9FAF}]{2,6}";
const NUMBER_PHRASE: &str = r"[0-9]+[%％]?[\x{4E00}-\x{9FAF}]{1,3}";
const JAPANESE_KEYWORD: &str = r"[\x{30A0}-\x{30FF}]{3,}|[\x{4E00}-\x{9FAF}]{2,4}";
const KATAKANA_RUN: &str = r"[\x{30A0}-\x{30FF}]+";
const LATIN_SEPARATOR: &str = r"[^a-z0-9_]+";

const TITLE_SEPARATOR: char = '：';
const MAX_EXTENDED_CHARS: usize = 15;
const MAX_TITLE_PART_CHARS: usize = 30;
const MAX_LATIN_KEYWORDS: usize = 20;
const EMBEDDING_KEYWORDS: usize = 10;
pub const SUMMARY_CHARS: usize = 500;
pub const EXCERPT_CHARS: usize = 200;

const STOPWORDS: &[&str] = &[
    "the", "is", "at", "which", "on", "and", "a", "an", "as", "are", "was", "were", "been",
    "be", "have", "has", "had", "do", "does", "did", "will", "would", "could", "should", "may",
    "might", "must", "can", "this", "that", "these", "those", "i", "you", "he", "she", "it",
    "we", "they", "what", "who", "when", "where", "why", "how", "all", "each", "every", "both",
    "few", "more", "most", "other", "some", "such", "no", "nor", "not", "only", "own", "same",
    "so", "than", "too", "very", "just", "about", "after", "also", "back", "because", "but",
    "even", "for", "from", "get", "give", "go", "good", "great", "if", "in", "into", "its",
    "like", "make", "many", "over", "or", "out", "see", "take", "their", "them", "then",
    "there", "through", "to", "up", "use", "with", "your",
];

/// Vocabulary driving anchor extraction. Every field is optional in a profile file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnchorProfile {
    /// Domain terms looked for in article bodies.
    pub terms: Vec<String>,
    /// Terms that become link candidates for a target when its anchor phrases mention them.
    pub core_terms: Vec<String>,
    /// Product-category terms looked for in product names.
    pub product_terms: Vec<String>,
    /// Too generic to be used as anchor text.
    pub excluded_phrases: Vec<String>,
    pub max_phrases: usize,
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for AnchorProfile {
    fn default() -> Self {
        Self {
            terms: owned(&[
                "ゴルフ", "ゴルファー", "スイング", "クラブ", "ボール", "コース", "ホール", "パー",
                "バーディー", "イーグル", "ボギー", "パット", "ドライブ", "チップ", "ピッチ",
                "バンカー", "フェアウェイ", "グリーン", "ティー", "スタンス", "グリップ", "アドレス",
                "テークバック", "ダウンスイング", "インパクト", "フォロースルー", "フィニッシュ",
                "スイングプレーン", "リリース", "ドロー", "フェード", "スライス", "フック",
                "プッシュ", "プル", "バックスイング", "トップスイング", "ミスショット",
                "ベストスコア", "アプローチショット", "ティーショット", "セカンドショット",
                "パターグリップ", "ドライバーショット", "アイアンショット", "飛距離", "方向性",
                "安定性", "基本", "練習", "コースマネジメント", "スコアアップ", "スイング改善",
                "ゴルフ上達", "初心者", "ゴルフレッスン", "ゴルフスクール", "ゴルフ練習", "ゴルフ場",
                "打ちっぱなし", "練習場", "ラウンド", "コンペ", "スコア", "ヘッドスピード",
                "ミート率", "スピン量", "打ち出し角", "クラブフェース", "スイング軌道", "ボール位置",
                "体重移動", "肩の回転", "腰の回転", "手首の角度", "グリッププレッシャー",
            ]),
            core_terms: owned(&[
                "スイング", "クラブ", "ボール", "パット", "ドライバー", "アイアン", "グリップ",
                "スタンス", "バックスイング",
            ]),
            product_terms: owned(&[
                "ゴルフクラブ", "ドライバー", "アイアン", "パター", "ウェッジ", "フェアウェイウッド",
                "ユーティリティ", "サンドウェッジ", "ピッチングウェッジ", "ゴルフボール",
                "ゴルフシューズ", "ゴルフグローブ", "キャディバッグ", "ティー", "マーカー",
                "グリップ", "シャフト", "ヘッドカバー", "レンジファインダー", "距離計",
                "スコアカード", "グリーンフォーク", "ゴルフウェア", "ポロシャツ", "ゴルフパンツ",
                "レインウェア", "サンバイザー", "キャップ", "ゴルフソックス", "練習器具",
                "スイング練習", "パッティング練習", "トレーニング用品", "素振り", "練習マット",
                "ネット", "ゴルフ用品", "ゴルフグッズ", "ゴルフアクセサリー",
            ]),
            excluded_phrases: owned(&["ゴルフ"]),
            max_phrases: 100,
        }
    }
}

/// Insertion-ordered set of phrases.
#[derive(Default)]
struct PhraseSet {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl PhraseSet {
    fn add(&mut self, phrase: &str) {
        let phrase = phrase.trim();
        if !phrase.is_empty() && self.seen.insert(phrase.to_string()) {
            self.ordered.push(phrase.to_string());
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.ordered
    }
}

/// Compiled extraction rules for one profile.
#[derive(Debug, Clone)]
pub struct AnchorExtractor {
    profile: AnchorProfile,
    extensions: Vec<(String, Regex)>,
    noun_run: Regex,
    number_phrase: Regex,
    japanese_keyword: Regex,
    katakana_run: Regex,
    latin_separator: Regex,
}

impl AnchorExtractor {
    pub fn new(profile: AnchorProfile) -> Result<Self, AppError> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| AppError::Config(format!("invalid anchor pattern {pattern}: {e}")))
        };

        let extensions = profile
            .terms
            .iter()
            .filter(|term| !term.is_empty())
            .map(|term| {
                let pattern = format!("{}{}", regex::escape(term), TERM_EXTENSION);
                compile(&pattern).map(|re| (term.clone(), re))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            extensions,
            noun_run: compile(NOUN_RUN)?,
            number_phrase: compile(NUMBER_PHRASE)?,
            japanese_keyword: compile(JAPANESE_KEYWORD)?,
            katakana_run: compile(KATAKANA_RUN)?,
            latin_separator: compile(LATIN_SEPARATOR)?,
            profile,
        })
    }

    /// Candidate anchor phrases for an article, in discovery order, capped at `max_phrases`.
    pub fn extract_anchor_phrases(&self, text: &str, title: &str) -> Vec<String> {
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut phrases = PhraseSet::default();

        for (term, extension) in &self.extensions {
            if text.contains(term.as_str()) {
                phrases.add(term);
            }
            for m in extension.find_iter(&text) {
                let chars = m.as_str().chars().count();
                if (2..MAX_EXTENDED_CHARS).contains(&chars) {
                    phrases.add(m.as_str());
                }
            }
        }

        for m in self.noun_run.find_iter(&text) {
            if self.profile.terms.iter().any(|t| m.as_str().contains(t.as_str())) {
                phrases.add(m.as_str());
            }
        }

        for part in title_parts(title) {
            phrases.add(part);
        }
        phrases.add(title);

        for m in self.number_phrase.find_iter(&text) {
            if m.as_str().chars().count() >= 2 {
                phrases.add(m.as_str());
            }
        }

        let mut phrases = phrases.into_vec();
        phrases.truncate(self.profile.max_phrases);
        phrases
    }

    /// SEO keywords, kana/kanji runs from the body and the most frequent Latin words.
    pub fn extract_keywords(&self, article: &Article, text: &str) -> Vec<String> {
        let mut keywords = PhraseSet::default();

        if let Some(meta_keywords) = &article.meta.keywords {
            for keyword in meta_keywords.split(',') {
                keywords.add(&keyword.to_lowercase());
            }
        }
        if let Some(focus) = &article.meta.focus_keyphrase {
            keywords.add(&focus.to_lowercase());
        }

        for m in self.japanese_keyword.find_iter(text) {
            if (2..=10).contains(&m.as_str().chars().count()) {
                keywords.add(m.as_str());
            }
        }

        let lowered = text.to_lowercase();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut first_seen: Vec<&str> = Vec::new();
        for word in self.latin_separator.split(&lowered) {
            if word.len() > 4 && !is_stopword(word) {
                let count = counts.entry(word).or_insert(0);
                if *count == 0 {
                    first_seen.push(word);
                }
                *count += 1;
            }
        }
        // Stable: equally frequent words keep first-occurrence order.
        first_seen.sort_by(|a, b| counts[b].cmp(&counts[a]));
        for word in first_seen.into_iter().take(MAX_LATIN_KEYWORDS) {
            keywords.add(word);
        }

        keywords.into_vec()
    }

    /// Primary keyword, additional keywords, known product terms and katakana brand-like
    /// runs from the product name.
    pub fn product_anchor_phrases(&self, product: &Product) -> Vec<String> {
        let mut phrases = PhraseSet::default();
        if let Some(primary) = &product.keyword_research {
            phrases.add(primary);
        }
        for keyword in &product.keywords {
            phrases.add(keyword);
        }
        for term in &self.profile.product_terms {
            if product.name.contains(term.as_str()) {
                phrases.add(term);
            }
        }
        for m in self.katakana_run.find_iter(&product.name) {
            if m.as_str().chars().count() >= 3 {
                phrases.add(m.as_str());
            }
        }
        phrases.into_vec()
    }

    /// Phrases under which `target` may be linked from other articles, longest first.
    pub fn target_phrases(&self, target: &PostEntry, settings: &LinkingSettings) -> Vec<String> {
        let mut phrases = PhraseSet::default();
        phrases.add(&target.title);
        for part in title_parts(&target.title) {
            phrases.add(part);
        }
        for term in &self.profile.core_terms {
            if target.anchor_phrases.iter().any(|p| p.contains(term.as_str())) {
                phrases.add(term);
            }
        }
        target
            .anchor_phrases
            .iter()
            .filter(|p| p.chars().count() >= 2 && !self.is_excluded(p))
            .take(settings.max_phrases_per_target)
            .for_each(|p| phrases.add(p));

        let mut phrases = phrases.into_vec();
        phrases.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));
        phrases
    }

    fn is_excluded(&self, phrase: &str) -> bool {
        self.profile.excluded_phrases.iter().any(|e| e == phrase)
    }
}

/// Title segments split at the full-width colon, 2 to 29 characters each.
fn title_parts(title: &str) -> Vec<&str> {
    if !title.contains(TITLE_SEPARATOR) {
        return Vec::new();
    }
    title
        .split(TITLE_SEPARATOR)
        .map(str::trim)
        .filter(|part| (2..MAX_TITLE_PART_CHARS).contains(&part.chars().count()))
        .collect()
}

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

/// Text embedded for an article.
pub fn compose_embedding_text(entry: &PostEntry) -> String {
    let keywords: Vec<&str> = entry
        .keywords
        .iter()
        .take(EMBEDDING_KEYWORDS)
        .map(String::as_str)
        .collect();
    join_non_empty(&[
        entry.title.as_str(),
        entry.excerpt.as_str(),
        entry.content_summary.as_str(),
        &entry.categories.join(" "),
        &entry.tags.join(" "),
        &keywords.join(" "),
    ])
}

/// Text embedded for a product.
pub fn compose_product_text(entry: &ProductEntry) -> String {
    join_non_empty(&[
        entry.name.as_str(),
        entry.primary_keyword.as_deref().unwrap_or_default(),
        &entry.keywords.join(" "),
        entry.description.as_str(),
        &entry.anchor_phrases.join(" "),
    ])
}

fn join_non_empty(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 hex digest.
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// The first `max` characters of `text`, trimmed.
pub fn truncate_chars(text: &str, max: usize) -> String {
    let end = text
        .char_indices()
        .nth(max)
        .map_or(text.len(), |(index, _)| index);
    text[..end].trim().to_string()
}
