/// Boundary-safe phrase matching.
///
/// Japanese text has no spaces between words, so a short phrase such as `スコア` is often a
/// strict prefix of a longer compound (`スコアカード`). A raw substring hit is only accepted
/// when:
/// - it is not inside a known compound of that phrase (the compound is aligned against the
///   surrounding text at every position the phrase occurs inside it), and
/// - both sides are boundaries: the text edge, a boundary character, an adjacent particle
///   token, or (when enabled) a change of script class between the match edge and its
///   neighbour.
///
/// Phrases without a dictionary entry fall back to the boundary checks alone, which can miss
/// compounds written in a different script than the phrase (`ゴルフ場`).
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A validated occurrence of a phrase in a flattened text. Offsets are UTF-8 byte offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSpan {
    pub start: usize,
    pub end: usize,
    pub phrase: String,
    pub confidence: f64,
}

impl MatchSpan {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &MatchSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A phrase to look for, carrying the score of its target and a caller-defined payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Phrase<T> {
    pub text: String,
    pub score: f64,
    pub payload: T,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhraseMatch<T> {
    pub span: MatchSpan,
    pub payload: T,
}

#[derive(Debug, Clone)]
pub struct MatchOptions {
    /// Accept at most one match per payload (one link per target).
    pub distinct_payloads: bool,
    pub max_matches: Option<usize>,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            distinct_payloads: true,
            max_matches: None,
        }
    }
}

/// Boundary policy as written in a profile file. Missing fields take the built-in defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyTable {
    /// Short phrase → longer compounds that contain it.
    pub compounds: BTreeMap<String, Vec<String>>,
    /// Characters that delimit words (whitespace always does).
    pub boundary_chars: String,
    /// Particle tokens that delimit words when adjacent to a match.
    pub particles: Vec<String>,
    /// Treat a change of script (kana/kanji/latin) at the match edge as a boundary.
    pub script_transitions: bool,
    /// Phrases that are page furniture rather than content (captions, navigation).
    pub metadata_phrases: Vec<String>,
    pub metadata_suffixes: Vec<String>,
    pub min_phrase_chars: usize,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let compounds: &[(&str, &[&str])] = &[
            ("スコア", &["スコアカード", "スコアリング", "スコアボード", "スコアメイク", "スコアアップ"]),
            ("プレー", &["プレーヤー", "プレースタイル", "プレーオフ", "プレーイング"]),
            ("プレイ", &["プレイヤー", "プレイング"]),
            ("ゴルフ", &["ゴルファー", "ゴルフ場", "ゴルフクラブ", "ゴルフボール", "ゴルフバッグ", "ゴルフコース"]),
            ("ショット", &["ショットガン", "ショットメーカー", "ショットセレクション"]),
            ("パット", &["パッティング", "パッター", "パットライン"]),
            ("クラブ", &["クラブハウス", "クラブフェース", "クラブヘッド", "クラブセット"]),
            ("アイアン", &["アイアンショット", "アイアンセット"]),
            ("ドライバー", &["ドライバーショット"]),
            ("コース", &["コースマネジメント", "コースレコード", "コースレート", "コースコンディション"]),
            ("グリーン", &["グリーンキーパー", "グリーンフィー", "グリーンサイド", "グリーンスピード"]),
            ("フェアウェイ", &["フェアウェイウッド", "フェアウェイバンカー"]),
            ("スイング", &["スイングプレーン", "スイングスピード", "スイングアーク", "スイングテンポ", "バックスイング", "ダウンスイング"]),
            ("バック", &["バックスイング", "バックスピン", "バックティー"]),
            ("ボール", &["ボールマーカー", "ボールポジション", "ボールフライト"]),
            ("ラウンド", &["ラウンドレッスン"]),
            ("ハンディ", &["ハンディキャップ"]),
            ("ティー", &["ティーショット", "ティーグラウンド", "ティーアップ"]),
            ("アプローチ", &["アプローチショット", "アプローチウェッジ"]),
            ("フォロー", &["フォロースルー"]),
        ];

        Self {
            compounds: compounds
                .iter()
                .map(|(phrase, list)| {
                    (phrase.to_string(), list.iter().map(|c| c.to_string()).collect())
                })
                .collect(),
            boundary_chars: "。、！？（）「」『』【】・〜：；…,.!?()[]{}:;\"'-/\\".to_string(),
            particles: [
                "を", "が", "は", "に", "で", "から", "まで", "と", "も", "や", "の", "へ", "より",
                "として", "について", "における",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            script_transitions: true,
            metadata_phrases: [
                "ヒーロー画像", "アイキャッチ", "サムネイル", "イメージ画像", "出典", "参考文献",
                "リンク:", "画像:", "ソース:", "コメント", "シェア", "いいね", "次へ", "前へ",
                "ホーム", "メニュー", "クリック", "タップ", "スクロール", "ズーム",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            metadata_suffixes: ["リンク", "ページ", "サイト"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            min_phrase_chars: 2,
        }
    }
}

/// Compiled boundary policy.
#[derive(Debug, Clone)]
pub struct BoundaryPolicy {
    compounds: HashMap<String, Vec<String>>,
    boundary_chars: HashSet<char>,
    /// Longest first, so multi-character particles are tried before their prefixes.
    particles: Vec<String>,
    script_transitions: bool,
    metadata_phrases: Vec<String>,
    metadata_suffixes: Vec<String>,
    min_phrase_chars: usize,
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        Self::from(PolicyTable::default())
    }
}

impl From<PolicyTable> for BoundaryPolicy {
    fn from(table: PolicyTable) -> Self {
        let mut compounds: HashMap<String, Vec<String>> = HashMap::new();
        for (phrase, list) in table.compounds {
            let valid: Vec<String> = list
                .into_iter()
                .filter(|compound| {
                    let ok = compound.len() > phrase.len() && compound.contains(phrase.as_str());
                    if !ok {
                        warn!(phrase = %phrase, compound = %compound, "compound does not contain its phrase, ignoring");
                    }
                    ok
                })
                .collect();
            if !valid.is_empty() {
                compounds.insert(phrase, valid);
            }
        }

        let mut particles: Vec<String> = table
            .particles
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        particles.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        Self {
            compounds,
            boundary_chars: table.boundary_chars.chars().collect(),
            particles,
            script_transitions: table.script_transitions,
            metadata_phrases: table.metadata_phrases,
            metadata_suffixes: table.metadata_suffixes,
            min_phrase_chars: table.min_phrase_chars,
        }
    }
}

impl BoundaryPolicy {
    /// Known compounds containing `phrase`.
    pub fn compounds_for(&self, phrase: &str) -> &[String] {
        self.compounds.get(phrase).map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether `text[start..end]` sits inside one of the phrase's known compounds.
    pub fn is_part_of_compound(&self, text: &str, start: usize, end: usize) -> bool {
        let Some(phrase) = text.get(start..end) else {
            return false;
        };
        self.compounds_for(phrase).iter().any(|compound| {
            compound.match_indices(phrase).any(|(offset, _)| {
                start.checked_sub(offset).is_some_and(|compound_start| {
                    text.get(compound_start..compound_start + compound.len())
                        == Some(compound.as_str())
                })
            })
        })
    }

    /// Whether `text[start..end]` is a standalone word rather than a fragment of a longer one.
    /// Invalid ranges (out of bounds, empty, or not on character boundaries) are never standalone.
    pub fn is_standalone_match(&self, text: &str, start: usize, end: usize) -> bool {
        let Some(phrase) = text.get(start..end).filter(|p| !p.is_empty()) else {
            return false;
        };
        if self.is_part_of_compound(text, start, end) {
            return false;
        }
        self.is_boundary_before(&text[..start], phrase) && self.is_boundary_after(&text[end..], phrase)
    }

    fn is_boundary_before(&self, before: &str, phrase: &str) -> bool {
        let Some(prev) = before.chars().next_back() else {
            return true;
        };
        if prev.is_whitespace() || self.boundary_chars.contains(&prev) {
            return true;
        }
        if self.particles.iter().any(|p| before.ends_with(p.as_str())) {
            return true;
        }
        self.script_transitions
            && phrase
                .chars()
                .next()
                .is_some_and(|first| Script::of(first) != Script::of(prev))
    }

    fn is_boundary_after(&self, after: &str, phrase: &str) -> bool {
        let Some(next) = after.chars().next() else {
            return true;
        };
        if next.is_whitespace() || self.boundary_chars.contains(&next) {
            return true;
        }
        if self.particles.iter().any(|p| after.starts_with(p.as_str())) {
            return true;
        }
        self.script_transitions
            && phrase
                .chars()
                .next_back()
                .is_some_and(|last| Script::of(last) != Script::of(next))
    }

    /// Page furniture such as captions, navigation labels, dates and bracketed notes.
    pub fn is_metadata_phrase(&self, phrase: &str) -> bool {
        let trimmed = phrase.trim();
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            return true;
        }
        if starts_with_date(trimmed) {
            return true;
        }
        self.metadata_phrases.iter().any(|m| trimmed.contains(m.as_str()))
            || self.metadata_suffixes.iter().any(|s| trimmed.ends_with(s.as_str()))
    }

    /// Whether a phrase may be used as anchor text at all.
    pub fn is_linkable_phrase(&self, phrase: &str) -> bool {
        let trimmed = phrase.trim();
        trimmed.chars().count() >= self.min_phrase_chars.max(1)
            && !self.particles.iter().any(|p| p == trimmed)
            && !self.is_metadata_phrase(trimmed)
    }

    /// All standalone occurrences of `phrase` in `text`, as byte ranges.
    pub fn standalone_occurrences<'a>(
        &'a self,
        text: &'a str,
        phrase: &'a str,
    ) -> impl Iterator<Item = (usize, usize)> + 'a {
        text.match_indices(phrase)
            .map(move |(start, _)| (start, start + phrase.len()))
            .filter(move |&(start, end)| !phrase.is_empty() && self.is_standalone_match(text, start, end))
    }

    /// Find non-overlapping standalone matches for a set of phrases.
    ///
    /// Overlaps are resolved by preferring the longest phrase, then the highest score,
    /// then the earliest position. Each phrase text is used at most once. Only ranges for
    /// which `eligible(start, end)` holds are considered. Results are sorted by position.
    pub fn find_matches<T: Clone + PartialEq>(
        &self,
        text: &str,
        phrases: &[Phrase<T>],
        options: &MatchOptions,
        eligible: impl Fn(usize, usize) -> bool,
    ) -> Vec<PhraseMatch<T>> {
        let mut occurrences: Vec<(usize, usize, usize)> = Vec::new();
        for (index, phrase) in phrases.iter().enumerate() {
            if !self.is_linkable_phrase(&phrase.text) {
                debug!(phrase = %phrase.text, "phrase not linkable, skipping");
                continue;
            }
            occurrences.extend(
                self.standalone_occurrences(text, &phrase.text)
                    .filter(|&(start, end)| eligible(start, end))
                    .map(|(start, end)| (index, start, end)),
            );
        }

        occurrences.sort_by(|a, b| {
            let (pa, pb) = (&phrases[a.0], &phrases[b.0]);
            (b.2 - b.1)
                .cmp(&(a.2 - a.1))
                .then_with(|| pb.score.total_cmp(&pa.score))
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut used_phrases: HashSet<&str> = HashSet::new();
        let mut accepted: Vec<PhraseMatch<T>> = Vec::new();
        for (index, start, end) in occurrences {
            if options.max_matches.is_some_and(|max| accepted.len() >= max) {
                break;
            }
            let phrase = &phrases[index];
            if used_phrases.contains(phrase.text.as_str()) {
                continue;
            }
            if accepted.iter().any(|m| m.span.start < end && start < m.span.end) {
                continue;
            }
            if options.distinct_payloads && accepted.iter().any(|m| m.payload == phrase.payload) {
                continue;
            }
            used_phrases.insert(phrase.text.as_str());
            accepted.push(PhraseMatch {
                span: MatchSpan {
                    start,
                    end,
                    phrase: phrase.text.clone(),
                    confidence: phrase.score,
                },
                payload: phrase.payload.clone(),
            });
        }

        accepted.sort_by_key(|m| m.span.start);
        accepted
    }
}

/// Coarse script classes used to find word edges in unsegmented text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Latin,
    Hiragana,
    Katakana,
    Han,
    Other,
}

impl Script {
    fn of(c: char) -> Self {
        match c {
            '\u{3041}'..='\u{309F}' => Script::Hiragana,
            '\u{30A0}'..='\u{30FF}' | '\u{31F0}'..='\u{31FF}' | '\u{FF66}'..='\u{FF9F}' => {
                Script::Katakana
            }
            '\u{3400}'..='\u{4DBF}' | '\u{4E00}'..='\u{9FFF}' | '\u{F900}'..='\u{FAFF}' | '々' => {
                Script::Han
            }
            c if c.is_alphanumeric() => Script::Latin,
            _ => Script::Other,
        }
    }
}

/// `2024年5月...` or `5月3日...`.
fn starts_with_date(s: &str) -> bool {
    let digits = s.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    let rest = &s[digits..];
    (digits == 4 && rest.starts_with('年')) || (digits <= 2 && rest.starts_with('月'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_of(text: &str, phrase: &str) -> (usize, usize) {
        let start = text.find(phrase).unwrap();
        (start, start + phrase.len())
    }

    fn phrase(text: &str, score: f64, payload: &'static str) -> Phrase<&'static str> {
        Phrase {
            text: text.to_string(),
            score,
            payload,
        }
    }

    #[test]
    fn rejects_known_compound_deterministically() {
        let policy = BoundaryPolicy::default();
        let text = "スコアカードに記録する";
        let (start, end) = span_of(text, "スコア");
        assert!(policy.is_part_of_compound(text, start, end));
        assert!(!policy.is_standalone_match(text, start, end));
        assert!(!policy.is_standalone_match(text, start, end));
    }

    #[test]
    fn rejects_player_accepts_play_before_particle() {
        let policy = BoundaryPolicy::default();

        let text = "プレーヤーが上達する";
        let (start, end) = span_of(text, "プレー");
        assert!(!policy.is_standalone_match(text, start, end));

        let text = "プレーを楽しむ";
        let (start, end) = span_of(text, "プレー");
        assert!(policy.is_standalone_match(text, start, end));
    }

    #[test]
    fn compound_alignment_handles_phrase_inside_compound() {
        let policy = BoundaryPolicy::default();
        // スイング occurs at the end of バックスイング.
        let text = "正しいバックスイングを覚える";
        let (start, end) = span_of(text, "スイング");
        assert!(policy.is_part_of_compound(text, start, end));
        assert!(!policy.is_standalone_match(text, start, end));
    }

    #[test]
    fn dictionary_catches_cross_script_compounds() {
        let policy = BoundaryPolicy::default();
        let text = "近くのゴルフ場で練習";
        let (start, end) = span_of(text, "ゴルフ");
        assert!(!policy.is_standalone_match(text, start, end));

        let text = "ゴルフを始める";
        let (start, end) = span_of(text, "ゴルフ");
        assert!(policy.is_standalone_match(text, start, end));
    }

    #[test]
    fn unknown_phrase_falls_back_to_boundaries() {
        let table = PolicyTable {
            script_transitions: false,
            ..PolicyTable::default()
        };
        let policy = BoundaryPolicy::from(table);

        let text = "パーオン率を上げる";
        let (start, end) = span_of(text, "パーオン");
        // Followed by a kanji that is neither punctuation nor a particle.
        assert!(!policy.is_standalone_match(text, start, end));

        let text = "今日はパーオンが多い";
        let (start, end) = span_of(text, "パーオン");
        assert!(policy.is_standalone_match(text, start, end));
    }

    #[test]
    fn latin_words_need_word_boundaries() {
        let policy = BoundaryPolicy::default();
        let text = "Golfers love golf. Golf is fun";
        assert!(!policy.is_standalone_match(text, 0, 4));
        let start = text.rfind("Golf").unwrap();
        assert!(policy.is_standalone_match(text, start, start + 4));
    }

    #[test]
    fn invalid_ranges_are_never_standalone() {
        let policy = BoundaryPolicy::default();
        let text = "スコア";
        assert!(!policy.is_standalone_match(text, 0, 0));
        assert!(!policy.is_standalone_match(text, 0, 100));
        // Byte 1 is inside the first character.
        assert!(!policy.is_standalone_match(text, 1, 3));
    }

    #[test]
    fn metadata_phrases_are_not_linkable() {
        let policy = BoundaryPolicy::default();
        assert!(policy.is_metadata_phrase("ヒーロー画像"));
        assert!(policy.is_metadata_phrase("[PR]"));
        assert!(policy.is_metadata_phrase("2024年5月の大会"));
        assert!(policy.is_metadata_phrase("公式サイト"));
        assert!(!policy.is_metadata_phrase("ドライバーショット"));
        assert!(!policy.is_linkable_phrase("の"));
        assert!(!policy.is_linkable_phrase("から"));
        assert!(policy.is_linkable_phrase("スイング"));
    }

    #[test]
    fn overlapping_candidates_prefer_longest_then_score() {
        let policy = BoundaryPolicy::default();
        let text = "アプローチショットの練習とスイングの基本";
        let phrases = vec![
            phrase("アプローチ", 0.9, "a"),
            phrase("アプローチショット", 0.4, "b"),
            phrase("スイング", 0.3, "c"),
            phrase("スイング", 0.8, "d"),
        ];
        let matches = policy.find_matches(text, &phrases, &MatchOptions::default(), |_, _| true);
        let found: Vec<(&str, &str)> = matches
            .iter()
            .map(|m| (m.span.phrase.as_str(), m.payload))
            .collect();
        assert_eq!(found, vec![("アプローチショット", "b"), ("スイング", "d")]);

        for pair in matches.windows(2) {
            assert!(!pair[0].span.overlaps(&pair[1].span));
        }
    }

    #[test]
    fn distinct_payloads_and_eligibility() {
        let policy = BoundaryPolicy::default();
        let text = "グリップとスタンスを確認";
        let phrases = vec![phrase("グリップ", 0.5, "a"), phrase("スタンス", 0.5, "a")];

        let matches = policy.find_matches(text, &phrases, &MatchOptions::default(), |_, _| true);
        assert_eq!(matches.len(), 1);

        let options = MatchOptions {
            distinct_payloads: false,
            max_matches: None,
        };
        let matches = policy.find_matches(text, &phrases, &options, |_, _| true);
        assert_eq!(matches.len(), 2);

        let cutoff = text.find("スタンス").unwrap();
        let matches = policy.find_matches(text, &phrases, &options, |start, _| start >= cutoff);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].span.phrase, "スタンス");
    }

    #[test]
    fn first_standalone_occurrence_is_used() {
        let policy = BoundaryPolicy::default();
        let text = "スコアカードを見てスコアを数える";
        let phrases = vec![phrase("スコア", 1.0, "a")];
        let matches = policy.find_matches(text, &phrases, &MatchOptions::default(), |_, _| true);
        assert_eq!(matches.len(), 1);
        let expected = text.rfind("スコア").unwrap();
        assert_eq!(matches[0].span.start, expected);
    }

    #[test]
    fn policy_table_overrides_defaults() {
        let table: PolicyTable = serde_json::from_value(serde_json::json!({
            "compounds": {"テスト": ["テストケース", "不正"]},
            "script_transitions": false
        }))
        .unwrap();
        let policy = BoundaryPolicy::from(table);
        assert_eq!(policy.compounds_for("テスト"), ["テストケース".to_string()]);
        assert!(policy.compounds_for("スコア").is_empty());
    }
}
