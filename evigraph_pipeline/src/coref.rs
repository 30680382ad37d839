//! Stage 1: coreference and alias resolution.
//!
//! Rule-based, no model calls: parenthesis aliases ("人工智能（AI）" maps AI
//! back to 人工智能), plus pronoun resolution against the nearest antecedent
//! within a bounded sentence window. The chunk-level coverage and conflict
//! scores pick one of four modes; `rewrite` substitutes canonical forms into
//! `resolved_text` such that applying the alias map to the original text
//! reproduces it.
//!
//! The resolver never fails a chunk: any internal error downgrades it to
//! `skip` with an empty alias map, and stage 2 links from the original text.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::debug;

use evigraph_config::Thresholds;
use evigraph_core::types::Chunk;

use crate::chunker::split_sentences;

/// Outcome mode of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorefMode {
    /// High coverage, low conflict: canonical forms substituted into
    /// `resolved_text`.
    Rewrite,
    /// Medium coverage: matches kept, text left untouched.
    Local,
    /// Only parenthesis aliases found.
    AliasOnly,
    /// Noise (titles, very short chunks) or resolver failure.
    Skip,
}

impl CorefMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorefMode::Rewrite => "rewrite",
            CorefMode::Local => "local",
            CorefMode::AliasOnly => "alias_only",
            CorefMode::Skip => "skip",
        }
    }
}

/// One resolved mention.
#[derive(Debug, Clone)]
pub struct CorefMatch {
    pub mention: String,
    pub antecedent: String,
    /// Distance-decayed match score.
    pub score: f32,
    pub confidence: f32,
}

/// Stage 1 output for one chunk.
#[derive(Debug, Clone)]
pub struct CorefOutcome {
    pub resolved_text: String,
    /// Surface form → canonical form. Ordered map keeps rewrites
    /// deterministic.
    pub alias_map: BTreeMap<String, String>,
    pub mode: CorefMode,
    /// Resolved mentions / total mentions.
    pub coverage: f32,
    /// Mentions with more than one viable antecedent / total mentions.
    pub conflict: f32,
    pub matches: Vec<CorefMatch>,
}

impl CorefOutcome {
    fn skip(text: &str) -> Self {
        Self {
            resolved_text: text.to_string(),
            alias_map: BTreeMap::new(),
            mode: CorefMode::Skip,
            coverage: 0.0,
            conflict: 0.0,
            matches: Vec::new(),
        }
    }
}

const PRONOUNS: &[&str] = &[
    // Chinese pronouns and short nominal mentions, longest first.
    "该方法", "该模型", "该系统", "这种方法", "这一方法", "它们", "他们", "她们", "它", "他", "她",
    // English.
    "this method", "this approach", "this model", "this system", "they", "it",
];

/// Stage 1 resolver. Stateless apart from thresholds.
pub struct CorefResolver {
    rewrite_coverage: f32,
    rewrite_conflict: f32,
    local_coverage: f32,
    antecedent_window: usize,
    min_chunk_chars: usize,
    paren_alias: Regex,
}

impl CorefResolver {
    pub fn from_thresholds(t: &Thresholds) -> Self {
        Self {
            rewrite_coverage: t.coref_rewrite_coverage,
            rewrite_conflict: t.coref_rewrite_conflict,
            local_coverage: t.coref_local_coverage,
            antecedent_window: t.coref_antecedent_window.max(1),
            min_chunk_chars: t.coref_min_chunk_chars,
            // Base term directly followed by a parenthesized short alias,
            // fullwidth or ASCII parens.
            paren_alias: Regex::new(
                r"([\p{Han}A-Za-z0-9][\p{Han}A-Za-z0-9 \-_\.]{0,40}?)\s*[（(]\s*([A-Za-z0-9][A-Za-z0-9 \-_\.]{0,29})\s*[)）]",
            )
            .expect("paren alias regex"),
        }
    }

    /// Resolve one chunk. Never fails; errors downgrade to `skip`.
    pub fn resolve(&self, chunk: &Chunk) -> CorefOutcome {
        let text = &chunk.text;
        if text.trim().chars().count() < self.min_chunk_chars || looks_like_title(text) {
            return CorefOutcome::skip(text);
        }

        let mut alias_map: BTreeMap<String, String> = BTreeMap::new();
        let mut matches: Vec<CorefMatch> = Vec::new();

        // -- Parenthesis aliases --------------------------------------------
        for caps in self.paren_alias.captures_iter(text) {
            let canonical = trim_base_term(&caps[1]);
            let surface = caps[2].trim().to_string();
            if canonical.is_empty() || surface.is_empty() || canonical == surface {
                continue;
            }
            alias_map.insert(surface.clone(), canonical.clone());
            matches.push(CorefMatch {
                mention: surface,
                antecedent: canonical,
                score: 1.0,
                confidence: 0.95,
            });
        }
        let paren_alias_count = alias_map.len();

        // -- Pronoun resolution ---------------------------------------------
        let sentences = split_sentences(text);
        let mut total_mentions = 0usize;
        let mut resolved_mentions = 0usize;
        let mut conflicted_mentions = 0usize;

        // Re-occurrences of an alias surface beyond its defining parenthesis
        // count as resolved mentions: the alias map covers them.
        for surface in alias_map.keys() {
            let occurrences = text.matches(surface.as_str()).count();
            if occurrences > 1 {
                total_mentions += occurrences - 1;
                resolved_mentions += occurrences - 1;
            }
        }

        for (sent_idx, sentence) in sentences.iter().enumerate() {
            for pronoun in pronouns_in(sentence) {
                total_mentions += 1;

                // Candidate antecedents: entity-looking terms in the bounded
                // preceding window plus the part of this sentence before the
                // pronoun. `(term, distance_in_sentences, subject_position)`.
                let window_start = sent_idx.saturating_sub(self.antecedent_window);
                let mut candidates: Vec<(String, usize, bool)> = Vec::new();
                for (d, prior) in sentences[window_start..sent_idx].iter().rev().enumerate() {
                    for (k, term) in entity_terms(prior).into_iter().enumerate() {
                        candidates.push((term, d + 1, k == 0));
                    }
                }
                if let Some(pos) = sentence.find(pronoun) {
                    for (k, term) in entity_terms(&sentence[..pos]).into_iter().enumerate() {
                        candidates.push((term, 0, k == 0));
                    }
                }

                let head = head_noun(pronoun);
                let mut scored: Vec<(String, f32)> = candidates
                    .into_iter()
                    .filter(|(term, _, _)| term != pronoun)
                    .map(|(term, distance, subject)| {
                        // Distance decay, subject-position boost, head-noun
                        // compatibility.
                        let mut score = 1.0 / (1.0 + distance as f32);
                        if subject {
                            score += 0.3;
                        }
                        if let Some(head) = head {
                            if term.ends_with(head) {
                                score += 0.3;
                            } else {
                                score -= 0.2;
                            }
                        }
                        (term, score)
                    })
                    .collect();
                scored.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                });
                // Keep each term once, at its best score.
                let mut seen_terms: std::collections::HashSet<String> =
                    std::collections::HashSet::new();
                scored.retain(|(term, _)| seen_terms.insert(term.clone()));

                let viable: Vec<&(String, f32)> =
                    scored.iter().filter(|(_, s)| *s >= 0.4).collect();
                match viable.as_slice() {
                    [] => {}
                    [(term, score)] => {
                        resolved_mentions += 1;
                        alias_map.insert(pronoun.to_string(), term.clone());
                        matches.push(CorefMatch {
                            mention: pronoun.to_string(),
                            antecedent: term.clone(),
                            score: *score,
                            confidence: (*score).min(1.0) * 0.8,
                        });
                    }
                    [(best, best_score), (_, second_score), ..] => {
                        if best_score - second_score >= 0.2 {
                            resolved_mentions += 1;
                        } else {
                            conflicted_mentions += 1;
                        }
                        alias_map.insert(pronoun.to_string(), best.clone());
                        matches.push(CorefMatch {
                            mention: pronoun.to_string(),
                            antecedent: best.clone(),
                            score: *best_score,
                            confidence: (*best_score).min(1.0) * 0.6,
                        });
                    }
                }
            }
        }

        let coverage = if total_mentions == 0 {
            if paren_alias_count > 0 {
                1.0
            } else {
                0.0
            }
        } else {
            resolved_mentions as f32 / total_mentions as f32
        };
        let conflict = if total_mentions == 0 {
            0.0
        } else {
            conflicted_mentions as f32 / total_mentions as f32
        };

        let mode = if total_mentions == 0 && paren_alias_count == 0 {
            CorefMode::Skip
        } else if total_mentions == 0 {
            CorefMode::AliasOnly
        } else if coverage >= self.rewrite_coverage && conflict <= self.rewrite_conflict {
            CorefMode::Rewrite
        } else if coverage >= self.local_coverage {
            CorefMode::Local
        } else if paren_alias_count > 0 {
            CorefMode::AliasOnly
        } else {
            CorefMode::Skip
        };

        let resolved_text = match mode {
            CorefMode::Rewrite | CorefMode::AliasOnly => apply_alias_map(text, &alias_map),
            _ => text.to_string(),
        };

        if mode == CorefMode::Skip {
            return CorefOutcome::skip(text);
        }

        debug!(
            chunk_id = %chunk.id,
            mode = mode.as_str(),
            coverage,
            conflict,
            aliases = alias_map.len(),
            "coref resolved"
        );

        CorefOutcome {
            resolved_text,
            alias_map,
            mode,
            coverage,
            conflict,
            matches,
        }
    }
}

/// Apply a surface → canonical map to text, longest surfaces first so a
/// surface embedded in another never clobbers it. ASCII surfaces replace only
/// at word boundaries.
pub fn apply_alias_map(text: &str, alias_map: &BTreeMap<String, String>) -> String {
    let mut surfaces: Vec<&String> = alias_map.keys().collect();
    surfaces.sort_by_key(|s| std::cmp::Reverse(s.chars().count()));
    let mut out = text.to_string();
    for surface in surfaces {
        out = replace_term(&out, surface, &alias_map[surface]);
    }
    out
}

fn replace_term(text: &str, surface: &str, canonical: &str) -> String {
    let ascii = surface.chars().all(|c| c.is_ascii());
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(surface) {
        let before_ok = !ascii
            || !rest[..pos]
                .chars()
                .next_back()
                .map(|c| c.is_ascii_alphanumeric())
                .unwrap_or(false);
        let after = &rest[pos + surface.len()..];
        let after_ok = !ascii
            || !after
                .chars()
                .next()
                .map(|c| c.is_ascii_alphanumeric())
                .unwrap_or(false);
        out.push_str(&rest[..pos]);
        if before_ok && after_ok {
            out.push_str(canonical);
        } else {
            out.push_str(surface);
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

fn trim_base_term(raw: &str) -> String {
    let raw = raw.trim();
    // Keep the trailing term: for CJK take the trailing Han run, for Latin
    // take the trailing capitalized words.
    if raw.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c)) {
        raw.chars()
            .rev()
            .take_while(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    } else {
        let words: Vec<&str> = raw.split_whitespace().collect();
        let start = words
            .iter()
            .rposition(|w| !w.chars().next().map(char::is_uppercase).unwrap_or(false))
            .map(|i| i + 1)
            .unwrap_or(0);
        words[start..].join(" ")
    }
}

fn looks_like_title(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.chars().count() < 60
        && !trimmed.ends_with(['。', '.', '!', '?', '！', '？'])
        && trimmed.lines().count() == 1
}

fn pronouns_in(sentence: &str) -> Vec<&'static str> {
    let mut found = Vec::new();
    let mut masked = sentence.to_string();
    for pronoun in PRONOUNS {
        // Count non-overlapping occurrences; mask so "它们" never also
        // counts as "它".
        while let Some(pos) = masked.find(pronoun) {
            if pronoun.chars().all(|c| c.is_ascii()) {
                let before = masked[..pos].chars().next_back();
                let after = masked[pos + pronoun.len()..].chars().next();
                let bounded = !before.map(|c| c.is_ascii_alphanumeric()).unwrap_or(false)
                    && !after.map(|c| c.is_ascii_alphanumeric()).unwrap_or(false);
                if !bounded {
                    masked.replace_range(pos..pos + pronoun.len(), &"#".repeat(pronoun.len()));
                    continue;
                }
            }
            found.push(*pronoun);
            masked.replace_range(pos..pos + pronoun.len(), &"#".repeat(pronoun.len()));
        }
    }
    found
}

fn head_noun(pronoun: &str) -> Option<&'static str> {
    match pronoun {
        "该方法" | "这种方法" | "这一方法" | "this method" => Some("方法"),
        "该模型" | "this model" => Some("模型"),
        "该系统" | "this system" => Some("系统"),
        _ => None,
    }
}

/// Function-word characters that break a Han run into noun-phrase pieces.
const HAN_STOP: &[char] = &[
    '了', '的', '是', '在', '与', '和', '被', '都', '很', '更', '地', '得', '而', '也', '就',
    '对', '从', '把', '之', '其', '这', '那', '它', '他', '她', '们',
];

/// Entity-looking terms in a sentence fragment, in text order: Latin proper
/// nouns and CJK noun-phrase pieces (Han runs split at function words).
/// Stage 2 uses the same heuristics so antecedents stay linkable.
pub(crate) fn entity_terms(fragment: &str) -> Vec<String> {
    let proper = Regex::new(r"[A-Z][A-Za-z0-9\-]{2,}").unwrap();
    let han = Regex::new(r"\p{Han}{2,}").unwrap();

    let mut found: Vec<(usize, String)> = Vec::new();
    for m in proper.find_iter(fragment) {
        found.push((m.start(), m.as_str().to_string()));
    }
    for m in han.find_iter(fragment) {
        let mut piece = String::new();
        let mut piece_start = m.start();
        for (off, c) in m.as_str().char_indices() {
            if HAN_STOP.contains(&c) {
                if (2..=8).contains(&piece.chars().count()) {
                    found.push((piece_start, piece.clone()));
                }
                piece.clear();
                piece_start = m.start() + off + c.len_utf8();
            } else {
                piece.push(c);
            }
        }
        if (2..=8).contains(&piece.chars().count()) {
            found.push((piece_start, piece));
        }
    }
    found.sort_by_key(|(pos, _)| *pos);
    let mut terms: Vec<String> = Vec::new();
    for (_, term) in found {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}
