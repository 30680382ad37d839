//! Evidence hard-alignment: anchoring a claim (or the LLM's quoted span) to
//! a character range of the chunk text.
//!
//! Order of attack: verify the LLM quote verbatim, then normalized substring
//! match, then longest-common-substring repair. Anything below the match
//! ratio stays unaligned; the claim keeps sentence-level evidence only.

use tracing::debug;

/// Normalize for matching: strip punctuation, lowercase, collapse spaces.
fn normalize(text: &str) -> String {
    let stripped: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// difflib-style similarity: `2*L / (len(a)+len(b))` where `L` is the
/// longest-common-subsequence length over normalized chars.
pub fn similarity_ratio(a: &str, b: &str) -> f32 {
    let a: Vec<char> = normalize(a).chars().collect();
    let b: Vec<char> = normalize(b).chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let lcs = lcs_length(&a, &b);
    (2 * lcs) as f32 / (a.len() + b.len()) as f32
}

fn lcs_length(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut current = vec![0usize; b.len() + 1];
    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            current[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(current[j])
            };
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Longest common substring between needle and haystack, returned as
/// `(haystack_byte_start, haystack_byte_end, char_len)`.
fn longest_common_substring(needle: &str, haystack: &str) -> Option<(usize, usize, usize)> {
    let n: Vec<char> = needle.chars().collect();
    let h: Vec<(usize, char)> = haystack.char_indices().collect();
    if n.is_empty() || h.is_empty() {
        return None;
    }

    let mut best: Option<(usize, usize, usize)> = None; // (h_start_idx, h_end_idx, len)
    let mut prev = vec![0usize; n.len() + 1];
    let mut current = vec![0usize; n.len() + 1];
    for (i, &(_, hc)) in h.iter().enumerate() {
        for (j, &nc) in n.iter().enumerate() {
            current[j + 1] = if hc == nc { prev[j] + 1 } else { 0 };
            let len = current[j + 1];
            if len > best.map(|(_, _, l)| l).unwrap_or(0) {
                best = Some((i + 1 - len, i + 1, len));
            }
        }
        std::mem::swap(&mut prev, &mut current);
        current.fill(0);
    }

    best.map(|(start_idx, end_idx, len)| {
        let byte_start = h[start_idx].0;
        let byte_end = if end_idx < h.len() {
            h[end_idx].0
        } else {
            haystack.len()
        };
        (byte_start, byte_end, len)
    })
}

/// Align a claim to the chunk text.
///
/// `llm_quote` is the model's verbatim evidence quote, when it produced one.
/// Returns the byte span and the achieved match ratio; `None` when nothing
/// reaches `min_match_ratio`.
pub fn align_evidence(
    claim_text: &str,
    source_text: &str,
    llm_quote: Option<&str>,
    min_match_ratio: f32,
) -> Option<((usize, usize), f32)> {
    if claim_text.is_empty() || source_text.is_empty() {
        return None;
    }

    // 1. The quote, verbatim.
    if let Some(quote) = llm_quote.filter(|q| !q.trim().is_empty()) {
        let quote = quote.trim();
        if let Some(pos) = source_text.find(quote) {
            return Some(((pos, pos + quote.len()), 1.0));
        }
        // 2. Quote repaired via longest common substring.
        if let Some((start, end, len)) = longest_common_substring(quote, source_text) {
            if len * 10 >= quote.chars().count() * 6 {
                let ratio = similarity_ratio(quote, &source_text[start..end]);
                if ratio >= min_match_ratio {
                    debug!(ratio, "aligned llm quote via common substring");
                    return Some(((start, end), ratio));
                }
            }
        }
    }

    // 3. The claim text itself against the source.
    if let Some(pos) = source_text.find(claim_text.trim()) {
        return Some(((pos, pos + claim_text.trim().len()), 1.0));
    }
    if let Some((start, end, len)) = longest_common_substring(claim_text, source_text) {
        if len * 10 >= claim_text.chars().count() * 6 {
            let ratio = similarity_ratio(claim_text, &source_text[start..end]);
            if ratio >= min_match_ratio {
                debug!(ratio, "aligned claim text via common substring");
                return Some(((start, end), ratio));
            }
        }
    }

    debug!("evidence alignment failed");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbatim_quote_aligns_exactly() {
        let source = "Transformer 采用自注意力机制。它摒弃了循环结构。";
        let quote = "采用自注意力机制";
        let ((start, end), ratio) = align_evidence("irrelevant", source, Some(quote), 0.6).unwrap();
        assert_eq!(&source[start..end], quote);
        assert!((ratio - 1.0).abs() < 1e-6);
    }

    #[test]
    fn claim_text_fallback_when_no_quote() {
        let source = "The system caches embeddings by text hash. It avoids recomputation.";
        let ((start, end), _) =
            align_evidence("caches embeddings by text hash", source, None, 0.6).unwrap();
        assert_eq!(&source[start..end], "caches embeddings by text hash");
    }

    #[test]
    fn drifted_quote_is_repaired() {
        let source = "模型在大规模语料上进行了预训练，随后进行微调。";
        // The quote paraphrases the tail slightly.
        let result = align_evidence(
            "模型在大规模语料上进行了预训练",
            source,
            Some("在大规模语料上进行预训练"),
            0.6,
        );
        let ((start, end), ratio) = result.expect("alignment should succeed");
        assert!(ratio >= 0.6);
        assert!(source[start..end].contains("大规模语料"));
    }

    #[test]
    fn unrelated_text_fails_alignment() {
        let source = "今天天气很好，我们去公园散步。";
        assert!(align_evidence("quantum entanglement rates", source, None, 0.6).is_none());
    }

    #[test]
    fn empty_inputs_fail() {
        assert!(align_evidence("", "text", None, 0.6).is_none());
        assert!(align_evidence("claim", "", None, 0.6).is_none());
    }

    #[test]
    fn similarity_ratio_bounds() {
        assert!((similarity_ratio("abc def", "abc def") - 1.0).abs() < 1e-6);
        assert_eq!(similarity_ratio("", "abc"), 0.0);
        let mid = similarity_ratio("the cat sat", "the dog sat");
        assert!(mid > 0.4 && mid < 1.0);
    }

    #[test]
    fn similarity_ignores_punctuation_and_case() {
        assert!((similarity_ratio("Hello, World!", "hello world") - 1.0).abs() < 1e-6);
    }
}
