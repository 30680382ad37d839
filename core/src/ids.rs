//! Deterministic identifier and hash helpers.
//!
//! All ids that must be stable across re-runs of the same build are derived
//! from sha256 over their identity fields, truncated to 16 hex chars. The
//! full digest stays available for document checksums.

use sha2::{Digest, Sha256};

use crate::types::{BuildVersion, DocId, ThemeLevel};

/// Length of truncated identifiers, in hex chars.
const SHORT_ID_LEN: usize = 16;

fn short_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..SHORT_ID_LEN].to_string()
}

/// Full sha256 checksum of the document content, hex-encoded.
pub fn content_checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Stable document id derived from its content.
pub fn document_id(content: &str) -> DocId {
    format!("doc_{}", short_digest(content))
}

/// Deterministic chunk id. Re-running the chunker with the same build
/// version produces the same ids.
pub fn chunk_id(doc_id: &str, window_start: usize, window_end: usize, build_version: &str) -> String {
    short_digest(&format!(
        "{doc_id}|{window_start}|{window_end}|{build_version}"
    ))
}

/// Sentence id: `"{doc_id}:s{n}"` with a document-wide sequence number.
pub fn sentence_id(doc_id: &str, index: usize) -> String {
    format!("{doc_id}:s{index}")
}

/// Normalize claim text for hard deduplication: lowercase, strip punctuation,
/// collapse whitespace.
pub fn normalize_claim_text(text: &str) -> String {
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

/// Hash of the normalized claim text.
pub fn claim_text_hash(text: &str) -> String {
    short_digest(&normalize_claim_text(text))
}

/// Claim id, unique per document and normalized text.
pub fn claim_id(doc_id: &str, text_hash: &str) -> String {
    format!("claim_{}", short_digest(&format!("{doc_id}|{text_hash}")))
}

/// Concept id derived from the canonical name.
pub fn concept_id(name: &str) -> String {
    format!("concept_{}", short_digest(&name.to_lowercase()))
}

/// Deterministic theme id from the sorted member ids and the level.
pub fn theme_id(member_ids: &[String], level: ThemeLevel, build_version: &BuildVersion) -> String {
    let mut sorted: Vec<&str> = member_ids.iter().map(|s| s.as_str()).collect();
    sorted.sort_unstable();
    let level_tag = match level {
        ThemeLevel::Coarse => "coarse",
        ThemeLevel::Fine => "fine",
    };
    format!(
        "theme_{}",
        short_digest(&format!("{}|{level_tag}|{build_version}", sorted.join(",")))
    )
}
