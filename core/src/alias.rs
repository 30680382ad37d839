//! Alias dictionary: the surface-form → canonical-concept side index.
//!
//! Entries are append-only and resolution is most-recent-highest-confidence
//! wins. Stage 8 feedback can add negative entries that block a surface form
//! from resolving to a concept within one document's context.
//!
//! Readers take an immutable [`AliasSnapshot`]; writers publish a new
//! snapshot copy-on-write, so a running ingestion keeps seeing a consistent
//! dictionary while feedback lands for the next build.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::DocId;

/// One alias dictionary row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasEntry {
    pub surface_form: String,
    /// Canonical concept name this surface resolves to.
    pub canonical: String,
    /// When set, the alias only applies within this document.
    #[serde(default)]
    pub doc_id: Option<DocId>,
    pub confidence: f32,
    /// Negative entries block resolution instead of providing it.
    #[serde(default)]
    pub negative: bool,
    pub created_at: DateTime<Utc>,
}

/// Immutable view of the dictionary at one point in time.
#[derive(Debug, Default, Clone)]
pub struct AliasSnapshot {
    /// Lowercased surface form -> entries, in insertion order.
    entries: HashMap<String, Vec<AliasEntry>>,
    version: u64,
}

impl AliasSnapshot {
    /// Monotonic snapshot version, bumped on every publish.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a surface form to its canonical concept name.
    ///
    /// Document-scoped entries take precedence over global ones; among
    /// applicable entries the most recent one with the highest confidence
    /// wins. A matching negative entry for the winning canonical blocks the
    /// resolution entirely.
    pub fn resolve(&self, surface: &str, doc_id: Option<&str>) -> Option<String> {
        let rows = self.entries.get(&surface.trim().to_lowercase())?;
        let applicable = |e: &&AliasEntry| match (&e.doc_id, doc_id) {
            (None, _) => true,
            (Some(scope), Some(d)) => scope == d,
            (Some(_), None) => false,
        };

        let winner = rows
            .iter()
            .filter(applicable)
            .filter(|e| !e.negative)
            .max_by(|a, b| {
                // Doc-scoped beats global, then confidence, then recency.
                let scope = |e: &AliasEntry| e.doc_id.is_some() as u8;
                scope(a)
                    .cmp(&scope(b))
                    .then(
                        a.confidence
                            .partial_cmp(&b.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(a.created_at.cmp(&b.created_at))
            })?;

        let blocked = rows
            .iter()
            .filter(applicable)
            .any(|e| e.negative && e.canonical == winner.canonical);
        if blocked {
            return None;
        }
        Some(winner.canonical.clone())
    }

    /// Whether a negative entry forbids linking this surface form to the
    /// given canonical name in this document's context.
    pub fn is_blocked(&self, surface: &str, canonical: &str, doc_id: Option<&str>) -> bool {
        let Some(rows) = self.entries.get(&surface.trim().to_lowercase()) else {
            return false;
        };
        rows.iter().any(|e| {
            e.negative
                && e.canonical == canonical
                && match (&e.doc_id, doc_id) {
                    (None, _) => true,
                    (Some(scope), Some(d)) => scope == d,
                    (Some(_), None) => false,
                }
        })
    }
}

/// Versioned handle to the dictionary. Cheap to clone; all clones observe
/// the same published snapshots.
#[derive(Debug, Default, Clone)]
pub struct AliasDictionary {
    current: Arc<RwLock<Arc<AliasSnapshot>>>,
}

impl AliasDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<AliasSnapshot> {
        self.current.read().unwrap().clone()
    }

    /// Append entries and publish a new snapshot. Existing snapshots held by
    /// in-flight ingestions are unaffected.
    pub fn publish(&self, new_entries: Vec<AliasEntry>) {
        if new_entries.is_empty() {
            return;
        }
        let mut guard = self.current.write().unwrap();
        let mut next = AliasSnapshot {
            entries: guard.entries.clone(),
            version: guard.version + 1,
        };
        for entry in new_entries {
            next.entries
                .entry(entry.surface_form.trim().to_lowercase())
                .or_default()
                .push(entry);
        }
        *guard = Arc::new(next);
    }

    /// Rewrite the canonical target of every entry pointing at `from` so it
    /// points at `to`. Used by feedback merges.
    pub fn redirect_canonical(&self, from: &str, to: &str) {
        let mut guard = self.current.write().unwrap();
        let mut entries = guard.entries.clone();
        for rows in entries.values_mut() {
            for row in rows.iter_mut() {
                if row.canonical == from {
                    row.canonical = to.to_string();
                }
            }
        }
        *guard = Arc::new(AliasSnapshot {
            entries,
            version: guard.version + 1,
        });
    }
}

/// Convenience constructor for a positive, global alias entry.
pub fn alias(surface: &str, canonical: &str, confidence: f32) -> AliasEntry {
    AliasEntry {
        surface_form: surface.to_string(),
        canonical: canonical.to_string(),
        doc_id: None,
        confidence,
        negative: false,
        created_at: Utc::now(),
    }
}
