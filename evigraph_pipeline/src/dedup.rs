//! Claim deduplication: hash-based hard dedup, then greedy semantic soft
//! clustering.
//!
//! Duplicates are not discarded — they become redirect shells whose
//! `canonical_id` points at the surviving claim, with chain length capped at
//! one by construction. Evidence (sentence ids, spans) is unioned into the
//! canonical claim so provenance survives the merge.

use std::collections::HashMap;

use tracing::{debug, info};

use evigraph_core::store::cosine;
use evigraph_core::types::{Claim, ClaimId};

/// Outcome of deduplicating one document's claims.
#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// Surviving claims, `canonical_id == None`.
    pub canonical: Vec<Claim>,
    /// Redirect shells pointing at a canonical claim.
    pub redirects: Vec<Claim>,
    /// canonical id → merged-away ids.
    pub merged: HashMap<ClaimId, Vec<ClaimId>>,
}

impl DedupOutcome {
    /// Union the duplicate's evidence into the canonical claim.
    fn union_into(&mut self, canonical_idx: usize, duplicate: &Claim) {
        let canonical = &mut self.canonical[canonical_idx];
        for sid in &duplicate.sentence_ids {
            if !canonical.sentence_ids.contains(sid) {
                canonical.sentence_ids.push(sid.clone());
            }
        }
        match (canonical.evidence_span, duplicate.evidence_span) {
            (Some((cs, ce)), Some((ds, de))) => {
                canonical.evidence_span = Some((cs.min(ds), ce.max(de)));
            }
            (None, Some(span)) => canonical.evidence_span = Some(span),
            _ => {}
        }
        if duplicate.confidence > canonical.confidence {
            canonical.confidence = duplicate.confidence;
        }
    }

    fn absorb(&mut self, canonical_idx: usize, mut duplicate: Claim) {
        self.union_into(canonical_idx, &duplicate);
        let canonical_id = self.canonical[canonical_idx].id.clone();
        // The same identity extracted twice (another chunk, another window)
        // is one claim, not a redirect pair.
        if duplicate.id == canonical_id {
            return;
        }
        duplicate.canonical_id = Some(canonical_id.clone());
        self.merged
            .entry(canonical_id)
            .or_default()
            .push(duplicate.id.clone());
        self.redirects.push(duplicate);
    }
}

/// Hard dedup on `normalized_text_hash`, first occurrence wins.
pub fn hard_deduplicate(claims: Vec<Claim>) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    let mut by_hash: HashMap<String, usize> = HashMap::new();

    let total = claims.len();
    for claim in claims {
        match by_hash.get(&claim.normalized_text_hash) {
            Some(&idx) => {
                debug!(duplicate = %claim.id, canonical = %outcome.canonical[idx].id, "hard dedup");
                outcome.absorb(idx, claim);
            }
            None => {
                by_hash.insert(claim.normalized_text_hash.clone(), outcome.canonical.len());
                outcome.canonical.push(claim);
            }
        }
    }
    if !outcome.redirects.is_empty() {
        info!(
            total,
            kept = outcome.canonical.len(),
            merged = outcome.redirects.len(),
            "hard deduplication"
        );
    }
    outcome
}

/// Greedy soft clustering by embedding cosine. Claims without embeddings
/// stay singletons. The highest-confidence member of a cluster survives.
pub fn soft_cluster(claims: Vec<Claim>, threshold: f32) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    if claims.len() <= 1 {
        outcome.canonical = claims;
        return outcome;
    }

    let mut clusters: Vec<Vec<Claim>> = Vec::new();
    'next_claim: for claim in claims {
        if let Some(embedding) = claim.embedding.as_deref() {
            for cluster in clusters.iter_mut() {
                let representative = &cluster[0];
                if let Some(rep_embedding) = representative.embedding.as_deref() {
                    if cosine(embedding, rep_embedding) >= threshold {
                        cluster.push(claim);
                        continue 'next_claim;
                    }
                }
            }
        }
        clusters.push(vec![claim]);
    }

    for mut cluster in clusters {
        // Highest confidence survives; ties keep the earliest.
        let best = cluster
            .iter()
            .enumerate()
            .max_by(|a, b| {
                a.1.confidence
                    .partial_cmp(&b.1.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        let representative = cluster.remove(best);
        let idx = outcome.canonical.len();
        outcome.canonical.push(representative);
        for member in cluster {
            outcome.absorb(idx, member);
        }
    }
    outcome
}

/// Full dedup: hard pass, then optional soft clustering over the survivors.
/// Redirect chains never form: shells always point at a claim that survived
/// every pass.
pub fn deduplicate(claims: Vec<Claim>, soft_threshold: Option<f32>) -> DedupOutcome {
    let hard = hard_deduplicate(claims);
    let Some(threshold) = soft_threshold else {
        return hard;
    };

    let mut soft = soft_cluster(hard.canonical, threshold);

    // Re-target hard-pass shells whose canonical was itself merged away.
    let soft_redirect: HashMap<ClaimId, ClaimId> = soft
        .redirects
        .iter()
        .filter_map(|r| r.canonical_id.clone().map(|c| (r.id.clone(), c)))
        .collect();
    for mut shell in hard.redirects {
        if let Some(target) = shell.canonical_id.as_ref().and_then(|c| soft_redirect.get(c)) {
            shell.canonical_id = Some(target.clone());
        }
        soft.redirects.push(shell);
    }
    for (canonical, merged) in hard.merged {
        let target = soft_redirect.get(&canonical).cloned().unwrap_or(canonical);
        soft.merged.entry(target).or_default().extend(merged);
    }
    soft
}
