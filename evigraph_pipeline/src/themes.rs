//! Stage 4: topic-community detection and summarization.
//!
//! Projects the concepts touched by a document (plus their whitelisted
//! concept-concept edges, plus claims joined through shared-concept
//! co-membership) into a weighted graph, runs Leiden, and turns each
//! community above the minimum size into a Theme node: LLM label and
//! summary over the top-degree members, TF-IDF keywords, deterministic id.
//! Coarse themes come from the full projection; fine themes re-cluster
//! inside each coarse community.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tracing::{debug, info_span, warn};

use evigraph_core::community::{detect_communities, CommunityConfig};
use evigraph_core::ids;
use evigraph_core::types::{
    BuildVersion, Claim, Concept, Edge, EdgeKind, NodeBody, NodeLabel, Theme, ThemeLevel,
};
use evigraph_core::GraphStore;

use evigraph_config::prompts::fill;

use crate::error::PipelineError;
use crate::{ChatMessage, PipelineContext};

#[derive(Debug, Deserialize)]
struct RawSummary {
    label: String,
    summary: String,
}

/// A built theme plus its membership edges, ready for stage 6.
#[derive(Debug)]
pub struct BuiltTheme {
    pub theme: Theme,
    pub member_edges: Vec<Edge>,
}

/// Stage 4 builder.
pub struct ThemeBuilder<'a> {
    ctx: &'a PipelineContext,
}

impl<'a> ThemeBuilder<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self { ctx }
    }

    /// Build coarse (and nested fine) themes for a document, or for the
    /// whole graph when `doc_id` is `None`.
    pub async fn build(
        &self,
        doc_id: Option<&str>,
        build_version: &BuildVersion,
    ) -> Result<Vec<BuiltTheme>, PipelineError> {
        let span = info_span!("evigraph.themes", doc = doc_id.unwrap_or("<all>"));
        let _guard = span.enter();

        if !self.ctx.config.features.enable_community_detection {
            return Ok(Vec::new());
        }

        let (concepts, claims) = self.collect_members(doc_id)?;
        if concepts.is_empty() {
            return Ok(Vec::new());
        }
        let projection = self.project(&concepts, &claims, build_version)?;
        if projection.is_empty() {
            return Ok(Vec::new());
        }

        let min_size = self.ctx.governance.thresholds.theme_min_community_size;
        let coarse = detect_communities(&projection, &CommunityConfig::default())
            .map_err(PipelineError::store)?;

        let mut built = Vec::new();
        for (community_id, members) in &coarse.communities {
            if members.len() < min_size {
                continue;
            }
            let theme = self
                .materialize(
                    members,
                    *community_id,
                    ThemeLevel::Coarse,
                    None,
                    &concepts,
                    &claims,
                    build_version,
                )
                .await?;
            let parent_id = theme.theme.id.clone();

            // Fine pass: re-cluster within this community at a higher
            // resolution.
            let member_set: HashSet<&str> = members.iter().map(|m| m.as_str()).collect();
            let inner: Vec<(String, String, f32)> = projection
                .iter()
                .filter(|(s, t, _)| member_set.contains(s.as_str()) && member_set.contains(t.as_str()))
                .cloned()
                .collect();
            let fine_config = CommunityConfig {
                resolution: 1.8,
                ..CommunityConfig::default()
            };
            if let Ok(fine) = detect_communities(&inner, &fine_config) {
                for (fine_id, fine_members) in &fine.communities {
                    if fine_members.len() < min_size || fine_members.len() == members.len() {
                        continue;
                    }
                    let fine_theme = self
                        .materialize(
                            fine_members,
                            *fine_id,
                            ThemeLevel::Fine,
                            Some(parent_id.clone()),
                            &concepts,
                            &claims,
                            build_version,
                        )
                        .await?;
                    built.push(fine_theme);
                }
            }
            built.push(theme);
        }

        debug!(themes = built.len(), "theme building complete");
        Ok(built)
    }

    /// Concepts touched by the document (via MENTIONS from its chunks or the
    /// document node) and the document's claims.
    fn collect_members(
        &self,
        doc_id: Option<&str>,
    ) -> Result<(HashMap<String, Concept>, HashMap<String, Claim>), PipelineError> {
        let store = &self.ctx.store;
        let mut concepts: HashMap<String, Concept> = HashMap::new();
        let mut claims: HashMap<String, Claim> = HashMap::new();

        match doc_id {
            None => {
                for node in store
                    .nodes_with_label(NodeLabel::Concept)
                    .map_err(PipelineError::store)?
                {
                    if let NodeBody::Concept(c) = node {
                        concepts.insert(c.id.clone(), c);
                    }
                }
                for node in store
                    .nodes_with_label(NodeLabel::Claim)
                    .map_err(PipelineError::store)?
                {
                    if let NodeBody::Claim(c) = node {
                        if c.canonical_id.is_none() {
                            claims.insert(c.id.clone(), c);
                        }
                    }
                }
            }
            Some(doc) => {
                let chunk_ids: Vec<String> = store
                    .nodes_with_label(NodeLabel::Chunk)
                    .map_err(PipelineError::store)?
                    .into_iter()
                    .filter_map(|n| match n {
                        NodeBody::Chunk(c) if c.doc_id == doc => Some(c.id),
                        _ => None,
                    })
                    .collect();
                for source in chunk_ids.iter().map(String::as_str).chain([doc]) {
                    for edge in store.edges_from(source).map_err(PipelineError::store)? {
                        match edge.kind {
                            EdgeKind::Mentions => {
                                if let Some(NodeBody::Concept(c)) =
                                    store.get_node(&edge.dst).map_err(PipelineError::store)?
                                {
                                    concepts.insert(c.id.clone(), c);
                                }
                            }
                            EdgeKind::ContainsClaim => {
                                if let Some(NodeBody::Claim(c)) =
                                    store.get_node(&edge.dst).map_err(PipelineError::store)?
                                {
                                    if c.canonical_id.is_none() {
                                        claims.insert(c.id.clone(), c);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        Ok((concepts, claims))
    }

    /// Weighted undirected projection: whitelisted concept-concept edges,
    /// plus claim↔concept co-membership through shared chunks.
    ///
    /// Concept edges stamped with the current build are excluded: within one
    /// ingestion they are written only after theme detection, so a re-run of
    /// the same build version must not see them either.
    fn project(
        &self,
        concepts: &HashMap<String, Concept>,
        claims: &HashMap<String, Claim>,
        build_version: &BuildVersion,
    ) -> Result<Vec<(String, String, f32)>, PipelineError> {
        let store = &self.ctx.store;
        let mut edges: Vec<(String, String, f32)> = Vec::new();

        for concept_id in concepts.keys() {
            for edge in store.edges_from(concept_id).map_err(PipelineError::store)? {
                if let EdgeKind::Concept(_) = edge.kind {
                    if edge.build_version == *build_version {
                        continue;
                    }
                    if concepts.contains_key(&edge.dst) {
                        edges.push((edge.src, edge.dst, edge.confidence.max(0.1)));
                    }
                }
            }
        }

        // Claims join through the concepts their chunk mentions.
        for claim in claims.values() {
            for edge in store
                .edges_from(&claim.chunk_id)
                .map_err(PipelineError::store)?
            {
                if edge.kind == EdgeKind::Mentions && concepts.contains_key(&edge.dst) {
                    edges.push((claim.id.clone(), edge.dst, 0.5));
                }
            }
        }
        Ok(edges)
    }

    #[allow(clippy::too_many_arguments)]
    async fn materialize(
        &self,
        members: &[String],
        community_id: u64,
        level: ThemeLevel,
        parent_theme_id: Option<String>,
        concepts: &HashMap<String, Concept>,
        claims: &HashMap<String, Claim>,
        build_version: &BuildVersion,
    ) -> Result<BuiltTheme, PipelineError> {
        let concept_ids: Vec<String> = members
            .iter()
            .filter(|m| concepts.contains_key(*m))
            .cloned()
            .collect();
        let claim_ids: Vec<String> = members
            .iter()
            .filter(|m| claims.contains_key(*m))
            .cloned()
            .collect();

        // Top-degree concepts feed the prompt.
        let mut ranked: Vec<(&String, usize)> = Vec::new();
        for id in &concept_ids {
            let degree = self
                .ctx
                .store
                .node_degree(id)
                .map_err(PipelineError::store)?;
            ranked.push((id, degree));
        }
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let top_concepts: Vec<&Concept> = ranked
            .iter()
            .take(self.ctx.governance.thresholds.theme_label_members)
            .filter_map(|(id, _)| concepts.get(*id))
            .collect();

        let member_texts: Vec<String> = concept_ids
            .iter()
            .filter_map(|id| concepts.get(id))
            .map(|c| {
                format!(
                    "{} {}",
                    c.name,
                    c.description.clone().unwrap_or_default()
                )
            })
            .chain(claim_ids.iter().filter_map(|id| claims.get(id)).map(|c| c.text.clone()))
            .collect();
        let keywords = tf_idf_keywords(&member_texts, 8);

        let (label, summary) = self
            .summarize(&top_concepts, &claim_ids, claims, &keywords)
            .await;

        let theme_id = {
            let mut all_members = concept_ids.clone();
            all_members.extend(claim_ids.clone());
            ids::theme_id(&all_members, level, build_version)
        };

        self.ctx.checkpoint()?;
        let embedding = self
            .ctx
            .embedder
            .embed(&[format!("{label}. {summary}")])
            .await
            .ok()
            .and_then(|mut v| if v.is_empty() { None } else { Some(v.remove(0)) });

        let theme = Theme {
            id: theme_id.clone(),
            label,
            summary,
            level,
            keywords,
            community_id,
            member_count: concept_ids.len() + claim_ids.len(),
            concept_ids: concept_ids.clone(),
            claim_ids: claim_ids.clone(),
            parent_theme_id,
            embedding,
            build_version: build_version.clone(),
        };

        let member_edges = concept_ids
            .iter()
            .chain(claim_ids.iter())
            .map(|member| Edge {
                src: member.clone(),
                kind: EdgeKind::BelongsToTheme,
                dst: theme_id.clone(),
                confidence: 1.0,
                review: false,
                mention: None,
                provenance: None,
                build_version: build_version.clone(),
            })
            .collect();

        Ok(BuiltTheme { theme, member_edges })
    }

    /// LLM label and summary; keyword fallback when the call or the parse
    /// fails.
    async fn summarize(
        &self,
        top_concepts: &[&Concept],
        claim_ids: &[String],
        claims: &HashMap<String, Claim>,
        keywords: &[String],
    ) -> (String, String) {
        let concept_lines = top_concepts
            .iter()
            .map(|c| {
                format!(
                    "- {}: {}",
                    c.name,
                    c.description.clone().unwrap_or_else(|| "(no description)".into())
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let claim_lines = claim_ids
            .iter()
            .take(5)
            .filter_map(|id| claims.get(id))
            .map(|c| format!("- {}", c.text))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = fill(
            &self.ctx.governance.prompts.theme_summary,
            &[("concepts", concept_lines.as_str()), ("claims", claim_lines.as_str())],
        );
        let request = self.ctx.chat(vec![
            ChatMessage::system("You label topical communities. Respond with strict JSON only."),
            ChatMessage::user(prompt),
        ]);

        match self.ctx.llm.chat_completion(request).await {
            Ok(response) => {
                if let Some(json) = crate::claims::extract_json_object(&response.text) {
                    if let Ok(raw) = serde_json::from_str::<RawSummary>(&json) {
                        if !raw.label.trim().is_empty() {
                            return (raw.label.trim().to_string(), raw.summary.trim().to_string());
                        }
                    }
                }
                warn!("theme summary response unusable, falling back to keywords");
            }
            Err(e) => warn!(error = %e, "theme summary call failed, falling back to keywords"),
        }

        let label = if keywords.is_empty() {
            top_concepts
                .first()
                .map(|c| c.name.clone())
                .unwrap_or_else(|| "Unlabeled theme".into())
        } else {
            keywords.iter().take(3).cloned().collect::<Vec<_>>().join(" / ")
        };
        let summary = format!(
            "Community of {} members around: {}",
            top_concepts.len(),
            keywords.join(", ")
        );
        (label, summary)
    }
}

/// Top-k TF-IDF tokens across member texts. Tokenization is whitespace plus
/// CJK bigrams; single documents degrade to term frequency.
pub fn tf_idf_keywords(texts: &[String], top_k: usize) -> Vec<String> {
    if texts.is_empty() {
        return Vec::new();
    }
    let tokenize = |text: &str| -> Vec<String> {
        let mut tokens = Vec::new();
        for word in text.split_whitespace() {
            let word: String = word
                .chars()
                .filter(|c| c.is_alphanumeric() || ('\u{4e00}'..='\u{9fff}').contains(c))
                .collect();
            if word.chars().all(|c| c.is_ascii()) {
                if word.chars().count() >= 3 {
                    tokens.push(word.to_lowercase());
                }
            } else {
                // CJK bigrams.
                let chars: Vec<char> = word.chars().collect();
                for pair in chars.windows(2) {
                    tokens.push(pair.iter().collect());
                }
            }
        }
        tokens
    };

    let docs: Vec<Vec<String>> = texts.iter().map(|t| tokenize(t)).collect();
    let n_docs = docs.len() as f32;

    let mut document_frequency: HashMap<&String, usize> = HashMap::new();
    for doc in &docs {
        let unique: HashSet<&String> = doc.iter().collect();
        for token in unique {
            *document_frequency.entry(token).or_default() += 1;
        }
    }

    let mut scores: HashMap<&String, f32> = HashMap::new();
    for doc in &docs {
        let mut tf: HashMap<&String, usize> = HashMap::new();
        for token in doc {
            *tf.entry(token).or_default() += 1;
        }
        for (token, count) in tf {
            let df = document_frequency[token] as f32;
            let idf = (n_docs / df).ln() + 1.0;
            *scores.entry(token).or_default() += count as f32 * idf;
        }
    }

    let mut ranked: Vec<(&String, f32)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    ranked.into_iter().take(top_k).map(|(t, _)| t.clone()).collect()
}
