//! Ingest job scheduler.
//!
//! One tokio task per document; distinct documents ingest concurrently while
//! each job stays sequential inside. Every job carries a cancellation token
//! polled at the pipeline's suspension points, and its registry entry tracks
//! stage, per-stage counts and the error taxonomy kind on failure.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use evigraph_core::types::DocumentKind;
use evigraph_pipeline::chunker::ParsedDocument;
use evigraph_pipeline::ingest::{IngestOrchestrator, StageCounts};
use evigraph_pipeline::{PipelineContext, PipelineError};

/// Lifecycle of one ingest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Registry entry for one job.
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub state: JobState,
    pub stage: &'static str,
    pub counts: StageCounts,
    pub doc_id: Option<String>,
    pub build_version: Option<String>,
    /// `(taxonomy_kind, human_message)`.
    pub error: Option<(String, String)>,
    pub cancel: CancellationToken,
}

/// Shared job registry.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<Uuid, JobEntry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<JobEntry> {
        self.jobs.read().unwrap().get(id).cloned()
    }

    /// Request cancellation. Returns whether the job existed and was still
    /// cancellable.
    pub fn cancel(&self, id: &Uuid) -> bool {
        let jobs = self.jobs.read().unwrap();
        match jobs.get(id) {
            Some(entry) if matches!(entry.state, JobState::Queued | JobState::Running) => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn update(&self, id: Uuid, mutate: impl FnOnce(&mut JobEntry)) {
        if let Some(entry) = self.jobs.write().unwrap().get_mut(&id) {
            mutate(entry);
        }
    }

    /// Spawn an ingest job. The context's cancellation token is replaced by
    /// the job's own.
    pub fn spawn_ingest(
        &self,
        base_ctx: PipelineContext,
        parsed: ParsedDocument,
        kind: DocumentKind,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        self.jobs.write().unwrap().insert(
            id,
            JobEntry {
                state: JobState::Queued,
                stage: "queued",
                counts: StageCounts::default(),
                doc_id: None,
                build_version: None,
                error: None,
                cancel: cancel.clone(),
            },
        );

        let registry = self.clone();
        let ctx = PipelineContext {
            cancel: cancel.clone(),
            ..base_ctx
        };
        tokio::spawn(async move {
            registry.update(id, |e| e.state = JobState::Running);

            let progress_registry = registry.clone();
            let orchestrator =
                IngestOrchestrator::new(ctx).with_progress(Arc::new(move |stage, counts| {
                    let counts = counts.clone();
                    progress_registry.update(id, move |e| {
                        e.stage = stage;
                        e.counts = counts;
                    });
                }));

            match orchestrator.ingest(parsed, kind).await {
                Ok(report) => {
                    info!(job = %id, doc = %report.doc_id, "ingest job succeeded");
                    registry.update(id, move |e| {
                        e.state = JobState::Succeeded;
                        e.stage = "done";
                        e.doc_id = Some(report.doc_id.clone());
                        e.build_version = Some(report.build_version.clone());
                        e.counts = report.counts.clone();
                    });
                }
                Err(PipelineError::Cancelled) => {
                    warn!(job = %id, "ingest job cancelled");
                    registry.update(id, |e| {
                        e.state = JobState::Cancelled;
                        e.error = Some(("cancelled".into(), "job cancelled".into()));
                    });
                }
                Err(e) => {
                    warn!(job = %id, error = %e, "ingest job failed");
                    registry.update(id, move |e2| {
                        e2.state = JobState::Failed;
                        e2.error = Some((e.kind().to_string(), e.to_string()));
                    });
                }
            }
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockEmbedder, MockLlm};
    use evigraph_config::{EvigraphConfig, GovernanceConfig};
    use evigraph_core::{AliasDictionary, MemoryGraph};
    use std::time::Duration;

    fn ctx(store: Arc<MemoryGraph>) -> PipelineContext {
        PipelineContext {
            config: Arc::new(EvigraphConfig::default()),
            governance: Arc::new(GovernanceConfig::default()),
            llm: Arc::new(MockLlm),
            embedder: Arc::new(MockEmbedder::new(8)),
            store,
            aliases: AliasDictionary::new(),
            cancel: CancellationToken::new(),
        }
    }

    async fn wait_terminal(registry: &JobRegistry, id: Uuid) -> JobEntry {
        for _ in 0..200 {
            if let Some(entry) = registry.get(&id) {
                if !matches!(entry.state, JobState::Queued | JobState::Running) {
                    return entry;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn job_runs_to_success_and_reports_counts() {
        let registry = JobRegistry::new();
        let store = Arc::new(MemoryGraph::new());
        let id = registry.spawn_ingest(
            ctx(store),
            ParsedDocument::from_text(
                "Evigraph builds evidence graphs from documents every day. \
                 The ingestion pipeline runs eight sequential stages in order.",
            ),
            DocumentKind::PlainText,
        );
        let entry = wait_terminal(&registry, id).await;
        assert_eq!(entry.state, JobState::Succeeded);
        assert!(entry.counts.chunks >= 1);
        assert!(entry.doc_id.is_some());
        assert!(entry.build_version.is_some());
    }

    #[tokio::test]
    async fn empty_document_fails_with_input_kind() {
        let registry = JobRegistry::new();
        let id = registry.spawn_ingest(
            ctx(Arc::new(MemoryGraph::new())),
            ParsedDocument::from_text("  "),
            DocumentKind::PlainText,
        );
        let entry = wait_terminal(&registry, id).await;
        assert_eq!(entry.state, JobState::Failed);
        assert_eq!(entry.error.unwrap().0, "input");
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_false() {
        let registry = JobRegistry::new();
        assert!(!registry.cancel(&Uuid::new_v4()));
    }
}
