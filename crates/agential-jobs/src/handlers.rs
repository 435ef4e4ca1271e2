//! Handlers for each job kind.
//!
//! Summaries go through the provider router, index writes through the
//! consistency manager. OCR and knowledge-graph linking are delegated to an
//! external `ProcessingStage`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use agential_core::defaults::{SUMMARY_MAX_TOKENS, SUMMARY_TEMPERATURE};
use agential_core::{
    CanonicalId, ContentHash, IndexDocument, InferenceRequest, Job, JobKind, Result, UpsertResult,
};
use agential_inference::ProviderRouter;
use agential_search::ConsistencyManager;

use crate::handler::{JobContext, JobHandler, JobResult};

/// Characters of source content included in a summary prompt.
pub const SUMMARY_INPUT_CHARS: usize = 4000;

// =============================================================================
// SUMMARIZE
// =============================================================================

#[derive(Debug, Deserialize)]
struct SummarizePayload {
    #[serde(alias = "text", alias = "body")]
    content: String,
    #[serde(default)]
    title: Option<String>,
}

/// Summarizes research content through the provider router.
///
/// The summary text becomes the job's `result_ref`.
pub struct SummarizeHandler {
    router: Arc<ProviderRouter>,
}

impl SummarizeHandler {
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self { router }
    }

    fn prompt(payload: &SummarizePayload) -> String {
        let content: String = payload.content.chars().take(SUMMARY_INPUT_CHARS).collect();
        let heading = payload
            .title
            .as_deref()
            .map(|t| format!("Title: {}\n\n", t))
            .unwrap_or_default();
        format!(
            "Please provide a concise summary of the following research content.\n\
             Focus on the main contributions, methodology, and key findings.\n\n\
             {}Content:\n{}\n\nSummary:",
            heading, content
        )
    }
}

#[async_trait]
impl JobHandler for SummarizeHandler {
    fn kind(&self) -> JobKind {
        JobKind::Summarize
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let payload: SummarizePayload = match ctx.payload_as() {
            Ok(p) => p,
            Err(e) => return e.into(),
        };
        if payload.content.trim().is_empty() {
            return JobResult::Fatal("nothing to summarize: content is empty".into());
        }

        let request = InferenceRequest::prompt(Self::prompt(&payload))
            .with_max_tokens(SUMMARY_MAX_TOKENS)
            .with_temperature(SUMMARY_TEMPERATURE);

        match self.router.call(&request).await {
            Ok(response) => {
                let summary = response.content.trim();
                if summary.is_empty() {
                    warn!(
                        job_id = %ctx.job.id,
                        provider = %response.provider,
                        "Provider returned an empty summary"
                    );
                    return JobResult::Retry(format!("{} returned an empty summary", response.provider));
                }
                debug!(
                    job_id = %ctx.job.id,
                    provider = %response.provider,
                    chars = summary.len(),
                    "Summary generated"
                );
                JobResult::success(summary)
            }
            Err(e) => e.into(),
        }
    }
}

// =============================================================================
// INDEX WRITES
// =============================================================================

#[derive(Debug, Deserialize)]
struct IndexPayload {
    #[serde(flatten)]
    document: IndexDocument,
    /// Digest computed upstream; derived from the document when absent.
    #[serde(default)]
    content_hash: Option<String>,
}

/// Writes a document to both stores for ingest, embed and reindex jobs.
///
/// Only the side that does not yet reflect the hash is written, so embed and
/// reindex share the ingest path. A partial write retries the job.
pub struct IndexHandler {
    kind: JobKind,
    consistency: Arc<ConsistencyManager>,
}

impl IndexHandler {
    pub fn new(kind: JobKind, consistency: Arc<ConsistencyManager>) -> Self {
        Self { kind, consistency }
    }

    pub fn ingest(consistency: Arc<ConsistencyManager>) -> Self {
        Self::new(JobKind::Ingest, consistency)
    }

    pub fn embed(consistency: Arc<ConsistencyManager>) -> Self {
        Self::new(JobKind::Embed, consistency)
    }

    pub fn reindex(consistency: Arc<ConsistencyManager>) -> Self {
        Self::new(JobKind::Reindex, consistency)
    }
}

/// Upsert `doc` and turn the outcome into a job result.
async fn index_document(
    consistency: &ConsistencyManager,
    canonical_id: &CanonicalId,
    doc: &IndexDocument,
    hash: &ContentHash,
) -> JobResult {
    match consistency.upsert(canonical_id, doc, hash).await {
        Ok(UpsertResult::Applied) | Ok(UpsertResult::AlreadyCurrent) => {
            JobResult::success(format!("{}@{}", canonical_id, hash.short()))
        }
        Ok(UpsertResult::Partial { failed, error, .. }) => {
            JobResult::Retry(format!("{} store write failed: {}", failed, error))
        }
        Err(e) => e.into(),
    }
}

#[async_trait]
impl JobHandler for IndexHandler {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let prepared = ctx.canonical_id().and_then(|id| {
            let payload: IndexPayload = ctx.payload_as()?;
            let hash = match payload.content_hash.as_deref() {
                Some(hex) => ContentHash::from_hex(hex)?,
                None => payload.document.content_hash(),
            };
            Ok((id, payload.document, hash))
        });
        let (canonical_id, doc, hash) = match prepared {
            Ok(p) => p,
            Err(e) => return e.into(),
        };
        index_document(&self.consistency, &canonical_id, &doc, &hash).await
    }
}

// =============================================================================
// EXTERNAL STAGES
// =============================================================================

/// What an external stage produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub result_ref: Option<String>,
    /// Text to index under the job's canonical id, e.g. OCR output.
    pub document: Option<IndexDocument>,
}

/// External processing stage (OCR, knowledge-graph linking).
#[async_trait]
pub trait ProcessingStage: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, job: &Job) -> Result<StageOutput>;
}

/// Runs a `ProcessingStage`, optionally indexing the document it returns.
pub struct StageHandler {
    kind: JobKind,
    stage: Arc<dyn ProcessingStage>,
    consistency: Option<Arc<ConsistencyManager>>,
}

impl StageHandler {
    pub fn new(kind: JobKind, stage: Arc<dyn ProcessingStage>) -> Self {
        Self {
            kind,
            stage,
            consistency: None,
        }
    }

    /// Index any document the stage produces.
    pub fn with_indexing(mut self, consistency: Arc<ConsistencyManager>) -> Self {
        self.consistency = Some(consistency);
        self
    }
}

#[async_trait]
impl JobHandler for StageHandler {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let output = match self.stage.run(&ctx.job).await {
            Ok(output) => output,
            Err(e) => return e.into(),
        };

        match (output.document, &self.consistency) {
            (Some(doc), Some(consistency)) => {
                let canonical_id = match ctx.canonical_id() {
                    Ok(id) => id,
                    Err(e) => return e.into(),
                };
                let hash = doc.content_hash();
                info!(
                    job_id = %ctx.job.id,
                    stage = self.stage.name(),
                    canonical_id = %canonical_id,
                    "Indexing stage output"
                );
                index_document(consistency, &canonical_id, &doc, &hash).await
            }
            (Some(_), None) => {
                debug!(stage = self.stage.name(), "Stage output not indexed, no consistency manager");
                JobResult::Success(output.result_ref)
            }
            (None, _) => JobResult::Success(output.result_ref),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agential_core::{CanonicalStore, Error, NewJob, StoreSide};
    use agential_db::MemoryCanonicalStore;
    use agential_inference::mock::MockProvider;
    use agential_inference::RouterConfig;
    use agential_search::{ConsistencyConfig, MemoryLexicalStore, MemoryVectorStore};
    use chrono::Utc;
    use serde_json::{json, Value as JsonValue};

    fn ctx(kind: JobKind, payload: JsonValue) -> JobContext {
        JobContext::new(Job::new(NewJob::new(kind, payload), Utc::now()), "test-0")
    }

    fn router(primary: &MockProvider, secondary: &MockProvider) -> Arc<ProviderRouter> {
        Arc::new(ProviderRouter::new(
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            RouterConfig::default(),
        ))
    }

    struct Stores {
        canonical: Arc<MemoryCanonicalStore>,
        vector: Arc<MemoryVectorStore>,
        manager: Arc<ConsistencyManager>,
    }

    fn stores() -> Stores {
        let canonical = Arc::new(MemoryCanonicalStore::new());
        let vector = Arc::new(MemoryVectorStore::new());
        let manager = Arc::new(
            ConsistencyManager::new(
                canonical.clone(),
                Arc::new(MemoryLexicalStore::new()),
                vector.clone(),
                ConsistencyConfig::default(),
            )
            .with_embedder(Arc::new(MockProvider::new("ollama"))),
        );
        Stores {
            canonical,
            vector,
            manager,
        }
    }

    #[tokio::test]
    async fn test_summarize_sends_bounded_prompt() {
        let primary = MockProvider::new("vllm").with_response("  A short summary.  ");
        let handler = SummarizeHandler::new(router(&primary, &MockProvider::new("ollama")));

        let long = "x".repeat(10_000);
        let result = handler
            .execute(ctx(JobKind::Summarize, json!({"content": long, "title": "Paper"})))
            .await;
        assert_eq!(result, JobResult::success("A short summary."));

        let request = &primary.requests()[0];
        assert_eq!(request.max_tokens, Some(512));
        assert_eq!(request.temperature, Some(0.3));
        let prompt = &request.messages[0].content;
        assert!(prompt.contains("Title: Paper"));
        assert!(prompt.matches('x').count() <= SUMMARY_INPUT_CHARS + 1);
    }

    #[tokio::test]
    async fn test_summarize_retries_when_both_providers_fail() {
        let handler = SummarizeHandler::new(router(
            &MockProvider::new("vllm").failing(),
            &MockProvider::new("ollama").failing(),
        ));
        let result = handler
            .execute(ctx(JobKind::Summarize, json!({"text": "abstract"})))
            .await;
        let JobResult::Retry(msg) = result else {
            panic!("expected Retry, got {:?}", result);
        };
        assert!(msg.contains("vllm") && msg.contains("ollama"));
    }

    #[tokio::test]
    async fn test_summarize_rejects_bad_payload() {
        let handler = SummarizeHandler::new(router(
            &MockProvider::new("vllm"),
            &MockProvider::new("ollama"),
        ));
        assert!(matches!(
            handler.execute(ctx(JobKind::Summarize, json!({"url": "x"}))).await,
            JobResult::Fatal(_)
        ));
        assert!(matches!(
            handler.execute(ctx(JobKind::Summarize, json!({"content": "  "}))).await,
            JobResult::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_ingest_writes_both_stores() {
        let s = stores();
        let handler = IndexHandler::ingest(s.manager.clone());
        let payload = json!({
            "canonical_id": "arxiv:2401.01234v1",
            "title": "Attention",
            "body": "We propose a new architecture."
        });

        let result = handler.execute(ctx(JobKind::Ingest, payload.clone())).await;
        let hash = ContentHash::of_content("We propose a new architecture.", Some("Attention"));
        assert_eq!(
            result,
            JobResult::success(format!("arxiv:2401.01234@{}", hash.short()))
        );

        let id = CanonicalId::arxiv("2401.01234").unwrap();
        let record = s.canonical.get(&id).await.unwrap().unwrap();
        assert!(record.is_current(&hash));

        // Redelivery is a no-op that still succeeds.
        let again = handler.execute(ctx(JobKind::Ingest, payload)).await;
        assert!(matches!(again, JobResult::Success(_)));
        let record = s.canonical.get(&id).await.unwrap().unwrap();
        assert_eq!(record.lexical_version, 1);
        assert_eq!(record.vector_version, 1);
    }

    #[tokio::test]
    async fn test_partial_write_retries() {
        let s = stores();
        s.vector.set_failing(true);
        let handler = IndexHandler::embed(s.manager.clone());
        let result = handler
            .execute(ctx(
                JobKind::Embed,
                json!({"canonical_id": "hf:model:org/m", "body": "card"}),
            ))
            .await;
        let JobResult::Retry(msg) = result else {
            panic!("expected Retry, got {:?}", result);
        };
        assert!(msg.starts_with("vector"));

        let id = CanonicalId::hf_model("org/m").unwrap();
        let record = s.canonical.get(&id).await.unwrap().unwrap();
        assert!(record.lexical_hash.is_some());
        assert!(record.side_hash(StoreSide::Vector).is_none());
    }

    #[tokio::test]
    async fn test_index_without_canonical_id_is_fatal() {
        let s = stores();
        let handler = IndexHandler::reindex(s.manager);
        assert!(matches!(
            handler.execute(ctx(JobKind::Reindex, json!({"body": "x"}))).await,
            JobResult::Fatal(_)
        ));
        assert!(matches!(
            handler
                .execute(ctx(
                    JobKind::Reindex,
                    json!({"canonical_id": "arxiv:2401.00001", "body": "x", "content_hash": "zz"})
                ))
                .await,
            JobResult::Fatal(_)
        ));
    }

    struct FakeOcr {
        fail: bool,
    }

    #[async_trait]
    impl ProcessingStage for FakeOcr {
        fn name(&self) -> &str {
            "fake-ocr"
        }

        async fn run(&self, job: &Job) -> Result<StageOutput> {
            if self.fail {
                return Err(Error::Timeout("ocr model".into()));
            }
            Ok(StageOutput {
                result_ref: Some(format!("ocr:{}", job.id)),
                document: Some(IndexDocument::new("scanned text")),
            })
        }
    }

    #[tokio::test]
    async fn test_stage_output_is_indexed() {
        let s = stores();
        let handler = StageHandler::new(JobKind::Ocr, Arc::new(FakeOcr { fail: false }))
            .with_indexing(s.manager.clone());
        let result = handler
            .execute(ctx(JobKind::Ocr, json!({"canonical_id": "arxiv:2401.00002"})))
            .await;
        assert!(matches!(result, JobResult::Success(Some(ref r)) if r.starts_with("arxiv:2401.00002@")));
        assert!(s
            .vector
            .embedding(&CanonicalId::arxiv("2401.00002").unwrap())
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_stage_without_indexing_and_stage_errors() {
        let handler = StageHandler::new(JobKind::KgLink, Arc::new(FakeOcr { fail: false }));
        let job_ctx = ctx(JobKind::KgLink, json!({}));
        let expected = format!("ocr:{}", job_ctx.job.id);
        assert_eq!(handler.execute(job_ctx).await, JobResult::Success(Some(expected)));

        let failing = StageHandler::new(JobKind::Ocr, Arc::new(FakeOcr { fail: true }));
        assert!(matches!(
            failing.execute(ctx(JobKind::Ocr, json!({}))).await,
            JobResult::Retry(_)
        ));
    }
}
