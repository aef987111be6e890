//! Opt-in orchestrator.
//!
//! Wires the trait cache, embedder, and index client together behind a
//! bounded job queue: opt-in returns as soon as the pipeline is enqueued
//! and the heavy work (trait fetch, embedding, index write) runs on a small
//! worker pool. Pipeline failures land in the job ledger and the logs, never
//! in the opt-in response. Opt-out is synchronous and does propagate errors.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::embedding::Embedder;
use crate::error::{MatchingError, MatchingResult};
use crate::index::{IndexClient, UserPoint, VectorIndexStore};
use crate::models::{
    MatchMetadata, MatchMetadataPatch, MatchingStatus, OptInStatus, SimilarUser, UserEmbedding,
    UserRecord,
};
use crate::now_millis;
use crate::trait_cache::{TraitCache, TraitSource};

/// Background pipeline sizing.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
        }
    }
}

/// One queued opt-in run.
#[derive(Debug, Clone)]
struct OptInJob {
    user_id: String,
    force_refresh: bool,
}

/// Terminal and in-flight pipeline states, queryable per user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub state: JobState,
    pub updated_at: i64,
}

/// Keep at most this many `Completed`/`Failed` records around for status
/// queries; the oldest are evicted first. Queued and running records are
/// never evicted.
const TERMINAL_RECORD_CAP: usize = 10_000;

/// In-memory record of pipeline runs.
///
/// Doubles as the at-most-one-run-per-user guard: `begin` only succeeds when
/// the user has no queued or running job.
pub struct JobLedger {
    records: RwLock<HashMap<String, JobRecord>>,
    terminal_cap: usize,
}

impl Default for JobLedger {
    fn default() -> Self {
        Self::with_terminal_cap(TERMINAL_RECORD_CAP)
    }
}

impl JobLedger {
    fn with_terminal_cap(terminal_cap: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            terminal_cap,
        }
    }

    fn is_terminal(record: &JobRecord) -> bool {
        matches!(record.state, JobState::Completed | JobState::Failed(_))
    }

    fn set(&self, records: &mut HashMap<String, JobRecord>, user_id: &str, state: JobState) {
        records.insert(
            user_id.to_string(),
            JobRecord {
                state,
                updated_at: now_millis(),
            },
        );
        self.evict_terminal(records);
    }

    /// Drop the oldest terminal records once the cap is exceeded, so the
    /// ledger does not grow without bound over the process lifetime.
    fn evict_terminal(&self, records: &mut HashMap<String, JobRecord>) {
        let mut excess = records
            .values()
            .filter(|r| Self::is_terminal(r))
            .count()
            .saturating_sub(self.terminal_cap);

        while excess > 0 {
            let oldest = records
                .iter()
                .filter(|(_, r)| Self::is_terminal(r))
                .min_by_key(|(_, r)| r.updated_at)
                .map(|(id, _)| id.clone());
            let Some(id) = oldest else { break };
            records.remove(&id);
            excess -= 1;
        }
    }

    /// Atomically claim a run for this user. Returns false when one is
    /// already queued or running.
    pub async fn begin(&self, user_id: &str) -> bool {
        let mut records = self.records.write().await;
        match records.get(user_id).map(|r| &r.state) {
            Some(JobState::Queued) | Some(JobState::Running) => false,
            _ => {
                self.set(&mut records, user_id, JobState::Queued);
                true
            }
        }
    }

    pub async fn is_in_flight(&self, user_id: &str) -> bool {
        let records = self.records.read().await;
        matches!(
            records.get(user_id).map(|r| &r.state),
            Some(JobState::Queued) | Some(JobState::Running)
        )
    }

    pub async fn mark_running(&self, user_id: &str) {
        let mut records = self.records.write().await;
        self.set(&mut records, user_id, JobState::Running);
    }

    pub async fn mark_completed(&self, user_id: &str) {
        let mut records = self.records.write().await;
        self.set(&mut records, user_id, JobState::Completed);
    }

    pub async fn mark_failed(&self, user_id: &str, reason: String) {
        let mut records = self.records.write().await;
        self.set(&mut records, user_id, JobState::Failed(reason));
    }

    /// Drop the record, releasing the per-user guard (used when enqueueing
    /// fails after `begin`).
    pub async fn clear(&self, user_id: &str) {
        let mut records = self.records.write().await;
        records.remove(user_id);
    }

    pub async fn record(&self, user_id: &str) -> Option<JobRecord> {
        let records = self.records.read().await;
        records.get(user_id).cloned()
    }
}

/// Outcome reported to the opt-in caller.
#[derive(Debug, Clone)]
pub struct OptInOutcome {
    pub status: OptInStatus,
    pub message: String,
}

pub struct MatchingService<S: VectorIndexStore, E: Embedder, T: TraitSource> {
    index: IndexClient<S>,
    embedder: Arc<E>,
    traits: Arc<TraitCache<T>>,
    ledger: JobLedger,
    queue: mpsc::Sender<OptInJob>,
}

impl<S, E, T> MatchingService<S, E, T>
where
    S: VectorIndexStore + 'static,
    E: Embedder + 'static,
    T: TraitSource + 'static,
{
    /// Build the service and spawn its worker pool.
    pub fn start(
        index: IndexClient<S>,
        embedder: Arc<E>,
        traits: Arc<TraitCache<T>>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<OptInJob>(config.queue_capacity.max(1));

        let service = Arc::new(Self {
            index,
            embedder,
            traits,
            ledger: JobLedger::default(),
            queue: tx,
        });

        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..config.workers.max(1) {
            let service = Arc::clone(&service);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else {
                        tracing::debug!(worker_id, "Pipeline queue closed, worker exiting");
                        break;
                    };
                    service.run_pipeline(job).await;
                }
            });
        }

        service
    }

    /// Enter the matching pool.
    ///
    /// Short-circuits when a run is already in flight or the user already
    /// has a vector and is seeking (unless `force_refresh`). Otherwise the
    /// pipeline is enqueued and the caller gets `Processing` immediately;
    /// its outcome is observable only through the ledger and logs.
    pub async fn opt_in(&self, user_id: &str, force_refresh: bool) -> MatchingResult<OptInOutcome> {
        if self.ledger.is_in_flight(user_id).await {
            return Ok(OptInOutcome {
                status: OptInStatus::Processing,
                message: "opt-in already in progress".to_string(),
            });
        }

        if !force_refresh
            && let Some(existing) = self.index.fetch_by_id(user_id, false).await?
            && existing.metadata.seeking_match
        {
            return Ok(OptInOutcome {
                status: OptInStatus::Completed,
                message: "already opted in with a stored embedding".to_string(),
            });
        }

        if !self.ledger.begin(user_id).await {
            // Lost a race with a concurrent opt-in for the same user.
            return Ok(OptInOutcome {
                status: OptInStatus::Processing,
                message: "opt-in already in progress".to_string(),
            });
        }

        let job = OptInJob {
            user_id: user_id.to_string(),
            force_refresh,
        };
        if let Err(e) = self.queue.try_send(job) {
            self.ledger.clear(user_id).await;
            tracing::error!(user_id, error = %e, "Pipeline queue full, rejecting opt-in");
            return Err(MatchingError::Internal(
                "pipeline queue is full".to_string(),
            ));
        }

        tracing::info!(user_id, force_refresh, "Opt-in pipeline enqueued");
        Ok(OptInOutcome {
            status: OptInStatus::Processing,
            message: "opt-in accepted, embedding pipeline started".to_string(),
        })
    }

    async fn run_pipeline(&self, job: OptInJob) {
        self.ledger.mark_running(&job.user_id).await;

        match self.execute_pipeline(&job).await {
            Ok(()) => {
                tracing::info!(user_id = %job.user_id, "Opt-in pipeline completed");
                self.ledger.mark_completed(&job.user_id).await;
            }
            Err(e) => {
                tracing::error!(user_id = %job.user_id, error = %e, "Opt-in pipeline failed");
                self.ledger.mark_failed(&job.user_id, e.to_string()).await;
            }
        }
    }

    async fn execute_pipeline(&self, job: &OptInJob) -> MatchingResult<()> {
        let traits = self.traits.get(&job.user_id, job.force_refresh).await?;
        let text = traits.as_embedding_text();

        let vector = self.embedder.generate(&text).await?;
        let embedding = UserEmbedding {
            user_id: job.user_id.clone(),
            dimension: vector.len(),
            vector,
            model: self.embedder.model().to_string(),
            created_at: now_millis(),
        };

        self.index
            .upsert_embedding(&embedding, MatchMetadata::new_seeker(&job.user_id))
            .await
    }

    /// Leave the pool. Synchronous: the metadata write happens before the
    /// response, and its failure is the caller's to see.
    pub async fn opt_out(&self, user_id: &str) -> MatchingResult<MatchMetadata> {
        let merged = self
            .index
            .update_metadata(user_id, &MatchMetadataPatch::opt_out())
            .await?;
        tracing::info!(user_id, "User opted out of matching");
        Ok(merged)
    }

    /// Current matching state; a user without an index record gets the
    /// never-opted-in defaults rather than an error.
    pub async fn status(&self, user_id: &str) -> MatchingResult<MatchingStatus> {
        match self.index.fetch_by_id(user_id, false).await? {
            Some(point) => Ok(MatchingStatus::from(&point.metadata)),
            None => Ok(MatchingStatus::never_opted_in()),
        }
    }

    /// Most similar active seekers, excluding the user themself.
    pub async fn find_similar(
        &self,
        user_id: &str,
        top_k: u64,
        include_vectors: bool,
    ) -> MatchingResult<Vec<SimilarUser>> {
        let own = self
            .index
            .fetch_by_id(user_id, true)
            .await?
            .ok_or_else(|| MatchingError::UserNotFound(user_id.to_string()))?;
        let vector = own
            .vector
            .ok_or_else(|| MatchingError::UserNotFound(user_id.to_string()))?;

        // Over-fetch by one so the user's own point never displaces a match.
        // Saturating: top_k comes straight from the query string.
        let mut similar = self
            .index
            .query(vector, top_k.saturating_add(1), true, include_vectors)
            .await?;
        similar.retain(|candidate| candidate.user_id != user_id);
        similar.truncate(top_k as usize);

        Ok(similar)
    }

    pub async fn active_seeker_ids(&self) -> MatchingResult<Vec<String>> {
        self.index.fetch_active_seeker_ids().await
    }

    pub async fn fetch_users(
        &self,
        ids: &[String],
        include_vectors: bool,
    ) -> MatchingResult<Vec<UserRecord>> {
        self.index.fetch_by_ids(ids, include_vectors).await
    }

    /// Partial metadata update; an empty patch is rejected up front.
    pub async fn update_metadata(
        &self,
        user_id: &str,
        patch: &MatchMetadataPatch,
    ) -> MatchingResult<MatchMetadata> {
        if patch.is_empty() {
            return Err(MatchingError::Validation(
                "metadata update contains no recognized fields".to_string(),
            ));
        }
        self.index.update_metadata(user_id, patch).await
    }

    pub async fn fetch_user(
        &self,
        user_id: &str,
        include_vectors: bool,
    ) -> MatchingResult<Option<UserPoint>> {
        self.index.fetch_by_id(user_id, include_vectors).await
    }

    pub async fn ping_index(&self) -> MatchingResult<()> {
        self.index.ping().await
    }

    pub fn job_ledger(&self) -> &JobLedger {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InMemoryIndexStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn generate(&self, text: &str) -> MatchingResult<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Deterministic per-text vector so similarity ordering is stable.
            let seed = text.len() as f32;
            Ok(vec![seed, 1.0, 0.0])
        }

        fn dimension(&self) -> usize {
            3
        }

        fn model(&self) -> &str {
            "test-model"
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn generate(&self, _text: &str) -> MatchingResult<Vec<f32>> {
            Err(MatchingError::EmbeddingApi("boom".to_string()))
        }

        fn dimension(&self) -> usize {
            3
        }

        fn model(&self) -> &str {
            "test-model"
        }
    }

    struct StaticTraits;

    #[async_trait]
    impl TraitSource for StaticTraits {
        async fn fetch_traits(&self, user_id: &str) -> MatchingResult<Vec<String>> {
            Ok(vec![format!("traits of {}", user_id)])
        }
    }

    struct Fixture {
        store: Arc<InMemoryIndexStore>,
        embedder: Arc<CountingEmbedder>,
        service: Arc<MatchingService<InMemoryIndexStore, CountingEmbedder, StaticTraits>>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryIndexStore::new();
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let service = MatchingService::start(
            IndexClient::new(store.clone(), 3),
            embedder.clone(),
            Arc::new(TraitCache::new(Arc::new(StaticTraits))),
            PipelineConfig {
                workers: 2,
                queue_capacity: 8,
            },
        );
        Fixture {
            store,
            embedder,
            service,
        }
    }

    async fn await_terminal(ledger: &JobLedger, user_id: &str) -> JobState {
        for _ in 0..200 {
            if let Some(record) = ledger.record(user_id).await
                && !matches!(record.state, JobState::Queued | JobState::Running)
            {
                return record.state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pipeline for {} never reached a terminal state", user_id);
    }

    #[tokio::test]
    async fn opt_in_runs_the_full_pipeline() {
        let f = fixture();

        let outcome = f.service.opt_in("u1", false).await.unwrap();
        assert_eq!(outcome.status, OptInStatus::Processing);

        assert_eq!(await_terminal(f.service.job_ledger(), "u1").await, JobState::Completed);

        let point = f.service.fetch_user("u1", true).await.unwrap().unwrap();
        assert!(point.metadata.seeking_match);
        assert!(point.metadata.opt_in_timestamp.is_some());
        assert_eq!(point.metadata.missed_cycles_count, 0);
        assert!(point.vector.is_some());
        assert_eq!(f.embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeat_opt_in_short_circuits_without_regenerating() {
        let f = fixture();

        f.service.opt_in("u1", false).await.unwrap();
        await_terminal(f.service.job_ledger(), "u1").await;

        let second = f.service.opt_in("u1", false).await.unwrap();
        assert_eq!(second.status, OptInStatus::Completed);
        assert_eq!(f.embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_regenerates_even_when_already_seeking() {
        let f = fixture();

        f.service.opt_in("u1", false).await.unwrap();
        await_terminal(f.service.job_ledger(), "u1").await;

        let again = f.service.opt_in("u1", true).await.unwrap();
        assert_eq!(again.status, OptInStatus::Processing);
        await_terminal(f.service.job_ledger(), "u1").await;
        assert_eq!(f.embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pipeline_failure_lands_in_the_ledger_not_the_caller() {
        let store = InMemoryIndexStore::new();
        let service = MatchingService::start(
            IndexClient::new(store.clone(), 3),
            Arc::new(FailingEmbedder),
            Arc::new(TraitCache::new(Arc::new(StaticTraits))),
            PipelineConfig::default(),
        );

        let outcome = service.opt_in("u1", false).await.unwrap();
        assert_eq!(outcome.status, OptInStatus::Processing);

        let state = await_terminal(service.job_ledger(), "u1").await;
        assert!(matches!(state, JobState::Failed(_)));
        assert!(service.fetch_user("u1", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn opt_out_is_synchronous_and_preserves_history() {
        let f = fixture();

        f.service.opt_in("u1", false).await.unwrap();
        await_terminal(f.service.job_ledger(), "u1").await;

        let merged = f.service.opt_out("u1").await.unwrap();
        assert!(!merged.seeking_match);
        assert!(merged.opt_in_timestamp.is_some());
        assert!(merged.last_opt_out_timestamp.is_some());
    }

    #[tokio::test]
    async fn opt_out_for_unknown_user_propagates_not_found() {
        let f = fixture();
        let err = f.service.opt_out("ghost").await.unwrap_err();
        assert!(matches!(err, MatchingError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn status_defaults_for_unknown_user() {
        let f = fixture();
        let status = f.service.status("ghost").await.unwrap();
        assert!(status.has_never_opted_in);
        assert!(!status.is_seeking_match);
    }

    #[tokio::test]
    async fn status_reflects_opt_out_history() {
        let f = fixture();

        f.service.opt_in("u1", false).await.unwrap();
        await_terminal(f.service.job_ledger(), "u1").await;
        f.service.opt_out("u1").await.unwrap();

        let status = f.service.status("u1").await.unwrap();
        assert!(!status.is_seeking_match);
        assert!(!status.has_never_opted_in);
        assert!(status.last_opt_out_timestamp.is_some());
    }

    #[tokio::test]
    async fn find_similar_excludes_the_querying_user() {
        let f = fixture();
        f.store
            .seed_raw("me", Some(vec![1.0, 0.0, 0.0]), json!({"seekingMatch": true}))
            .await;
        f.store
            .seed_raw("close", Some(vec![0.9, 0.1, 0.0]), json!({"seekingMatch": true}))
            .await;
        f.store
            .seed_raw("far", Some(vec![0.0, 0.0, 1.0]), json!({"seekingMatch": true}))
            .await;

        let similar = f.service.find_similar("me", 2, false).await.unwrap();
        assert_eq!(similar.len(), 2);
        assert!(similar.iter().all(|s| s.user_id != "me"));
        assert_eq!(similar[0].user_id, "close");
    }

    #[tokio::test]
    async fn find_similar_skips_non_seekers() {
        let f = fixture();
        f.store
            .seed_raw("me", Some(vec![1.0, 0.0, 0.0]), json!({"seekingMatch": true}))
            .await;
        f.store
            .seed_raw("lurker", Some(vec![1.0, 0.0, 0.0]), json!({"seekingMatch": false}))
            .await;

        let similar = f.service.find_similar("me", 5, false).await.unwrap();
        assert!(similar.is_empty());
    }

    #[tokio::test]
    async fn find_similar_tolerates_an_enormous_top_k() {
        let f = fixture();
        f.store
            .seed_raw("me", Some(vec![1.0, 0.0, 0.0]), json!({"seekingMatch": true}))
            .await;
        f.store
            .seed_raw("close", Some(vec![0.9, 0.1, 0.0]), json!({"seekingMatch": true}))
            .await;

        // topK is caller-supplied and unclamped; u64::MAX must not overflow
        // the over-fetch.
        let similar = f.service.find_similar("me", u64::MAX, false).await.unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].user_id, "close");
    }

    #[tokio::test]
    async fn find_similar_for_unknown_user_is_not_found() {
        let f = fixture();
        let err = f.service.find_similar("ghost", 3, false).await.unwrap_err();
        assert!(matches!(err, MatchingError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn empty_metadata_patch_is_rejected() {
        let f = fixture();
        let err = f
            .service
            .update_metadata("u1", &MatchMetadataPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MatchingError::Validation(_)));
    }

    #[tokio::test]
    async fn empty_fetch_users_never_touches_the_store() {
        let f = fixture();
        let records = f.service.fetch_users(&[], false).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(f.store.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ledger_guard_blocks_concurrent_runs() {
        let ledger = JobLedger::default();
        assert!(ledger.begin("u1").await);
        assert!(!ledger.begin("u1").await);

        ledger.mark_running("u1").await;
        assert!(!ledger.begin("u1").await);

        ledger.mark_completed("u1").await;
        assert!(ledger.begin("u1").await);
    }

    #[tokio::test]
    async fn terminal_ledger_records_are_capped() {
        let ledger = JobLedger::with_terminal_cap(2);

        for user in ["u1", "u2", "u3", "u4"] {
            ledger.mark_completed(user).await;
        }

        let remaining = ledger.records.read().await.len();
        assert_eq!(remaining, 2);
    }

    #[tokio::test]
    async fn eviction_never_touches_in_flight_records() {
        let ledger = JobLedger::with_terminal_cap(1);

        assert!(ledger.begin("queued").await);
        ledger.mark_running("running").await;
        ledger.mark_completed("done1").await;
        ledger.mark_failed("done2", "boom".to_string()).await;
        ledger.mark_completed("done3").await;

        // Both in-flight records survive; terminal records are down to the cap.
        assert!(ledger.is_in_flight("queued").await);
        assert!(ledger.is_in_flight("running").await);
        let records = ledger.records.read().await;
        let terminal = records.values().filter(|r| JobLedger::is_terminal(r)).count();
        assert_eq!(terminal, 1);
    }

    #[tokio::test]
    async fn full_queue_clears_the_guard_and_errors() {
        // No workers draining the queue: capacity 1 fills immediately.
        let store = InMemoryIndexStore::new();
        let (tx, _rx) = mpsc::channel::<OptInJob>(1);
        let service = MatchingService {
            index: IndexClient::new(store, 3),
            embedder: Arc::new(CountingEmbedder {
                calls: AtomicUsize::new(0),
            }),
            traits: Arc::new(TraitCache::new(Arc::new(StaticTraits))),
            ledger: JobLedger::default(),
            queue: tx,
        };

        service.opt_in("u1", false).await.unwrap();
        let err = service.opt_in("u2", false).await.unwrap_err();
        assert!(matches!(err, MatchingError::Internal(_)));

        // The guard is released so a later retry can enqueue again.
        assert!(!service.job_ledger().is_in_flight("u2").await);
    }
}
