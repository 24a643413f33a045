use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use deskrail_bus::EventBus;
use deskrail_core::policy::RetryPolicy;
use deskrail_core::{BatchId, Stage, StageError, StageEvent, StageOutcome, StageStatus, TicketId};

use crate::progress::ProgressStore;

/// Which stage to run and its time limits.
#[derive(Debug, Clone, Copy)]
pub struct StageSpec {
    pub stage: Stage,
    /// Limit for a single attempt of `f`.
    pub attempt_timeout: Duration,
    /// Limit across all attempts, retries and backoff included.
    pub wall_timeout: Duration,
}

impl StageSpec {
    pub fn new(stage: Stage, attempt_timeout: Duration, wall_timeout: Duration) -> Self {
        Self {
            stage,
            attempt_timeout,
            wall_timeout,
        }
    }
}

/// How a stage run ended. Failures are absorbed into outcomes — only fatal
/// infrastructure errors escape as `Err` from [`StageRunner::run`].
#[derive(Debug)]
pub enum StageResult<T> {
    /// `f` ran and succeeded.
    Completed(T),
    /// The stage was already completed for this ticket; `f` was not invoked.
    AlreadyDone(StageOutcome),
    /// Retries exhausted, permanent failure, or cancellation; recorded.
    Failed(StageOutcome),
}

impl<T> StageResult<T> {
    pub fn value(self) -> Option<T> {
        match self {
            StageResult::Completed(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageResult::Failed(_))
    }
}

/// Payload extractor for stages with nothing to report beyond completion.
pub fn no_payload<T>(_: &T) -> Map<String, Value> {
    Map::new()
}

/// Executes one named stage for one ticket: idempotency guard, per-attempt
/// timeout, transient-only retries with capped exponential backoff, event
/// emission, and outcome persistence.
pub struct StageRunner {
    bus: Arc<EventBus>,
    store: Arc<dyn ProgressStore>,
    retry: RetryPolicy,
    db_timeout: Duration,
}

impl StageRunner {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<dyn ProgressStore>,
        retry: RetryPolicy,
        db_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            store,
            retry,
            db_timeout,
        }
    }

    /// Run `f` for one (ticket, stage) pair.
    ///
    /// Side effects are confined to the progress store, the event bus, and
    /// `f` itself. The retry budget applies to transient failures only;
    /// attempt timeouts count as transient. `payload` supplies the `data`
    /// map of the completed event.
    pub async fn run<T, F, Fut, P>(
        &self,
        ticket_id: TicketId,
        batch_id: BatchId,
        spec: StageSpec,
        cancel: &CancellationToken,
        f: F,
        payload: P,
    ) -> Result<StageResult<T>, StageError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
        P: FnOnce(&T) -> Map<String, Value>,
    {
        // Idempotency guard: a completed stage is never re-run.
        if let Some(existing) = self.load(ticket_id, spec.stage).await? {
            if existing.status == StageStatus::Completed {
                debug!(ticket = %ticket_id, stage = %spec.stage, "stage already completed");
                return Ok(StageResult::AlreadyDone(existing));
            }
        }

        let outcome = StageOutcome::in_progress(ticket_id, batch_id, spec.stage);
        self.persist(outcome.clone()).await?;
        self.bus.publish(&StageEvent::ticket(
            ticket_id,
            batch_id,
            spec.stage,
            StageStatus::InProgress,
        ));

        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return self.fail(outcome, StageError::Cancelled).await;
            }

            let Some(wall_remaining) = spec.wall_timeout.checked_sub(started.elapsed())
            else {
                let err = StageError::transient(format!(
                    "stage wall clock exceeded after {:?}",
                    spec.wall_timeout
                ));
                return self.fail(outcome, err).await;
            };
            let attempt_timeout = spec.attempt_timeout.min(wall_remaining);

            let attempt_result = tokio::select! {
                _ = cancel.cancelled() => Err(StageError::Cancelled),
                res = tokio::time::timeout(attempt_timeout, f(attempt)) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(StageError::transient(format!(
                        "attempt {attempt} timed out after {attempt_timeout:?}"
                    ))),
                },
            };

            match attempt_result {
                Ok(value) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    let done = outcome.finish(StageStatus::Completed);
                    self.persist(done).await?;

                    let mut data = payload(&value);
                    data.insert("elapsed_ms".into(), json!(elapsed_ms));
                    self.bus.publish(
                        &StageEvent::ticket(
                            ticket_id,
                            batch_id,
                            spec.stage,
                            StageStatus::Completed,
                        )
                        .with_data(data),
                    );
                    return Ok(StageResult::Completed(value));
                }
                Err(err @ StageError::Transient(_)) => {
                    if attempt >= self.retry.budget {
                        return self.fail(outcome, err).await;
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        ticket = %ticket_id,
                        stage = %spec.stage,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient stage failure, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return self.fail(outcome, StageError::Cancelled).await;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(StageError::Fatal(msg)) => {
                    // Record best-effort, then escalate to the orchestrator.
                    let _ = self
                        .fail::<T>(outcome, StageError::fatal(msg.clone()))
                        .await;
                    return Err(StageError::Fatal(msg));
                }
                Err(err) => {
                    // Permanent or cancelled: no retry.
                    return self.fail(outcome, err).await;
                }
            }
        }
    }

    /// Record a failed outcome and emit the matching event.
    async fn fail<T>(
        &self,
        outcome: StageOutcome,
        err: StageError,
    ) -> Result<StageResult<T>, StageError> {
        let ticket_id = outcome.ticket_id;
        let batch_id = outcome.batch_id;
        let stage = outcome.stage;
        let detail = match &err {
            StageError::Cancelled => "cancelled".to_string(),
            other => other.to_string(),
        };

        let failed = outcome
            .with_error(detail.clone())
            .finish(StageStatus::Failed);
        self.persist(failed.clone()).await?;
        self.bus.publish(
            &StageEvent::ticket(ticket_id, batch_id, stage, StageStatus::Failed)
                .with_message(detail),
        );
        Ok(StageResult::Failed(failed))
    }

    async fn load(
        &self,
        ticket_id: TicketId,
        stage: Stage,
    ) -> Result<Option<StageOutcome>, StageError> {
        match tokio::time::timeout(self.db_timeout, self.store.get(ticket_id, stage)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(StageError::fatal(format!("progress store read: {e}"))),
            Err(_) => Err(StageError::fatal("progress store read timed out")),
        }
    }

    async fn persist(&self, outcome: StageOutcome) -> Result<(), StageError> {
        match tokio::time::timeout(self.db_timeout, self.store.record(outcome)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StageError::fatal(format!("progress store write: {e}"))),
            Err(_) => Err(StageError::fatal("progress store write timed out")),
        }
    }

    /// Capped exponential backoff with ±jitter, computed without `rand`
    /// from the clock's subsecond nanos.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.retry.base_delay_ms as f64
            * self.retry.factor.powi(attempt.min(16) as i32);
        let capped = exp.min(self.retry.max_delay_ms as f64);

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let unit = f64::from(nanos) / 1e9;
        let jitter = 1.0 + self.retry.jitter_pct * (2.0 * unit - 1.0);

        Duration::from_millis((capped * jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::MemoryProgressStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn runner(store: Arc<MemoryProgressStore>) -> (StageRunner, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let runner = StageRunner::new(
            bus.clone(),
            store,
            RetryPolicy::default(),
            Duration::from_secs(2),
        );
        (runner, bus)
    }

    fn spec(stage: Stage) -> StageSpec {
        StageSpec::new(stage, Duration::from_secs(5), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn success_emits_started_and_completed() {
        let store = Arc::new(MemoryProgressStore::new());
        let (runner, bus) = runner(store.clone());
        let mut sub = bus.subscribe().unwrap();
        let ticket = Uuid::new_v4();
        let batch = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let result = runner
            .run(
                ticket,
                batch,
                spec(Stage::PiiScrub),
                &cancel,
                |_| async { Ok::<_, StageError>(42u32) },
                |v| {
                    let mut m = Map::new();
                    m.insert("answer".into(), json!(v));
                    m
                },
            )
            .await
            .unwrap();

        assert_eq!(result.value(), Some(42));

        let started = sub.recv().await.unwrap();
        assert_eq!(started.status, StageStatus::InProgress);
        let completed = sub.recv().await.unwrap();
        assert_eq!(completed.status, StageStatus::Completed);
        assert_eq!(completed.data["answer"], json!(42));
        assert!(completed.data.contains_key("elapsed_ms"));
        assert!(started.timestamp <= completed.timestamp);

        let outcome = store.get(ticket, Stage::PiiScrub).await.unwrap().unwrap();
        assert_eq!(outcome.status, StageStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_succeed() {
        let store = Arc::new(MemoryProgressStore::new());
        let (runner, _bus) = runner(store.clone());
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = runner
            .run(
                Uuid::new_v4(),
                Uuid::new_v4(),
                spec(Stage::LlmAnalysis),
                &cancel,
                |_| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(StageError::transient("flaky"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                no_payload,
            )
            .await
            .unwrap();

        assert_eq!(result.value(), Some("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3); // 1 try + 2 retries
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_do_not_retry() {
        let store = Arc::new(MemoryProgressStore::new());
        let (runner, _bus) = runner(store.clone());
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let ticket = Uuid::new_v4();

        let result = runner
            .run(
                ticket,
                Uuid::new_v4(),
                spec(Stage::LlmAnalysis),
                &cancel,
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(StageError::permanent("bad request")) }
                },
                no_payload,
            )
            .await
            .unwrap();

        assert!(result.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let outcome = store.get(ticket, Stage::LlmAnalysis).await.unwrap().unwrap();
        assert_eq!(outcome.status, StageStatus::Failed);
        assert!(outcome.error_detail.unwrap().contains("bad request"));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_records_last_error() {
        let store = Arc::new(MemoryProgressStore::new());
        let (runner, _bus) = runner(store.clone());
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let ticket = Uuid::new_v4();

        let result = runner
            .run(
                ticket,
                Uuid::new_v4(),
                spec(Stage::Geocode),
                &cancel,
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(StageError::transient("still down")) }
                },
                no_payload,
            )
            .await
            .unwrap();

        assert!(result.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 3); // budget 2 => 3 attempts

        let outcome = store.get(ticket, Stage::Geocode).await.unwrap().unwrap();
        assert!(outcome.error_detail.unwrap().contains("still down"));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_stage_is_not_rerun() {
        let store = Arc::new(MemoryProgressStore::new());
        let (runner, _bus) = runner(store.clone());
        let cancel = CancellationToken::new();
        let ticket = Uuid::new_v4();
        let batch = Uuid::new_v4();

        store
            .record(
                StageOutcome::in_progress(ticket, batch, Stage::SpamFilter)
                    .finish(StageStatus::Completed),
            )
            .await
            .unwrap();

        let calls = AtomicU32::new(0);
        let result = runner
            .run(
                ticket,
                batch,
                spec(Stage::SpamFilter),
                &cancel,
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(1u8) }
                },
                no_payload,
            )
            .await
            .unwrap();

        assert!(matches!(result, StageResult::AlreadyDone(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_counts_as_transient() {
        let store = Arc::new(MemoryProgressStore::new());
        let (runner, _bus) = runner(store.clone());
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = runner
            .run(
                Uuid::new_v4(),
                Uuid::new_v4(),
                StageSpec::new(
                    Stage::Geocode,
                    Duration::from_millis(100),
                    Duration::from_secs(60),
                ),
                &cancel,
                |_| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            // first attempt hangs past the attempt timeout
                            tokio::time::sleep(Duration::from_secs(10)).await;
                        }
                        Ok("recovered")
                    }
                },
                no_payload,
            )
            .await
            .unwrap();

        assert_eq!(result.value(), Some("recovered"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_escalates_to_failure() {
        let store = Arc::new(MemoryProgressStore::new());
        let (runner, _bus) = runner(store.clone());
        let cancel = CancellationToken::new();
        let ticket = Uuid::new_v4();

        let result = runner
            .run(
                ticket,
                Uuid::new_v4(),
                StageSpec::new(
                    Stage::LlmAnalysis,
                    Duration::from_secs(10),
                    Duration::from_millis(300),
                ),
                &cancel,
                |_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Err::<(), _>(StageError::transient("slow"))
                },
                no_payload,
            )
            .await
            .unwrap();

        assert!(result.is_failed());
        let outcome = store.get(ticket, Stage::LlmAnalysis).await.unwrap().unwrap();
        let detail = outcome.error_detail.unwrap();
        assert!(detail.contains("timed out") || detail.contains("wall clock"), "{detail}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_records_failed_with_reason() {
        let store = Arc::new(MemoryProgressStore::new());
        let (runner, _bus) = runner(store.clone());
        let cancel = CancellationToken::new();
        let ticket = Uuid::new_v4();

        let run = runner.run(
            ticket,
            Uuid::new_v4(),
            spec(Stage::LlmAnalysis),
            &cancel,
            |_| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok("never")
            },
            no_payload,
        );
        cancel.cancel();

        let result = run.await.unwrap();
        assert!(result.is_failed());
        let outcome = store.get(ticket, Stage::LlmAnalysis).await.unwrap().unwrap();
        assert_eq!(outcome.error_detail.as_deref(), Some("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_escalate() {
        let store = Arc::new(MemoryProgressStore::new());
        let (runner, _bus) = runner(store.clone());
        let cancel = CancellationToken::new();

        let err = runner
            .run(
                Uuid::new_v4(),
                Uuid::new_v4(),
                spec(Stage::PiiScrub),
                &cancel,
                |_| async { Err::<(), _>(StageError::fatal("db unreachable")) },
                no_payload,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::Fatal(_)));
    }

    #[test]
    fn backoff_is_capped_and_jittered() {
        let retry = RetryPolicy::default();
        let runner = StageRunner::new(
            Arc::new(EventBus::new()),
            Arc::new(MemoryProgressStore::new()),
            retry.clone(),
            Duration::from_secs(2),
        );

        for attempt in 0..10 {
            let delay = runner.backoff_delay(attempt).as_millis() as f64;
            let nominal = (retry.base_delay_ms as f64 * retry.factor.powi(attempt as i32))
                .min(retry.max_delay_ms as f64);
            let lo = nominal * (1.0 - retry.jitter_pct) - 1.0;
            let hi = nominal * (1.0 + retry.jitter_pct) + 1.0;
            assert!(
                delay >= lo && delay <= hi,
                "attempt {attempt}: {delay} outside [{lo}, {hi}]"
            );
        }
    }
}
