use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use deskrail_bus::EventBus;
use deskrail_core::{
    Analysis, Assignment, Batch, BatchId, BatchStatus, GeoPoint, Policies, Stage, StageError,
    StageEvent, StageOutcome, StageStatus, Ticket, TicketId,
};
use deskrail_geo::{GeocodeProvider, GeocodeResolver, ResolvedLocation};
use deskrail_llm::{
    AnalysisGenerator, HeuristicOutcome, LlmAnalysis, SpamClassifier, SpamHeuristic, SpamVerdict,
};
use deskrail_routing::{score_ticket, LoadLedger, RoutingEngine, RoutingTicket};
use deskrail_vault::Vault;

use crate::progress::ProgressStore;
use crate::runner::{StageResult, StageRunner, StageSpec};
use crate::service::BatchProgress;

/// Time limits for the purely local stages (PII scrub, priority). These do
/// no external I/O beyond their own store writes.
const LOCAL_ATTEMPT: Duration = Duration::from_secs(5);
const LOCAL_WALL: Duration = Duration::from_secs(10);

/// External collaborators the orchestrator drives.
pub struct Ports {
    pub vault: Arc<Vault>,
    pub analyzer: Arc<AnalysisGenerator>,
    pub spam_classifier: Arc<dyn SpamClassifier>,
    pub geocoder: Arc<dyn GeocodeProvider>,
}

/// Everything one batch run needs.
pub struct BatchInput {
    pub batch: Batch,
    pub tickets: Vec<Ticket>,
    pub agents: Vec<deskrail_core::Agent>,
    pub offices: Vec<deskrail_core::Office>,
}

/// Terminal state of one ticket in the batch report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Spam,
    Routed,
    Unrouted,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketResult {
    pub ticket_id: TicketId,
    pub row_index: u32,
    pub status: TicketStatus,
    pub is_spam: bool,
    pub spam_probability: f64,
    pub priority_final: Option<f64>,
    pub assignment: Option<Assignment>,
    pub failed_stages: Vec<Stage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total: u32,
    pub spam: u32,
    pub enriched: u32,
    pub routed: u32,
    pub failed: u32,
    pub results: Vec<TicketResult>,
}

/// Per-stage admission gates shared across a batch's tickets.
struct StageGates {
    llm: Arc<Semaphore>,
    geocode: Arc<Semaphore>,
    spam_llm: Arc<Semaphore>,
}

/// One ticket's enrichment, ready for the deferred routing phase.
struct EnrichedTicket {
    ticket: Ticket,
    verdict: SpamVerdict,
    analysis: Option<Analysis>,
    location: Option<ResolvedLocation>,
    failed_stages: Vec<Stage>,
}

/// Drives the per-ticket stage graph and the batch-deferred routing phase.
///
/// Stage order per ticket:
/// spam → pii scrub → (llm ‖ geocode) → priority, then routing once every
/// ticket in the batch has a priority or has terminally failed.
pub struct Orchestrator {
    bus: Arc<EventBus>,
    store: Arc<dyn ProgressStore>,
    runner: StageRunner,
    ports: Ports,
    last_resort: GeoPoint,
    ledger: Arc<LoadLedger>,
    policies: Arc<Policies>,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<dyn ProgressStore>,
        ports: Ports,
        last_resort: GeoPoint,
        ledger: Arc<LoadLedger>,
        policies: Arc<Policies>,
    ) -> Self {
        let runner = StageRunner::new(
            bus.clone(),
            store.clone(),
            policies.retry.clone(),
            Duration::from_secs(policies.timeouts.db_write_secs),
        );
        Self {
            bus,
            store,
            runner,
            ports,
            last_resort,
            ledger,
            policies,
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Run one batch to completion (or cancellation / fatal failure).
    ///
    /// `progress` is updated as tickets finish so pollers see live state.
    pub async fn run_batch(
        self: Arc<Self>,
        input: BatchInput,
        cancel: CancellationToken,
        progress: Arc<RwLock<BatchProgress>>,
    ) -> Result<BatchReport, StageError> {
        let batch_id = input.batch.id;
        let total = input.tickets.len() as u32;

        info!(batch = %batch_id, total, "batch started");
        self.bus.publish(
            &StageEvent::batch(batch_id, StageStatus::InProgress).with_entry("total", total),
        );
        {
            let mut p = progress.write().await;
            p.total = total;
            p.status = BatchStatus::InProgress;
        }

        let gates = StageGates {
            llm: Arc::new(Semaphore::new(self.policies.concurrency.llm)),
            geocode: Arc::new(Semaphore::new(self.policies.concurrency.geocode)),
            spam_llm: Arc::new(Semaphore::new(self.policies.concurrency.spam_llm)),
        };
        let gates = Arc::new(gates);
        let resolver = Arc::new(GeocodeResolver::new(
            self.ports.geocoder.clone(),
            self.last_resort,
        ));

        // Enrichment: one task per ticket, dispatched in row order. The
        // semaphores bound how many are actually in flight per stage.
        let mut tickets = input.tickets.clone();
        tickets.sort_by_key(|t| t.row_index);

        let mut join_set: JoinSet<Result<EnrichedTicket, StageError>> = JoinSet::new();
        for ticket in tickets {
            join_set.spawn(self.clone().process_ticket(
                ticket,
                batch_id,
                total,
                resolver.clone(),
                gates.clone(),
                cancel.clone(),
            ));
        }

        let mut enriched: Vec<EnrichedTicket> = Vec::with_capacity(total as usize);
        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(batch = %batch_id, error = %e, "ticket task panicked");
                    Err(StageError::fatal(format!("ticket task failed: {e}")))
                }
            };
            match outcome {
                Ok(ticket) => {
                    {
                        let mut p = progress.write().await;
                        p.processed += 1;
                        if ticket.verdict.is_spam {
                            p.spam += 1;
                        }
                        p.current = Some(format!("row {}", ticket.ticket.row_index));
                    }
                    enriched.push(ticket);
                }
                Err(fatal) => {
                    // Fatal infra: stop everything, fail the batch.
                    cancel.cancel();
                    join_set.shutdown().await;
                    self.fail_batch(batch_id, &progress, &fatal.to_string()).await;
                    return Err(fatal);
                }
            }
        }
        enriched.sort_by_key(|e| e.ticket.row_index);

        if cancel.is_cancelled() {
            self.bus.publish(
                &StageEvent::batch(batch_id, StageStatus::Failed).with_message("cancelled"),
            );
            let report = self.build_report(batch_id, BatchStatus::Cancelled, &enriched, &[]);
            let mut p = progress.write().await;
            p.status = BatchStatus::Cancelled;
            p.results = report.results.clone();
            p.current = None;
            return Ok(report);
        }

        // Routing is deferred until the whole batch has priorities: the
        // engine needs a stable priority ordering before it commits load.
        let assignments = self.route_batch(batch_id, &enriched, &input, &cancel).await?;

        let status = if cancel.is_cancelled() {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        };
        let report = self.build_report(batch_id, status, &enriched, &assignments);

        self.bus.publish(
            &StageEvent::batch(batch_id, StageStatus::Completed)
                .with_entry("total", report.total)
                .with_entry("spam", report.spam)
                .with_entry("enriched", report.enriched)
                .with_entry("routed", report.routed)
                .with_entry("failed", report.failed),
        );
        info!(
            batch = %batch_id,
            total = report.total,
            spam = report.spam,
            routed = report.routed,
            failed = report.failed,
            "batch drained"
        );

        {
            let mut p = progress.write().await;
            p.status = status;
            p.results = report.results.clone();
            p.current = None;
        }
        Ok(report)
    }

    // ── Per-ticket stage graph ──────────────────────────────────────

    async fn process_ticket(
        self: Arc<Self>,
        ticket: Ticket,
        batch_id: BatchId,
        total_rows: u32,
        resolver: Arc<GeocodeResolver>,
        gates: Arc<StageGates>,
        cancel: CancellationToken,
    ) -> Result<EnrichedTicket, StageError> {
        let timeouts = &self.policies.timeouts;
        let mut failed_stages: Vec<Stage> = Vec::new();

        // 1. Spam check: structural heuristic first, classifier only when
        // the heuristic cannot decide. The classifier sees masked text —
        // no PII leaves the process unscrubbed.
        let heuristic = SpamHeuristic::new(self.policies.spam.clone());
        let spam_spec =
            StageSpec::new(Stage::SpamFilter, timeouts.spam_attempt(), timeouts.spam_wall());
        let spam_payload = |v: &SpamVerdict| {
            let mut data = serde_json::Map::new();
            data.insert("is_spam".into(), json!(v.is_spam));
            data.insert("probability".into(), json!(v.probability));
            data
        };

        let verdict_run = match heuristic.assess(&ticket.description) {
            HeuristicOutcome::Spam(v) | HeuristicOutcome::Clean(v) => {
                self.runner
                    .run(
                        ticket.id,
                        batch_id,
                        spam_spec,
                        &cancel,
                        |_| async move { Ok(v) },
                        spam_payload,
                    )
                    .await?
            }
            HeuristicOutcome::Ambiguous => {
                let masked = self.ports.vault.mask(&ticket.description);
                self.runner
                    .run(
                        ticket.id,
                        batch_id,
                        spam_spec,
                        &cancel,
                        |_| {
                            let classifier = self.ports.spam_classifier.clone();
                            let gate = gates.spam_llm.clone();
                            let text = masked.clone();
                            async move {
                                let _permit = gate
                                    .acquire_owned()
                                    .await
                                    .map_err(|_| StageError::Cancelled)?;
                                classifier.classify(&text).await.map_err(StageError::from)
                            }
                        },
                        spam_payload,
                    )
                    .await?
            }
        };

        let spam_check_failed = verdict_run.is_failed();
        let verdict = match verdict_run {
            StageResult::Completed(v) => v,
            StageResult::AlreadyDone(_) | StageResult::Failed(_) => {
                // An undecidable spam check must not block a real customer.
                if spam_check_failed {
                    failed_stages.push(Stage::SpamFilter);
                }
                SpamVerdict {
                    is_spam: false,
                    probability: 0.5,
                }
            }
        };

        if verdict.is_spam {
            info!(ticket = %ticket.id, probability = verdict.probability, "spam, short-circuiting");
            return Ok(EnrichedTicket {
                ticket,
                verdict,
                analysis: None,
                location: None,
                failed_stages,
            });
        }

        // 2. PII scrub. Downstream external calls only ever see the
        // scrubbed text.
        let scrub_spec = StageSpec::new(Stage::PiiScrub, LOCAL_ATTEMPT, LOCAL_WALL);
        let scrub_run = self
            .runner
            .run(
                ticket.id,
                batch_id,
                scrub_spec,
                &cancel,
                |_| {
                    let vault = self.ports.vault.clone();
                    let text = ticket.description.clone();
                    let id = ticket.id;
                    async move { vault.scrub(id, &text).await.map_err(StageError::from) }
                },
                |s| {
                    let mut data = serde_json::Map::new();
                    data.insert("bindings".into(), json!(s.bindings.len()));
                    data
                },
            )
            .await?;

        let scrubbed: Option<String> = match scrub_run {
            StageResult::Completed(outcome) => Some(outcome.text),
            // Bindings already exist; masking reproduces the same token
            // sequence without binding twice.
            StageResult::AlreadyDone(_) => Some(self.ports.vault.mask(&ticket.description)),
            StageResult::Failed(_) => {
                failed_stages.push(Stage::PiiScrub);
                None
            }
        };

        // 3. LLM analysis and geocoding run concurrently; a permanent
        // failure on one side never stops the other.
        let llm_fut = async {
            let Some(text) = scrubbed.clone() else {
                // Without a scrubbed description the text may not leave the
                // process; the stage is skipped, not failed.
                self.record_skipped(ticket.id, batch_id, Stage::LlmAnalysis, "pii scrub failed")
                    .await?;
                return Ok::<Option<StageResult<LlmAnalysis>>, StageError>(None);
            };
            let spec = StageSpec::new(
                Stage::LlmAnalysis,
                timeouts.llm_attempt(),
                timeouts.llm_wall(),
            );
            let run = self
                .runner
                .run(
                    ticket.id,
                    batch_id,
                    spec,
                    &cancel,
                    |_| {
                        let analyzer = self.ports.analyzer.clone();
                        let gate = gates.llm.clone();
                        let text = text.clone();
                        async move {
                            let _permit = gate
                                .acquire_owned()
                                .await
                                .map_err(|_| StageError::Cancelled)?;
                            analyzer.analyze(&text).await.map_err(StageError::from)
                        }
                    },
                    |a: &LlmAnalysis| {
                        let mut data = serde_json::Map::new();
                        data.insert("detected_type".into(), json!(a.detected_type.to_string()));
                        data.insert("language".into(), json!(a.language));
                        data.insert("sentiment".into(), json!(a.sentiment.to_string()));
                        data
                    },
                )
                .await?;
            Ok(Some(run))
        };

        let geo_fut = async {
            if ticket.address.is_empty() {
                self.record_skipped(ticket.id, batch_id, Stage::Geocode, "no address fragments")
                    .await?;
                return Ok::<Option<StageResult<ResolvedLocation>>, StageError>(None);
            }
            let spec = StageSpec::new(
                Stage::Geocode,
                timeouts.geocode_attempt(),
                timeouts.geocode_wall(),
            );
            let run = self
                .runner
                .run(
                    ticket.id,
                    batch_id,
                    spec,
                    &cancel,
                    |_| {
                        let resolver = resolver.clone();
                        let gate = gates.geocode.clone();
                        let address = ticket.address.clone();
                        async move {
                            let _permit = gate
                                .acquire_owned()
                                .await
                                .map_err(|_| StageError::Cancelled)?;
                            resolver.resolve(&address).await.map_err(StageError::from)
                        }
                    },
                    |loc: &ResolvedLocation| {
                        let mut data = serde_json::Map::new();
                        data.insert("status".into(), json!(loc.status));
                        data.insert("lat".into(), json!(loc.point.lat));
                        data.insert("lon".into(), json!(loc.point.lon));
                        if let Some(p) = &loc.provider {
                            data.insert("provider".into(), json!(p));
                        }
                        data
                    },
                )
                .await?;
            Ok(Some(run))
        };

        let (llm_run, geo_run) = tokio::join!(llm_fut, geo_fut);
        let llm_run = llm_run?;
        let geo_run = geo_run?;

        // Join with documented defaults for whatever failed.
        let mut analysis = match llm_run {
            Some(StageResult::Completed(a)) => {
                let summary = match self.ports.vault.rehydrate(ticket.id, &a.summary).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(ticket = %ticket.id, error = %e, "summary rehydration failed");
                        a.summary.clone()
                    }
                };
                Analysis {
                    detected_type: a.detected_type,
                    language: a.language,
                    is_mixed: a.is_mixed,
                    sentiment: a.sentiment,
                    sentiment_confidence: a.sentiment_confidence,
                    summary,
                    anomaly_flags: a.anomaly_flags,
                    ..Analysis::default()
                }
            }
            Some(StageResult::Failed(_)) => {
                failed_stages.push(Stage::LlmAnalysis);
                Analysis::default()
            }
            _ => Analysis::default(),
        };

        let location = match geo_run {
            Some(StageResult::Completed(loc)) => Some(loc),
            Some(StageResult::Failed(_)) => {
                failed_stages.push(Stage::Geocode);
                None
            }
            _ => None,
        };

        // 4. Priority.
        let priority_spec = StageSpec::new(Stage::Priority, LOCAL_ATTEMPT, LOCAL_WALL);
        let score_run = self
            .runner
            .run(
                ticket.id,
                batch_id,
                priority_spec,
                &cancel,
                |_| {
                    let ticket = ticket.clone();
                    let analysis = analysis.clone();
                    let policies = self.policies.clone();
                    async move {
                        Ok(score_ticket(
                            &ticket,
                            &analysis,
                            &policies.scoring,
                            total_rows,
                        ))
                    }
                },
                |s: &deskrail_routing::PriorityScore| {
                    let mut data = serde_json::Map::new();
                    data.insert("priority".into(), json!(s.value));
                    data
                },
            )
            .await?;

        match score_run {
            StageResult::Completed(score) => {
                analysis.priority_base = score.base;
                analysis.priority_extra = score.extra;
                analysis.priority_final = score.value;
                analysis.priority_breakdown = score.breakdown;
            }
            StageResult::Failed(_) => {
                failed_stages.push(Stage::Priority);
                analysis.priority_final = self.policies.scoring.floor;
            }
            StageResult::AlreadyDone(_) => {}
        }

        Ok(EnrichedTicket {
            ticket,
            verdict,
            analysis: Some(analysis),
            location,
            failed_stages,
        })
    }

    // ── Deferred routing phase ──────────────────────────────────────

    async fn route_batch(
        &self,
        batch_id: BatchId,
        enriched: &[EnrichedTicket],
        input: &BatchInput,
        cancel: &CancellationToken,
    ) -> Result<Vec<Assignment>, StageError> {
        let routing_inputs: Vec<RoutingTicket> = enriched
            .iter()
            .filter(|e| !e.verdict.is_spam)
            .filter_map(|e| {
                let analysis = e.analysis.as_ref()?;
                Some(RoutingTicket {
                    ticket_id: e.ticket.id,
                    row_index: e.ticket.row_index,
                    segment: e.ticket.segment,
                    detected_type: analysis.detected_type,
                    language: analysis.language.clone(),
                    priority_final: analysis.priority_final,
                    coordinates: e.location.as_ref().and_then(|l| l.routable_point()),
                })
            })
            .collect();

        let engine = RoutingEngine::new(self.policies.routing.clone(), self.ledger.clone());
        let mut assignments = Vec::new();

        // The engine already processed tickets by descending priority; here
        // each decision just gets its outcome row and events.
        for (ticket_id, result) in
            engine.route_batch(&routing_inputs, &input.agents, &input.offices)
        {
            if cancel.is_cancelled() {
                let outcome = StageOutcome::in_progress(ticket_id, batch_id, Stage::Routing)
                    .with_error("cancelled")
                    .finish(StageStatus::Failed);
                self.record(outcome).await?;
                self.bus.publish(
                    &StageEvent::ticket(ticket_id, batch_id, Stage::Routing, StageStatus::Failed)
                        .with_message("cancelled"),
                );
                continue;
            }

            let outcome = StageOutcome::in_progress(ticket_id, batch_id, Stage::Routing);
            self.bus.publish(&StageEvent::ticket(
                ticket_id,
                batch_id,
                Stage::Routing,
                StageStatus::InProgress,
            ));

            match result {
                Ok(assignment) => {
                    self.record(
                        outcome
                            .with_message(assignment.explanation.clone())
                            .finish(StageStatus::Completed),
                    )
                    .await?;
                    self.bus.publish(
                        &StageEvent::ticket(
                            ticket_id,
                            batch_id,
                            Stage::Routing,
                            StageStatus::Completed,
                        )
                        .with_entry("agent_id", assignment.agent_id.clone())
                        .with_entry("office_id", assignment.office_id.clone())
                        .with_message(assignment.explanation.clone()),
                    );
                    assignments.push(assignment);
                }
                Err(failure) => {
                    warn!(ticket = %ticket_id, "routing failed: {failure}");
                    self.record(
                        outcome
                            .with_error(failure.to_string())
                            .finish(StageStatus::Failed),
                    )
                    .await?;
                    self.bus.publish(
                        &StageEvent::ticket(
                            ticket_id,
                            batch_id,
                            Stage::Routing,
                            StageStatus::Failed,
                        )
                        .with_message(failure.to_string()),
                    );
                }
            }
        }

        Ok(assignments)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn build_report(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        enriched: &[EnrichedTicket],
        assignments: &[Assignment],
    ) -> BatchReport {
        let results: Vec<TicketResult> = enriched
            .iter()
            .map(|e| {
                let assignment = assignments
                    .iter()
                    .find(|a| a.ticket_id == e.ticket.id)
                    .cloned();
                let status = if e.verdict.is_spam {
                    TicketStatus::Spam
                } else if assignment.is_some() {
                    TicketStatus::Routed
                } else {
                    TicketStatus::Unrouted
                };
                TicketResult {
                    ticket_id: e.ticket.id,
                    row_index: e.ticket.row_index,
                    status,
                    is_spam: e.verdict.is_spam,
                    spam_probability: e.verdict.probability,
                    priority_final: e.analysis.as_ref().map(|a| a.priority_final),
                    assignment,
                    failed_stages: e.failed_stages.clone(),
                }
            })
            .collect();

        let spam = results.iter().filter(|r| r.is_spam).count() as u32;
        let routed = results
            .iter()
            .filter(|r| r.status == TicketStatus::Routed)
            .count() as u32;
        let enriched_count = results.iter().filter(|r| !r.is_spam).count() as u32;
        let failed = enriched_count - routed;

        BatchReport {
            batch_id,
            status,
            total: results.len() as u32,
            spam,
            enriched: enriched_count,
            routed,
            failed,
            results,
        }
    }

    async fn fail_batch(
        &self,
        batch_id: BatchId,
        progress: &Arc<RwLock<BatchProgress>>,
        reason: &str,
    ) {
        error!(batch = %batch_id, reason, "batch failed");
        self.bus
            .publish(&StageEvent::batch(batch_id, StageStatus::Failed).with_message(reason));
        let mut p = progress.write().await;
        p.status = BatchStatus::Failed;
        p.current = None;
    }

    async fn record_skipped(
        &self,
        ticket_id: TicketId,
        batch_id: BatchId,
        stage: Stage,
        reason: &str,
    ) -> Result<(), StageError> {
        self.record(
            StageOutcome::in_progress(ticket_id, batch_id, stage)
                .with_message(reason)
                .finish(StageStatus::Skipped),
        )
        .await?;
        self.bus.publish(
            &StageEvent::ticket(ticket_id, batch_id, stage, StageStatus::Skipped)
                .with_message(reason),
        );
        Ok(())
    }

    async fn record(&self, outcome: StageOutcome) -> Result<(), StageError> {
        let db_timeout = Duration::from_secs(self.policies.timeouts.db_write_secs);
        match tokio::time::timeout(db_timeout, self.store.record(outcome)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StageError::fatal(format!("progress store write: {e}"))),
            Err(_) => Err(StageError::fatal("progress store write timed out")),
        }
    }
}
