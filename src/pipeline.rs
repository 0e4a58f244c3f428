// =============================================================================
// Pipeline wiring — five phases over bounded channels
// =============================================================================
//
//   P1 ticks -> bars -> frames -> candidates
//   P2 candidates -> vetted (worker pool)
//   P3 vetted -> decisions (worker pool, per-symbol locks)
//   P4 decisions -> notifications -> sink (dispatcher)
//   P5 outcomes -> parameter versions (store subscriptions back to P1/P3)
//
// Every inter-phase queue is bounded. Shutdown flips a watch flag: the tick
// pump stops first, sender drops ripple down the channels, and each phase
// drains what it already holds before exiting.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::indicators::IndicatorGraph;
use crate::learning::history::SignalHistory;
use crate::learning::AdaptiveLearner;
use crate::market_data::{ExchangeFeed, FeedSupervisor, FrameBuffer};
use crate::metrics::PipelineMetrics;
use crate::output::queue::{EnqueueOutcome, NotificationQueue};
use crate::output::{Dispatcher, NotificationBody, NotificationEnvelope, NotificationSink};
use crate::params::ParameterStore;
use crate::policy::book::PositionBook;
use crate::policy::ExecutionPolicy;
use crate::prefilter::{PreEvaluator, VettedCandidate};
use crate::signal_gen::strategies::StrategyRegistry;
use crate::signal_gen::SignalGenerator;
use crate::types::{
    ExecutionDecision, OutcomeRecord, PositionEvent, PriorityBand, SignalCandidate, Verdict,
};

/// What P3 hands to P4: the decision plus the candidate it concerned.
#[derive(Debug, Clone)]
pub struct DecisionNotice {
    pub decision: ExecutionDecision,
    pub candidate: SignalCandidate,
    pub composite: f64,
}

/// The assembled pipeline. Construction is cheap; `run` spawns the phase
/// tasks.
pub struct Pipeline {
    pub cfg: PipelineConfig,
    pub metrics: Arc<PipelineMetrics>,
    pub params: Arc<ParameterStore>,
    pub frames: Arc<FrameBuffer>,
    pub generator: Arc<SignalGenerator>,
    pub preeval: Arc<PreEvaluator>,
    pub policy: Arc<ExecutionPolicy>,
    pub queue: Arc<NotificationQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub learner: Arc<AdaptiveLearner>,
    shutdown_tx: watch::Sender<bool>,
    /// External outcome ingress, live while `run` is active.
    outcome_tx: Mutex<Option<mpsc::Sender<OutcomeRecord>>>,
}

impl Pipeline {
    /// Assemble every phase. A `data_dir` that cannot be opened is a
    /// startup-fatal error: the operator must intervene.
    pub fn build(cfg: PipelineConfig, sink: Arc<dyn NotificationSink>) -> Result<Self> {
        let metrics = Arc::new(PipelineMetrics::new());

        let (params, book, history) = if cfg.data_dir.is_empty() {
            (
                Arc::new(ParameterStore::in_memory()),
                Arc::new(PositionBook::in_memory()),
                Arc::new(SignalHistory::in_memory()),
            )
        } else {
            (
                Arc::new(
                    ParameterStore::open(&cfg.data_dir)
                        .context("parameter store unreachable at startup")?,
                ),
                Arc::new(
                    PositionBook::open(&cfg.data_dir)
                        .context("position journal unreachable at startup")?,
                ),
                Arc::new(
                    SignalHistory::open(&cfg.data_dir)
                        .context("outcome log unreachable at startup")?,
                ),
            )
        };

        let frames = Arc::new(FrameBuffer::new(cfg.ingest.frame_ring_bars));
        let generator = Arc::new(SignalGenerator::new(
            cfg.clone(),
            IndicatorGraph::standard(),
            StrategyRegistry::standard(),
            frames.clone(),
            params.clone(),
            metrics.clone(),
        ));
        let preeval = Arc::new(PreEvaluator::new(
            cfg.preeval.clone(),
            params.clone(),
            metrics.clone(),
        ));
        let policy = Arc::new(ExecutionPolicy::new(
            cfg.policy.clone(),
            book,
            params.clone(),
            metrics.clone(),
        ));
        let queue = Arc::new(NotificationQueue::new(metrics.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            cfg.output.clone(),
            queue.clone(),
            sink,
            metrics.clone(),
        ));
        let learner = Arc::new(AdaptiveLearner::new(
            cfg.learning.clone(),
            history,
            params.clone(),
            metrics.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            cfg,
            metrics,
            params,
            frames,
            generator,
            preeval,
            policy,
            queue,
            dispatcher,
            learner,
            shutdown_tx,
            outcome_tx: Mutex::new(None),
        })
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Begin the top-down drain: P1 stops accepting ticks first.
    pub fn shutdown(&self) {
        info!("pipeline shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// External outcome ingress (`onOutcome` from the execution
    /// collaborator). Falls back to direct recording when `run` is not
    /// active.
    pub fn record_outcome(&self, outcome: OutcomeRecord) {
        let sender = self.outcome_tx.lock().clone();
        match sender {
            Some(tx) => {
                if tx.try_send(outcome).is_err() {
                    self.metrics.bump_reason("outcome_overflow");
                }
            }
            None => {
                let now_ms = Utc::now().timestamp_millis();
                self.learner.record(outcome, now_ms);
            }
        }
    }

    /// External position-event ingress from the execution collaborator.
    pub fn position_event(&self, event: &PositionEvent) {
        if let PositionEvent::PriceUpdate { symbol, price, .. } = event {
            for (position_id, reason) in self.policy.evaluate_price(symbol, *price) {
                debug!(position = %position_id, %reason, "exit level crossed");
            }
        }
        if let Some(outcome) = self.policy.on_position_event(event) {
            self.record_outcome(outcome);
        }
    }

    /// Build the notification envelope for a decision and enqueue it under
    /// the band rules. IGNORE verdicts are notified only at CRITICAL band.
    pub fn enqueue_decision(&self, notice: &DecisionNotice, now_ms: i64) -> Option<EnqueueOutcome> {
        let candidate = &notice.candidate;
        let decision = &notice.decision;

        if decision.verdict == Verdict::Ignore && candidate.band != PriorityBand::Critical {
            return None;
        }
        debug!(
            candidate = %candidate.id,
            verdict = %decision.verdict,
            composite = notice.composite,
            band = %candidate.band,
            "notification considered"
        );

        let envelope = NotificationEnvelope {
            recipient: "operators".to_string(),
            subject: format!(
                "{} {} {}",
                candidate.symbol, candidate.direction, decision.verdict
            ),
            body: NotificationBody {
                symbol: candidate.symbol.clone(),
                direction: candidate.direction,
                entry: candidate.entry_price,
                stop_loss: decision.stop_loss,
                take_profit: decision.take_profit,
                confidence: candidate.confidence,
                rationale: decision.rationale.to_string(),
                emitted_at_ms: candidate.emitted_at_ms,
            },
            band: candidate.band,
        };

        Some(self.queue.enqueue(
            &candidate.id,
            candidate.strength,
            candidate.emitted_at_ms,
            candidate.expires_at_ms,
            envelope,
            now_ms,
        ))
    }

    // -------------------------------------------------------------------
    // run
    // -------------------------------------------------------------------

    /// Spawn every phase task. Returns once the exchange quorum is healthy;
    /// the tasks run until `shutdown`.
    pub async fn run(
        self: Arc<Self>,
        feeds: Vec<Arc<dyn ExchangeFeed>>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let shutdown = self.shutdown_signal();

        let supervisor = Arc::new(FeedSupervisor::new(
            feeds,
            self.cfg.ingest.clone(),
            self.metrics.clone(),
        ));

        let (tick_tx, tick_rx) = mpsc::channel(self.cfg.queues.ticks);
        let (cand_tx, cand_rx) = mpsc::channel::<SignalCandidate>(self.cfg.queues.candidates);
        let (vet_tx, vet_rx) = mpsc::channel::<VettedCandidate>(self.cfg.queues.vetted);
        let (dec_tx, dec_rx) = mpsc::channel::<DecisionNotice>(self.cfg.queues.decisions);
        let (outcome_tx, outcome_rx) = mpsc::channel::<OutcomeRecord>(self.cfg.queues.outcomes);
        *self.outcome_tx.lock() = Some(outcome_tx);

        let mut handles = supervisor.clone().spawn(tick_tx, shutdown.clone());

        // Startup gate: fewer healthy exchanges than the quorum is fatal.
        supervisor.await_quorum().await.map_err(|e| {
            anyhow::anyhow!("{e}")
        })?;

        handles.push(self.clone().spawn_tick_pump(tick_rx, cand_tx.clone(), vet_tx.clone(), shutdown.clone()));
        handles.extend(self.clone().spawn_preeval_pool(cand_rx, vet_tx.clone(), shutdown.clone()));
        handles.extend(self.clone().spawn_policy_pool(vet_rx, dec_tx, shutdown.clone()));
        handles.push(self.clone().spawn_output(dec_rx, shutdown.clone()));
        handles.push(self.clone().spawn_dispatcher(shutdown.clone()));
        handles.push(self.clone().spawn_learning(outcome_rx, shutdown.clone()));
        handles.push(self.clone().spawn_timers(supervisor, cand_tx, vet_tx, shutdown));

        info!("pipeline running");
        Ok(handles)
    }

    fn spawn_tick_pump(
        self: Arc<Self>,
        mut tick_rx: mpsc::Receiver<crate::types::MarketTick>,
        cand_tx: mpsc::Sender<SignalCandidate>,
        vet_tx: mpsc::Sender<VettedCandidate>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pipeline = self;
        tokio::spawn(async move {
            loop {
                let tick = tokio::select! {
                    maybe = tick_rx.recv() => match maybe {
                        Some(tick) => tick,
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                let candidates = pipeline.generator.handle_tick(&tick);
                pipeline.forward_candidates(candidates, &cand_tx).await;
                pipeline.observe_closed_bars(&vet_tx).await;
            }
            debug!("tick pump drained");
        })
    }

    async fn forward_candidates(
        &self,
        candidates: Vec<SignalCandidate>,
        cand_tx: &mpsc::Sender<SignalCandidate>,
    ) {
        for candidate in candidates {
            // Bounded send: backpressure from P2 slows emission here rather
            // than the network receive path.
            if cand_tx.send(candidate).await.is_err() {
                break;
            }
        }
        self.metrics.depth_candidates.store(
            (self.cfg.queues.candidates - cand_tx.capacity()) as u64,
            std::sync::atomic::Ordering::Relaxed,
        );
    }

    async fn observe_closed_bars(&self, vet_tx: &mpsc::Sender<VettedCandidate>) {
        let now_ms = Utc::now().timestamp_millis();
        for (key, bar) in self.generator.drain_closed_bars() {
            let promoted = self.preeval.observe_bar(&key.symbol, bar.close, now_ms);
            for vetted in promoted {
                if vet_tx.send(vetted).await.is_err() {
                    return;
                }
            }
        }
    }

    fn spawn_preeval_pool(
        self: Arc<Self>,
        cand_rx: mpsc::Receiver<SignalCandidate>,
        vet_tx: mpsc::Sender<VettedCandidate>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let shared_rx = Arc::new(tokio::sync::Mutex::new(cand_rx));
        let workers = self.cfg.preeval.workers.max(1);
        (0..workers)
            .map(|worker| {
                let pipeline = self.clone();
                let rx = shared_rx.clone();
                let vet_tx = vet_tx.clone();
                let _shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let candidate = {
                            let mut guard = rx.lock().await;
                            guard.recv().await
                        };
                        let Some(candidate) = candidate else { break };

                        // Router load: fraction of the vetted queue in use.
                        let max = pipeline.cfg.queues.vetted.max(1);
                        let load = (max - vet_tx.capacity()) as f64 / max as f64;
                        pipeline.preeval.note_load(load);

                        let started = std::time::Instant::now();
                        let now_ms = Utc::now().timestamp_millis();
                        let result = pipeline.preeval.process(candidate, now_ms);

                        // Hard per-phase budget: shed instead of forwarding.
                        let budget = Duration::from_millis(pipeline.cfg.preeval.phase_budget_ms);
                        if started.elapsed() > budget {
                            pipeline
                                .metrics
                                .deadline_shed
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            pipeline.metrics.bump_reason("deadline_exceeded");
                            continue;
                        }

                        if let Ok(vetted) = result {
                            pipeline.metrics.depth_vetted.store(
                                (max - vet_tx.capacity()) as u64,
                                std::sync::atomic::Ordering::Relaxed,
                            );
                            if vet_tx.send(vetted).await.is_err() {
                                break;
                            }
                        }
                    }
                    debug!(worker, "pre-eval worker drained");
                })
            })
            .collect()
    }

    fn spawn_policy_pool(
        self: Arc<Self>,
        vet_rx: mpsc::Receiver<VettedCandidate>,
        dec_tx: mpsc::Sender<DecisionNotice>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let shared_rx = Arc::new(tokio::sync::Mutex::new(vet_rx));
        let workers = self.cfg.policy.workers.max(1);
        (0..workers)
            .map(|worker| {
                let pipeline = self.clone();
                let rx = shared_rx.clone();
                let dec_tx = dec_tx.clone();
                let _shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let vetted = {
                            let mut guard = rx.lock().await;
                            guard.recv().await
                        };
                        let Some(vetted) = vetted else { break };

                        let now_ms = Utc::now().timestamp_millis();
                        let decision = pipeline.policy.decide(&vetted, now_ms);
                        let notice = DecisionNotice {
                            decision,
                            candidate: vetted.candidate,
                            composite: vetted.composite,
                        };
                        pipeline.metrics.depth_decisions.store(
                            (pipeline.cfg.queues.decisions - dec_tx.capacity()) as u64,
                            std::sync::atomic::Ordering::Relaxed,
                        );
                        if dec_tx.send(notice).await.is_err() {
                            break;
                        }
                    }
                    debug!(worker, "policy worker drained");
                })
            })
            .collect()
    }

    fn spawn_output(
        self: Arc<Self>,
        mut dec_rx: mpsc::Receiver<DecisionNotice>,
        _shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pipeline = self;
        tokio::spawn(async move {
            while let Some(notice) = dec_rx.recv().await {
                let now_ms = Utc::now().timestamp_millis();
                pipeline.enqueue_decision(&notice, now_ms);
            }
            debug!("output enqueue task drained");
        })
    }

    fn spawn_dispatcher(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.run(shutdown).await;
            debug!("dispatcher stopped");
        })
    }

    fn spawn_learning(
        self: Arc<Self>,
        mut outcome_rx: mpsc::Receiver<OutcomeRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pipeline = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = outcome_rx.recv() => {
                        match maybe {
                            Some(outcome) => {
                                let now_ms = Utc::now().timestamp_millis();
                                pipeline.learner.record(outcome, now_ms);
                            }
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            // Flush whatever is already queued, then stop.
                            while let Ok(outcome) = outcome_rx.try_recv() {
                                let now_ms = Utc::now().timestamp_millis();
                                pipeline.learner.record(outcome, now_ms);
                            }
                            break;
                        }
                    }
                }
            }
            debug!("learning task drained");
        })
    }

    /// Housekeeping cadence: quiet-bar flushes, heartbeat sweeps, and
    /// unactivated-position expiry.
    fn spawn_timers(
        self: Arc<Self>,
        supervisor: Arc<FeedSupervisor>,
        cand_tx: mpsc::Sender<SignalCandidate>,
        vet_tx: mpsc::Sender<VettedCandidate>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pipeline = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let now_ms = Utc::now().timestamp_millis();

                let flushed = pipeline.generator.flush(now_ms);
                pipeline.forward_candidates(flushed, &cand_tx).await;
                pipeline.observe_closed_bars(&vet_tx).await;

                let heartbeat_ms = pipeline.cfg.ingest.heartbeat_secs as i64 * 1_000;
                let healthy = supervisor.health().healthy(now_ms, heartbeat_ms).len();
                pipeline.generator.health_sweep(now_ms, healthy);

                for outcome in pipeline.policy.sweep_unactivated(now_ms) {
                    pipeline.record_outcome(outcome);
                }
            }
            warn!("timer task stopped");
        })
    }
}

// ---------------------------------------------------------------------------
// Tests — component-level seed scenarios plus an async smoke run
// ---------------------------------------------------------------------------
