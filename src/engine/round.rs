//! Round engine: the betting clock and round lifecycle.
//!
//! One `RoundState` lives behind a tokio `RwLock`. The clock driver is the
//! only writer; bet admission holds a read guard from its "is open" check
//! until the bet row is written. Closing the window takes the write lock,
//! so every bet admitted before the flip is in the ledger by the time
//! settlement fetches the period's bets.
//!
//! Ticks are serialized by `tick_lock`. A tick that reaches zero runs the
//! whole closing sequence before returning, so the driver only ever stops
//! between complete ticks.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock, RwLockReadGuard};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::outcome::{uniform_source, OutcomeSource};
use super::reconcile::{ReconcileReport, Reconciler};
use super::settlement::SettlementProcessor;
use crate::config::AppConfig;
use crate::notify::{ConnectionHub, Notifier};
use crate::storage::{bounded, Ledger, LedgerError};
use crate::types::{OutcomeValue, Round, RoundResult, RoundSnapshot, ServerMessage, UserId};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Ticks in one betting window.
    pub window_secs: u32,
    pub history_limit: usize,
    pub persist_retries: u32,
    pub ledger_timeout: Duration,
    /// Pause between round-persistence attempts, multiplied by the attempt.
    pub retry_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            history_limit: 20,
            persist_retries: 3,
            ledger_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            window_secs: cfg.game.window_secs,
            history_limit: cfg.game.history_limit,
            persist_retries: cfg.game.persist_retries,
            ledger_timeout: cfg.ledger_timeout(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Round state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundState {
    pub period: String,
    pub seconds_remaining: u32,
    pub betting_open: bool,
    /// Newest first.
    pub last_results: Vec<RoundResult>,
}

impl RoundState {
    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            period: self.period.clone(),
            seconds_remaining: self.seconds_remaining,
            betting_open: self.betting_open,
            recent_rounds: self.last_results.clone(),
        }
    }
}

/// Issues period ids: a 14-digit UTC timestamp plus a 3-digit sequence,
/// always strictly greater than the last one issued or resumed from.
#[derive(Debug, Clone, Default)]
pub struct PeriodGenerator {
    last: Option<String>,
}

impl PeriodGenerator {
    pub fn resume_after(last: Option<String>) -> Self {
        Self { last }
    }

    pub fn next_at(&mut self, now: DateTime<Utc>) -> String {
        let mut candidate = format!("{}000", now.format("%Y%m%d%H%M%S"));
        if let Some(last) = &self.last {
            if candidate <= *last {
                candidate = match last.parse::<u64>() {
                    Ok(n) if last.len() == 17 => format!("{:017}", n + 1),
                    _ => format!("{last}001"),
                };
            }
        }
        self.last = Some(candidate.clone());
        candidate
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct RoundEngine {
    state: RwLock<RoundState>,
    tick_lock: Mutex<()>,
    periods: StdMutex<PeriodGenerator>,
    source: StdMutex<OutcomeSource>,
    ledger: Arc<dyn Ledger>,
    hub: Arc<ConnectionHub>,
    settlement: SettlementProcessor,
    reconciler: Reconciler,
    settings: EngineSettings,
    needs_sweep: AtomicBool,
    /// Closed periods whose round write failed, with the outcome drawn.
    unrecorded: StdMutex<Vec<(String, OutcomeValue)>>,
}

impl RoundEngine {
    /// Engine drawing outcomes from an OS-seeded RNG.
    pub async fn new(
        settings: EngineSettings,
        ledger: Arc<dyn Ledger>,
        hub: Arc<ConnectionHub>,
    ) -> Result<Self, LedgerError> {
        Self::with_source(settings, ledger, hub, uniform_source(StdRng::from_entropy())).await
    }

    /// Engine with an explicit outcome source. Loads recent history and
    /// opens the first round after the newest known period.
    pub async fn with_source(
        settings: EngineSettings,
        ledger: Arc<dyn Ledger>,
        hub: Arc<ConnectionHub>,
        source: OutcomeSource,
    ) -> Result<Self, LedgerError> {
        let timeout = settings.ledger_timeout;
        let recent = bounded(timeout, ledger.get_recent_rounds(settings.history_limit)).await?;
        let pending = bounded(timeout, ledger.get_pending_periods()).await?;

        let newest = recent.iter().map(|r| r.period.clone()).chain(pending).max();
        let mut periods = PeriodGenerator::resume_after(newest);
        let period = periods.next_at(Utc::now());

        let notifier: Arc<dyn Notifier> = hub.clone();
        let settlement = SettlementProcessor::new(ledger.clone(), notifier, timeout);
        let reconciler = Reconciler::new(ledger.clone(), settlement.clone(), timeout);

        info!(%period, window = settings.window_secs, history = recent.len(), "Round engine ready");

        Ok(Self {
            state: RwLock::new(RoundState {
                period,
                seconds_remaining: settings.window_secs,
                betting_open: true,
                last_results: recent.iter().map(RoundResult::from).collect(),
            }),
            tick_lock: Mutex::new(()),
            periods: StdMutex::new(periods),
            source: StdMutex::new(source),
            ledger,
            hub,
            settlement,
            reconciler,
            settings,
            needs_sweep: AtomicBool::new(false),
            unrecorded: StdMutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub async fn snapshot(&self) -> RoundSnapshot {
        self.state.read().await.snapshot()
    }

    /// Register a connection. Its queue starts with the current snapshot,
    /// ahead of any later broadcast.
    pub async fn subscribe(
        &self,
        conn_id: Uuid,
        user_id: Option<UserId>,
    ) -> mpsc::Receiver<ServerMessage> {
        let state = self.state.read().await;
        let rx = self.hub.subscribe(conn_id, user_id);
        self.hub
            .send_to(conn_id, ServerMessage::RoundSnapshot(state.snapshot()));
        rx
    }

    pub fn unsubscribe(&self, conn_id: Uuid) -> bool {
        self.hub.unsubscribe(conn_id)
    }

    /// A read guard on the state if betting is open. While the guard is
    /// held the window cannot close, so the period it shows is the one
    /// settlement will run for.
    pub async fn admission(&self) -> Option<RwLockReadGuard<'_, RoundState>> {
        let state = self.state.read().await;
        if state.betting_open {
            Some(state)
        } else {
            None
        }
    }

    /// Close the betting window now. The next tick runs the closing sequence.
    pub async fn halt_betting(&self) {
        let mut state = self.state.write().await;
        if state.betting_open {
            state.betting_open = false;
            info!(period = %state.period, "Betting halted");
        }
    }

    /// Advance the clock one unit. Broadcasts the snapshot every tick; when
    /// the window is closed, settles the round and opens the next one.
    /// Returns the state as of the end of the tick.
    pub async fn tick(&self) -> RoundSnapshot {
        let _serial = self.tick_lock.lock().await;

        let snapshot = {
            let mut state = self.state.write().await;
            if state.betting_open {
                state.seconds_remaining = state.seconds_remaining.saturating_sub(1);
                if state.seconds_remaining == 0 {
                    state.betting_open = false;
                    debug!(period = %state.period, "Betting window closed");
                }
            }
            state.snapshot()
        };
        self.hub
            .broadcast_all(ServerMessage::RoundSnapshot(snapshot.clone()));

        if snapshot.betting_open {
            return snapshot;
        }
        self.closing_sequence(&snapshot.period).await
    }

    /// Draw, record, settle, announce, then open the next round.
    async fn closing_sequence(&self, period: &str) -> RoundSnapshot {
        let outcome = self.draw();
        let recorded = self.persist_round(period, outcome).await;

        match &recorded {
            Some(round) => {
                match self.settlement.settle(round).await {
                    Ok(report) if report.is_complete() => {}
                    Ok(report) => {
                        warn!(%period, failed = report.failed, "Some bets left pending");
                    }
                    Err(e) => error!(%period, error = %e, "Settlement could not start"),
                }
                self.hub
                    .broadcast_all(ServerMessage::RoundResult(RoundResult::from(round)));
            }
            None => {
                // Nothing announced. The sweep keeps retrying this write.
                error!(%period, %outcome, "Round record not persisted, period left for reconciliation");
                self.unrecorded
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((period.to_string(), outcome));
            }
        }

        let history = match bounded(
            self.settings.ledger_timeout,
            self.ledger.get_recent_rounds(self.settings.history_limit),
        )
        .await
        {
            Ok(rounds) => Some(rounds.iter().map(RoundResult::from).collect::<Vec<_>>()),
            Err(e) => {
                warn!(error = %e, "Could not reload round history");
                None
            }
        };

        let next = self
            .periods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_at(Utc::now());

        let snapshot = {
            let mut state = self.state.write().await;
            match history {
                Some(results) => state.last_results = results,
                None => {
                    if let Some(round) = &recorded {
                        state.last_results.insert(0, RoundResult::from(round));
                        state.last_results.truncate(self.settings.history_limit);
                    }
                }
            }
            state.period = next;
            state.seconds_remaining = self.settings.window_secs;
            state.betting_open = true;
            state.snapshot()
        };

        info!(
            closed = %period,
            %outcome,
            recorded = recorded.is_some(),
            next = %snapshot.period,
            "Round closed, next round open"
        );
        self.hub
            .broadcast_all(ServerMessage::RoundSnapshot(snapshot.clone()));

        // Bets whose write outlived an admission timeout can land after
        // settlement fetched the period, so every close sweeps.
        if let Err(e) = self.sweep(&snapshot.period).await {
            warn!(error = %e, "Reconciliation sweep failed, will retry next round");
        }
        snapshot
    }

    /// Record the round, retrying a bounded number of times.
    async fn persist_round(&self, period: &str, outcome: OutcomeValue) -> Option<Round> {
        let timeout = self.settings.ledger_timeout;
        let attempts = self.settings.persist_retries.max(1);

        for attempt in 1..=attempts {
            match bounded(timeout, self.ledger.create_round(period, outcome)).await {
                Ok(round) => return Some(round),
                Err(LedgerError::DuplicatePeriod(_)) => {
                    // An earlier attempt committed after timing out.
                    if let Ok(Some(round)) =
                        bounded(timeout, self.ledger.get_round_by_period(period)).await
                    {
                        return Some(round);
                    }
                    warn!(%period, attempt, "Period exists but could not be read back");
                }
                Err(e) => warn!(%period, attempt, error = %e, "Round persistence failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_backoff * attempt).await;
            }
        }
        None
    }

    /// Resolve pending bets left behind by earlier rounds.
    pub async fn reconcile(&self) -> Result<ReconcileReport, LedgerError> {
        let _serial = self.tick_lock.lock().await;
        let live = self.state.read().await.period.clone();
        self.sweep(&live).await
    }

    /// Caller holds `tick_lock`. Writes rounds that earlier closes failed to
    /// record, then settles pending bets of every period but `live`.
    async fn sweep(&self, live: &str) -> Result<ReconcileReport, LedgerError> {
        let backfilled = self.record_unrecorded().await;
        let report = self.reconciler.sweep(Some(live), || self.draw()).await;

        let backlog = !self
            .unrecorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty();
        let clean = matches!(&report, Ok(r) if r.is_clean()) && !backlog;
        self.needs_sweep.store(!clean, Ordering::SeqCst);

        if backfilled > 0 || matches!(&report, Ok(r) if r.rounds_redrawn > 0) {
            self.refresh_history().await;
        }
        report
    }

    /// Retry round writes that failed during earlier closes, keeping the
    /// outcome drawn at the time. Returns how many are now recorded.
    async fn record_unrecorded(&self) -> usize {
        let backlog = self
            .unrecorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if backlog.is_empty() {
            return 0;
        }

        let mut recorded = Vec::new();
        for (period, outcome) in backlog {
            match bounded(self.settings.ledger_timeout, self.ledger.create_round(&period, outcome)).await {
                Ok(_) => {
                    info!(%period, %outcome, "Late round record written");
                    recorded.push(period);
                }
                Err(LedgerError::DuplicatePeriod(_)) => recorded.push(period),
                Err(e) => warn!(%period, error = %e, "Round record still not persisted"),
            }
        }

        self.unrecorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(period, _)| !recorded.contains(period));
        recorded.len()
    }

    async fn refresh_history(&self) {
        match bounded(
            self.settings.ledger_timeout,
            self.ledger.get_recent_rounds(self.settings.history_limit),
        )
        .await
        {
            Ok(rounds) => {
                self.state.write().await.last_results =
                    rounds.iter().map(RoundResult::from).collect();
            }
            Err(e) => warn!(error = %e, "Could not reload round history"),
        }
    }

    /// Whether the last sweep left work for the next close: pending bets it
    /// could not settle, or round records still unwritten.
    pub fn sweep_pending(&self) -> bool {
        self.needs_sweep.load(Ordering::SeqCst)
    }

    fn draw(&self) -> OutcomeValue {
        let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        (&mut *source)()
    }

    /// Drive `tick` at `interval` until `shutdown` flips to true. Shutdown
    /// is only observed between ticks.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        info!(interval_ms = interval.as_millis() as u64, "Clock driver started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Clock driver stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
