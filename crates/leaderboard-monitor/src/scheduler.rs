use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use leaderboard_core::{now_unix_millis, PlayerStore, RankingSource, SharedStore, StoreError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::reconcile::{run_pass, PassOutcome};

const SECONDS_PER_MINUTE: u64 = 60;

#[derive(Debug, Default)]
struct PassStats {
    passes: AtomicU64,
    failed: AtomicU64,
    last_outcome: Mutex<Option<PassOutcome>>,
}

impl PassStats {
    fn record(&self, outcome: PassOutcome) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        if !outcome.is_completed() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut last) = self.last_outcome.lock() {
            *last = Some(outcome);
        }
    }
}

/// Runs a reconciliation pass immediately and then once per period.
///
/// Passes execute one at a time on a single task; a pass that outlives the
/// period delays the next one instead of overlapping it. Must be started
/// from within a Tokio runtime.
#[derive(Debug)]
pub struct Scheduler<S> {
    token: CancellationToken,
    task: JoinHandle<()>,
    store: SharedStore<S>,
    stats: Arc<PassStats>,
}

impl<S> Scheduler<S>
where
    S: PlayerStore + Send + 'static,
{
    pub fn start_minutes<R>(store: SharedStore<S>, source: Arc<R>, interval_minutes: u64) -> Self
    where
        R: RankingSource + Send + Sync + 'static,
    {
        tracing::info!(interval_minutes, "starting leaderboard monitor");
        let period = Duration::from_secs(interval_minutes.saturating_mul(SECONDS_PER_MINUTE));
        Self::start(store, source, period)
    }

    /// A zero `period` is raised to one millisecond.
    pub fn start<R>(store: SharedStore<S>, source: Arc<R>, period: Duration) -> Self
    where
        R: RankingSource + Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        let stats = Arc::new(PassStats::default());
        let task = tokio::spawn(poll_loop(
            store.clone(),
            source,
            period.max(Duration::from_millis(1)),
            token.clone(),
            Arc::clone(&stats),
        ));
        Self { token, task, store, stats }
    }

    #[must_use]
    pub fn passes_run(&self) -> u64 {
        self.stats.passes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn passes_failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_outcome(&self) -> Option<PassOutcome> {
        self.stats.last_outcome.lock().ok().and_then(|last| last.clone())
    }

    /// Cancels future passes, waits for an in-flight pass to finish, then
    /// closes the store.
    ///
    /// # Errors
    /// Returns the store's close error.
    pub async fn stop(self) -> Result<(), StoreError> {
        self.token.cancel();
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "leaderboard monitor task ended abnormally");
        }
        if self.store.close()? {
            tracing::info!("leaderboard store closed");
        }
        Ok(())
    }
}

async fn poll_loop<S, R>(
    store: SharedStore<S>,
    source: Arc<R>,
    period: Duration,
    token: CancellationToken,
    stats: Arc<PassStats>,
) where
    S: PlayerStore + Send + 'static,
    R: RankingSource + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let pass_store = store.clone();
        let pass_source = Arc::clone(&source);
        let joined = tokio::task::spawn_blocking(move || {
            run_pass(pass_source.as_ref(), &pass_store, now_unix_millis)
        })
        .await;

        match joined {
            Ok(outcome) => {
                outcome.log();
                stats.record(outcome);
            }
            Err(err) => {
                tracing::error!(error = %err, "leaderboard update panicked");
                stats.passes.fetch_add(1, Ordering::Relaxed);
                stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    tracing::info!("leaderboard monitor stopped");
}
