use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::outbox::{Outbox, Transport};
use crate::scheduler::{PauseBarrier, ScopeScheduler};
use crate::spool::{self, Spool};
use crate::types::WorkItem;
use crate::{log_debug, log_error, log_info, log_warn};

// --- Shutdown signal ---

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the
/// shutdown flag. The worker pool converts the flag into the same
/// graceful drain the restart barrier performs.
///
/// Call once at program startup. Subsequent calls are safe
/// (re-registers handlers).
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

// --- Handler seam ---

/// The domain layer that interprets a dispatched item (command
/// parsing, agent invocation, API formatting). Opaque to the
/// pipeline; enables mocking in tests.
pub trait Handler: Send + Sync {
    fn handle(&self, item: WorkItem) -> impl Future<Output = Result<(), String>> + Send;
}

// --- Outcomes ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Journaled and queued for dispatch.
    Enqueued,
    /// Queued for dispatch, but the journal append failed; a crash
    /// before completion loses this item.
    EnqueuedUnjournaled,
    /// Restart barrier active: persisted for the next generation.
    Spooled,
    /// Repeated stop directive during an active barrier.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Cancelled,
    /// Restart barrier satisfied: all lanes empty, nothing running.
    Drained,
}

// --- Pipeline ---

/// The task-dispatch pipeline: spooled ingestion, per-scope
/// serialized dispatch, and outbox flushing, wired to a worker pool.
pub struct Pipeline<T: Transport> {
    scheduler: Arc<ScopeScheduler>,
    spool: Arc<Spool>,
    outbox: Arc<Outbox<T>>,
    restart_pending: AtomicBool,
    pause: Mutex<PauseBarrier>,
    worker_poll: Duration,
    flush_max_ops: usize,
}

impl<T: Transport + 'static> Pipeline<T> {
    pub fn new(config: &RelayConfig, api: T) -> Self {
        let data_dir = Path::new(&config.storage.data_dir);
        Self::from_parts(
            Arc::new(ScopeScheduler::new(
                config.dispatch.max_parallel_jobs as usize,
            )),
            Arc::new(Spool::new(data_dir)),
            Arc::new(Outbox::new(api, data_dir, &config.outbox)),
            config,
        )
    }

    /// Assemble from pre-built components (e.g. an outbox carrying a
    /// side-effect handler).
    pub fn from_parts(
        scheduler: Arc<ScopeScheduler>,
        spool: Arc<Spool>,
        outbox: Arc<Outbox<T>>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            scheduler,
            spool,
            outbox,
            restart_pending: AtomicBool::new(false),
            pause: Mutex::new(PauseBarrier::inactive()),
            worker_poll: Duration::from_secs_f64(config.dispatch.worker_poll_seconds.max(0.05)),
            flush_max_ops: config.outbox.flush_max_ops.max(1),
        }
    }

    pub fn scheduler(&self) -> &Arc<ScopeScheduler> {
        &self.scheduler
    }

    pub fn spool(&self) -> &Arc<Spool> {
        &self.spool
    }

    pub fn outbox(&self) -> &Arc<Outbox<T>> {
        &self.outbox
    }

    // --- Pause barrier ---

    pub fn set_pause(&self, threshold_ts: f64) {
        let mut pause = self.pause.lock().unwrap_or_else(|e| e.into_inner());
        *pause = PauseBarrier::at(threshold_ts);
    }

    pub fn clear_pause(&self) {
        let mut pause = self.pause.lock().unwrap_or_else(|e| e.into_inner());
        *pause = PauseBarrier::inactive();
    }

    /// The barrier passed to dispatch. Ignored while a restart is
    /// pending: it would prevent the queues from draining.
    pub fn pause_barrier(&self) -> PauseBarrier {
        if self.restart_pending() {
            return PauseBarrier::inactive();
        }
        *self.pause.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Restart barrier ---

    /// Activate the graceful-drain barrier: stop dispatching new
    /// inbound work, finish what is queued and running, then let
    /// `run` return `Drained`.
    pub fn request_restart(&self) {
        if !self.restart_pending.swap(true, Ordering::SeqCst) {
            log_info!("Restart barrier active: spooling new work, draining queues");
        }
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_pending.load(Ordering::SeqCst)
    }

    // --- Ingestion ---

    /// Accept one inbound item: journal it, then hand it to the
    /// scheduler, unless a restart is pending, in which case it is
    /// persisted for the next process generation instead.
    ///
    /// A repeated stop directive during an active barrier is dropped
    /// outright; re-spooling it would restart the process again right
    /// after it comes back up.
    pub fn ingest(&self, item: WorkItem, priority: bool) -> Result<IngestOutcome, String> {
        if self.restart_pending() {
            if spool::is_stop_directive(&item) {
                log_debug!("Dropping repeated stop directive from {}", item.scope());
                return Ok(IngestOutcome::Dropped);
            }
            self.spool.append(&item)?;
            return Ok(IngestOutcome::Spooled);
        }

        // Journal first so a crash between here and dispatch cannot
        // lose the item.
        match self.spool.append(&item) {
            Ok(()) => {
                self.scheduler.enqueue(item, priority);
                Ok(IngestOutcome::Enqueued)
            }
            Err(e) => {
                log_warn!("Spool append failed, item continues live-only: {}", e);
                self.scheduler.enqueue(item, priority);
                Ok(IngestOutcome::EnqueuedUnjournaled)
            }
        }
    }

    /// Startup replay: consolidate stale drain files and the live
    /// spool, enqueue everything up to the restart barrier, and
    /// register the drain file for reference-counted cleanup.
    ///
    /// Returns the number of items queued.
    pub fn load_spooled(&self) -> Result<usize, String> {
        let Some(drain) = self.spool.consolidate_for_startup()? else {
            return Ok(0);
        };
        let items = self.spool.load(&drain)?;
        if items.is_empty() {
            // Nothing usable survived filtering; the file is spent.
            if let Err(e) = std::fs::remove_file(&drain) {
                log_debug!("Failed to remove empty drain {}: {}", drain.display(), e);
            }
            return Ok(0);
        }
        let n = items.len();
        for item in items {
            self.scheduler.enqueue(item, false);
        }
        log_info!("Replaying {} spooled item(s) from {}", n, drain.display());
        Ok(n)
    }

    // --- Worker pool ---

    /// Run the worker pool until cancelled or drained for restart.
    ///
    /// Spawns one task per parallel slot; each polls the scheduler,
    /// runs the handler, completes bookkeeping, and flushes the
    /// outbox. The first worker to observe a terminal condition
    /// decides the outcome and the rest are cancelled.
    pub async fn run<H: Handler + 'static>(
        self: Arc<Self>,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let workers = self.scheduler.max_parallel_jobs();
        log_info!("Worker pool started (max_parallel_jobs={})", workers);

        let mut join_set: JoinSet<RunOutcome> = JoinSet::new();
        for worker_id in 0..workers {
            let pipeline = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            join_set
                .spawn(async move { pipeline.worker_loop(worker_id, handler, cancel).await });
        }

        let outcome = match join_set.join_next().await {
            Some(Ok(outcome)) => outcome,
            Some(Err(e)) => {
                log_error!("Worker panicked: {}", e);
                RunOutcome::Cancelled
            }
            None => RunOutcome::Cancelled,
        };
        cancel.cancel();
        while join_set.join_next().await.is_some() {}
        outcome
    }

    async fn worker_loop<H: Handler>(
        &self,
        worker_id: usize,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        loop {
            if cancel.is_cancelled() {
                return RunOutcome::Cancelled;
            }
            if is_shutdown_requested() && !self.restart_pending() {
                log_info!("Shutdown signal received, draining queues");
                self.request_restart();
            }

            if let Some(item) = self.scheduler.try_dispatch_next(self.pause_barrier()) {
                let scope = item.scope();
                let source_token = item.source_token.clone();
                log_debug!(
                    "[worker {}] dispatch {} for {}",
                    worker_id,
                    item.payload.kind(),
                    scope
                );
                if let Err(e) = handler.handle(item).await {
                    log_error!("[worker {}] handler failed for {}: {}", worker_id, scope, e);
                }
                self.scheduler.mark_done(scope);
                if !source_token.is_empty() {
                    self.spool.release(&source_token);
                }
                self.outbox.flush(self.flush_max_ops).await;
                continue;
            }

            // Nothing dispatchable: deliver any due outbox work, then
            // either finish the drain or sleep until woken.
            self.outbox.flush(self.flush_max_ops).await;
            if self.restart_pending() && self.scheduler.is_drained() {
                return RunOutcome::Drained;
            }
            self.scheduler.wait(self.worker_poll).await;
        }
    }
}
