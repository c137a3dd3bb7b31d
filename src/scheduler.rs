use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::types::{now_ts, Scope, WorkItem};

/// Floor for `wait` timeouts so a zero timeout cannot busy-spin.
const MIN_WAIT: Duration = Duration::from_millis(50);

/// How many running items a snapshot summarizes at most.
const MAX_RUNNING_SUMMARIES: usize = 3;

/// Preview length for head-of-lane summaries.
const SUMMARY_PREVIEW_CHARS: usize = 48;

// --- Queue wrappers ---

/// A work item admitted to a lane, stamped with its ordering key.
///
/// `seq` is strictly increasing per scheduler and breaks ties between
/// items sharing an effective timestamp.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub seq: u64,
    pub ts: f64,
    pub item: WorkItem,
}

impl QueuedItem {
    fn scope(&self) -> Scope {
        self.item.scope()
    }
}

#[derive(Debug, Clone)]
struct RunningItem {
    item: QueuedItem,
    #[allow(dead_code)]
    started_ts: f64,
}

/// Returns true when ordering key `a` dispatches before `b`.
/// Strict FIFO within a lane: timestamp ascending, then sequence.
fn key_before(a: (f64, u64), b: (f64, u64)) -> bool {
    match a.0.total_cmp(&b.0) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => a.1 < b.1,
    }
}

/// Index of the lowest-(timestamp, sequence) item whose scope is not
/// already running, or None if every item is scope-blocked.
fn pick_best_eligible<'a, I>(items: I, running: &HashMap<Scope, RunningItem>) -> Option<usize>
where
    I: IntoIterator<Item = &'a QueuedItem>,
{
    let mut best_idx: Option<usize> = None;
    let mut best_key = (0.0_f64, 0_u64);
    for (idx, item) in items.into_iter().enumerate() {
        if running.contains_key(&item.scope()) {
            continue;
        }
        let key = (item.ts, item.seq);
        if best_idx.is_none() || key_before(key, best_key) {
            best_idx = Some(idx);
            best_key = key;
        }
    }
    best_idx
}

// --- Pause barrier ---

/// Dispatch-time pause parameters.
///
/// While active, main-lane items older than the threshold are parked
/// in the paused lane; priority-lane items are exempt. The caller owns
/// the barrier state and passes it to every dispatch attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PauseBarrier {
    pub active: bool,
    pub threshold_ts: f64,
}

impl PauseBarrier {
    pub fn inactive() -> Self {
        Self::default()
    }

    pub fn at(threshold_ts: f64) -> Self {
        Self {
            active: true,
            threshold_ts,
        }
    }

    fn should_pause(&self, item: &QueuedItem) -> bool {
        if !self.active {
            return false;
        }
        // Items with no usable timestamp never pause.
        if item.ts <= 0.0 {
            return false;
        }
        item.ts < self.threshold_ts
    }
}

// --- Snapshots and operator results ---

/// Read-only counts and head-of-lane summaries for observability.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub in_flight: String,
    pub main_n: usize,
    pub prio_n: usize,
    pub paused_n: usize,
    pub main_head: Vec<String>,
    pub prio_head: Vec<String>,
    pub paused_head: Vec<String>,
}

/// Per-lane counts removed by `drop_all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts {
    pub main: usize,
    pub prio: usize,
    pub paused: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateAction {
    Up,
    Down,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutateOutcome {
    pub changed: bool,
    pub remaining: usize,
}

// --- Scheduler ---

#[derive(Default)]
struct LaneState {
    seq: u64,
    prio: Vec<QueuedItem>,
    main: Vec<QueuedItem>,
    paused: VecDeque<QueuedItem>,
    running: HashMap<Scope, RunningItem>,
}

impl LaneState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Per-scope serializing dispatcher with a global parallelism ceiling.
///
/// Guarantees:
/// - never two running items for the same scope
/// - never more than `max_parallel_jobs` running items in total
/// - priority lane beats paused/main; a lifted pause resumes the
///   paused backlog before newer main-lane work
/// - strict (timestamp, sequence) FIFO within each lane
///
/// All state transitions happen under a single mutex so the three-lane
/// scan is atomic with respect to concurrent `enqueue`/`mark_done`.
pub struct ScopeScheduler {
    max_parallel_jobs: usize,
    state: Mutex<LaneState>,
    notify: Notify,
}

impl ScopeScheduler {
    pub fn new(max_parallel_jobs: usize) -> Self {
        Self {
            max_parallel_jobs: max_parallel_jobs.max(1),
            state: Mutex::new(LaneState::default()),
            notify: Notify::new(),
        }
    }

    pub fn max_parallel_jobs(&self) -> usize {
        self.max_parallel_jobs
    }

    /// Lock the lane state, recovering from poisoning. The critical
    /// sections below never panic, so a poisoned lock still holds a
    /// consistent LaneState.
    fn locked(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit an item to the priority or main lane. Never blocks.
    ///
    /// A zero/negative `received_ts` is replaced with arrival time so
    /// the ordering key is always usable.
    pub fn enqueue(&self, item: WorkItem, priority: bool) {
        let mut st = self.locked();
        let ts = if item.received_ts > 0.0 {
            item.received_ts
        } else {
            now_ts()
        };
        let queued = QueuedItem {
            seq: st.next_seq(),
            ts,
            item,
        };
        if priority {
            st.prio.push(queued);
        } else {
            st.main.push(queued);
        }
        drop(st);
        self.notify.notify_waiters();
    }

    /// Pick one runnable item and mark its scope as running.
    ///
    /// Returns None for every blocked condition: slots full, all
    /// scopes busy, or the paused backlog holding back newer work.
    pub fn try_dispatch_next(&self, barrier: PauseBarrier) -> Option<WorkItem> {
        let mut st = self.locked();

        if st.running.len() >= self.max_parallel_jobs {
            return None;
        }

        // Enforce the pause barrier lazily, under the same lock as the scan.
        Self::apply_pause_barrier(&mut st, barrier);

        // Priority first (confirmations and other jump-ahead work).
        if let Some(idx) = pick_best_eligible(st.prio.iter(), &st.running) {
            let picked = st.prio.remove(idx);
            return Some(Self::start_running(&mut st, picked));
        }

        // When the barrier is lifted, resume the paused backlog before
        // newer main-lane work.
        if !barrier.active && !st.paused.is_empty() {
            if let Some(idx) = pick_best_eligible(st.paused.iter(), &st.running) {
                if let Some(picked) = st.paused.remove(idx) {
                    return Some(Self::start_running(&mut st, picked));
                }
            }
            // Paused backlog exists but every scope is busy: do not
            // fall through to newer items.
            return None;
        }

        let idx = pick_best_eligible(st.main.iter(), &st.running)?;
        let picked = st.main.remove(idx);
        Some(Self::start_running(&mut st, picked))
    }

    fn start_running(st: &mut LaneState, picked: QueuedItem) -> WorkItem {
        let item = picked.item.clone();
        st.running.insert(
            picked.scope(),
            RunningItem {
                item: picked,
                started_ts: now_ts(),
            },
        );
        item
    }

    /// Move main-lane items older than the barrier threshold to the
    /// paused lane.
    fn apply_pause_barrier(st: &mut LaneState, barrier: PauseBarrier) {
        if !barrier.active || st.main.is_empty() {
            return;
        }
        let mut kept = Vec::with_capacity(st.main.len());
        for item in st.main.drain(..) {
            if barrier.should_pause(&item) {
                st.paused.push_back(item);
            } else {
                kept.push(item);
            }
        }
        st.main = kept;
    }

    /// Release a scope after its handler returned; wakes waiters.
    pub fn mark_done(&self, scope: Scope) {
        let mut st = self.locked();
        st.running.remove(&scope);
        drop(st);
        self.notify.notify_waiters();
    }

    /// Bounded sleep until the next enqueue/mark_done, to avoid
    /// busy-polling when nothing is dispatchable.
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout.max(MIN_WAIT), self.notify.notified()).await;
    }

    pub fn running_count(&self) -> usize {
        self.locked().running.len()
    }

    pub fn running_scopes(&self) -> Vec<Scope> {
        self.locked().running.keys().copied().collect()
    }

    /// Queued plus running items addressed to one scope.
    pub fn scope_queue_len(&self, scope: Scope) -> usize {
        let st = self.locked();
        let mut n = 0;
        if st.running.contains_key(&scope) {
            n += 1;
        }
        n += st.prio.iter().filter(|i| i.scope() == scope).count();
        n += st.main.iter().filter(|i| i.scope() == scope).count();
        n += st.paused.iter().filter(|i| i.scope() == scope).count();
        n
    }

    /// All three lanes empty. Running work is ignored.
    pub fn lanes_empty(&self) -> bool {
        let st = self.locked();
        st.prio.is_empty() && st.main.is_empty() && st.paused.is_empty()
    }

    /// Lanes empty and nothing running: the graceful-drain
    /// termination predicate.
    pub fn is_drained(&self) -> bool {
        let st = self.locked();
        st.prio.is_empty() && st.main.is_empty() && st.paused.is_empty() && st.running.is_empty()
    }

    /// Read-only counts and head summaries. Never mutates state.
    pub fn snapshot(&self, max_items: usize) -> QueueSnapshot {
        let st = self.locked();

        let main_head: Vec<String> = st.main.iter().take(max_items).map(summarize).collect();
        let prio_head: Vec<String> = st.prio.iter().take(max_items).map(summarize).collect();
        let paused_head: Vec<String> = st.paused.iter().take(max_items).map(summarize).collect();

        let mut running: Vec<&RunningItem> = st.running.values().collect();
        running.sort_by(|a, b| {
            a.item
                .ts
                .total_cmp(&b.item.ts)
                .then(a.item.seq.cmp(&b.item.seq))
        });
        let run_limit = if max_items == 0 {
            MAX_RUNNING_SUMMARIES
        } else {
            max_items.min(MAX_RUNNING_SUMMARIES)
        };
        let running_summaries: Vec<String> = running
            .iter()
            .take(run_limit)
            .map(|r| summarize(&r.item))
            .collect();
        let running_total = running.len();

        let in_flight = match (running_total, running_summaries.first()) {
            (0, _) | (_, None) => String::new(),
            (1, Some(first)) => first.clone(),
            (n, Some(first)) => format!("{} (+{})", first, n - 1),
        };

        QueueSnapshot {
            in_flight,
            main_n: st.main.len(),
            prio_n: st.prio.len(),
            paused_n: st.paused.len(),
            main_head,
            prio_head,
            paused_head,
        }
    }

    /// Emergency purge of all three lanes. Running work is untouched.
    pub fn drop_all(&self) -> DropCounts {
        let mut st = self.locked();
        let counts = DropCounts {
            main: st.main.len(),
            prio: st.prio.len(),
            paused: st.paused.len(),
        };
        st.main.clear();
        st.prio.clear();
        st.paused.clear();
        drop(st);
        self.notify.notify_waiters();
        counts
    }

    /// Operator-facing reordering/removal of a main-lane position.
    /// Indices refer to the current main-lane snapshot order.
    pub fn mutate_main(&self, action: MutateAction, index: usize) -> Result<MutateOutcome, String> {
        let mut st = self.locked();
        let n = st.main.len();
        if index >= n {
            return Err(format!("index {} out of range ({} queued)", index, n));
        }

        let changed = match action {
            MutateAction::Delete => {
                st.main.remove(index);
                true
            }
            MutateAction::Up => {
                if index > 0 {
                    st.main.swap(index - 1, index);
                    true
                } else {
                    false
                }
            }
            MutateAction::Down => {
                if index + 1 < n {
                    st.main.swap(index, index + 1);
                    true
                } else {
                    false
                }
            }
        };

        let remaining = st.main.len();
        drop(st);
        if changed {
            self.notify.notify_waiters();
        }
        Ok(MutateOutcome { changed, remaining })
    }
}

/// Short human-readable description of a queued item for snapshots.
fn summarize(item: &QueuedItem) -> String {
    let preview: String = match &item.item.payload {
        crate::types::Payload::Text(p) => p.text.chars().take(SUMMARY_PREVIEW_CHARS).collect(),
        crate::types::Payload::Callback(p) => p.data.chars().take(SUMMARY_PREVIEW_CHARS).collect(),
    };
    format!(
        "{} {}: {}",
        item.item.payload.kind(),
        item.scope(),
        preview
    )
}
