// File: console/power_tracker/src/tracker.rs

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{PollStrategy, TrackerConfig};
use crate::error::{Result, TrackerError};
use crate::source::StatusSource;
use crate::{OperationKey, OperationSnapshot, PowerAction, TrackedOperation};

// The two independent removal timers a terminal operation gets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EvictionPath {
    Scheduled,
    SafetyNet,
}

impl EvictionPath {
    fn delay(&self, config: &TrackerConfig) -> Duration {
        match self {
            EvictionPath::Scheduled => config.removal_delay(),
            EvictionPath::SafetyNet => config.safety_net_delay(),
        }
    }
}

struct Registration {
    // Unique per start_tracking call, so timers armed for a replaced
    // registration never evict its successor
    id: u64,
    operation: TrackedOperation,
    scheduled_armed: bool,
    safety_net_armed: bool,
}

impl Registration {
    fn armed(&mut self, path: EvictionPath) -> &mut bool {
        match path {
            EvictionPath::Scheduled => &mut self.scheduled_armed,
            EvictionPath::SafetyNet => &mut self.safety_net_armed,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    registrations: Vec<Registration>,
    next_id: u64,
    disposed: bool,
}

struct Shared {
    state: Mutex<TrackerState>,
    snapshots: watch::Sender<Vec<OperationSnapshot>>,
    // Bumped on every change of the registration set
    changes: watch::Sender<u64>,
    source: Arc<dyn StatusSource>,
    config: TrackerConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_changed(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn has_registrations(&self) -> bool {
        !self.lock().registrations.is_empty()
    }

    // Remove matching registrations and drop their snapshots from the
    // published list. Returns how many registrations were removed.
    fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Registration) -> bool,
    {
        let removed = {
            let mut state = self.lock();
            let before = state.registrations.len();
            state.registrations.retain(|r| !predicate(r));
            let removed = before - state.registrations.len();

            if removed > 0 {
                let remaining: HashSet<OperationKey> = state.registrations
                    .iter()
                    .map(|r| r.operation.key())
                    .collect();
                self.snapshots.send_if_modified(|snapshots| {
                    let before = snapshots.len();
                    snapshots.retain(|s| remaining.contains(&s.key()));
                    before != snapshots.len()
                });
            }
            removed
        };

        if removed > 0 {
            self.notify_changed();
        }
        removed
    }

    fn evict(&self, id: u64, path: EvictionPath, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }

        // Whichever path fires first wins; the other finds nothing to remove
        let removed = self.remove_where(|r| r.id == id);
        if removed > 0 {
            debug!("Registration {} retired by {:?} eviction", id, path);
        }
    }

    // Replace the published list with one full cycle's worth of snapshots.
    // Removal timers start only once a terminal snapshot is visible, and
    // snapshots of registrations removed or replaced mid-cycle are dropped.
    fn publish_cycle(self: &Arc<Self>, polled: Vec<(u64, OperationSnapshot)>, token: &CancellationToken) {
        let terminal: Vec<u64> = {
            let state = self.lock();
            if token.is_cancelled() {
                return;
            }

            let live: HashSet<u64> = state.registrations.iter().map(|r| r.id).collect();
            let mut terminal = Vec::new();
            let mut snapshots = Vec::with_capacity(polled.len());
            for (id, snapshot) in polled {
                if !live.contains(&id) {
                    continue;
                }
                if snapshot.is_terminal() {
                    terminal.push(id);
                }
                snapshots.push(snapshot);
            }

            debug!("Publishing {} power operation snapshot(s)", snapshots.len());
            self.snapshots.send_replace(snapshots);
            terminal
        };

        for id in terminal {
            arm_eviction(self, token, id, EvictionPath::Scheduled);
            arm_eviction(self, token, id, EvictionPath::SafetyNet);
        }
    }
}

struct Poller {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

// Tracks in-flight VM power operations by polling their status on a fixed
// interval and retiring them shortly after they reach a terminal status.
//
// The tracker is an owned resource: `start` spawns the polling task on the
// current tokio runtime, `stop` halts it, and `dispose` (or dropping the
// tracker) tears everything down so late responses are never published.
pub struct PowerOperationTracker {
    shared: Arc<Shared>,
    poller: Mutex<Option<Poller>>,
}

impl PowerOperationTracker {
    pub fn new(source: Arc<dyn StatusSource>, config: TrackerConfig) -> Result<Self> {
        config.validate()?;

        let (snapshots, _) = watch::channel(Vec::new());
        let (changes, _) = watch::channel(0);

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TrackerState::default()),
                snapshots,
                changes,
                source,
                config,
            }),
            poller: Mutex::new(None),
        })
    }

    // Create and start in one step
    pub fn spawn(source: Arc<dyn StatusSource>, config: TrackerConfig) -> Result<Self> {
        let tracker = Self::new(source, config)?;
        tracker.start()?;
        Ok(tracker)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.shared.config
    }

    fn poller(&self) -> MutexGuard<'_, Option<Poller>> {
        self.poller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self) -> Result<()> {
        let mut poller = self.poller();

        if self.shared.lock().disposed {
            return Err(TrackerError::Disposed);
        }
        if poller.as_ref().map_or(false, |p| !p.handle.is_finished()) {
            return Err(TrackerError::AlreadyRunning);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TrackerError::NoRuntime(e.to_string()))?;

        let token = CancellationToken::new();
        let changes = self.shared.changes.subscribe();
        let handle = runtime.spawn(run_poller(Arc::clone(&self.shared), token.clone(), changes));

        *poller = Some(Poller { token, handle });
        info!("Power operation tracker started");
        Ok(())
    }

    // Halt polling and cancel pending eviction timers. Registrations are
    // kept, so a later `start` resumes tracking them.
    pub fn stop(&self) {
        let mut poller = self.poller();
        if let Some(poller) = poller.take() {
            let mut state = self.shared.lock();
            poller.token.cancel();
            for registration in state.registrations.iter_mut() {
                registration.scheduled_armed = false;
                registration.safety_net_armed = false;
            }
            info!("Power operation tracker stopped");
        }
    }

    pub fn dispose(&self) {
        self.stop();

        let cleared = {
            let mut state = self.shared.lock();
            state.disposed = true;
            let cleared = state.registrations.len();
            state.registrations.clear();
            self.shared.snapshots.send_replace(Vec::new());
            cleared
        };
        self.shared.notify_changed();

        debug!("Power operation tracker disposed ({} registration(s) dropped)", cleared);
    }

    pub fn is_running(&self) -> bool {
        self.poller()
            .as_ref()
            .map_or(false, |p| !p.handle.is_finished())
    }

    // Register a power operation for polling. A second call for the same
    // (vm, operation) pair replaces the existing registration in place.
    pub fn start_tracking(
        &self,
        vm_id: impl Into<String>,
        operation_id: impl Into<String>,
        action: PowerAction,
    ) -> Result<()> {
        let operation = TrackedOperation {
            vm_id: vm_id.into(),
            operation_id: operation_id.into(),
            action,
            start_time: Instant::now(),
        };
        let key = operation.key();

        {
            let mut state = self.shared.lock();
            if state.disposed {
                return Err(TrackerError::Disposed);
            }

            let id = state.next_id;
            state.next_id += 1;
            let registration = Registration {
                id,
                operation,
                scheduled_armed: false,
                safety_net_armed: false,
            };

            match state.registrations.iter_mut().find(|r| r.operation.key() == key) {
                Some(existing) => {
                    debug!("Replacing existing registration for {}", key);
                    *existing = registration;
                }
                None => state.registrations.push(registration),
            }
        }
        self.shared.notify_changed();

        info!("Tracking {} operation {}", action, key);
        Ok(())
    }

    // Remove every registration for `vm_id`, or only the one matching
    // `operation_id` when given. Unknown pairs are a no-op.
    pub fn stop_tracking(&self, vm_id: &str, operation_id: Option<&str>) -> usize {
        let removed = self.shared.remove_where(|r| r.operation.key().matches(vm_id, operation_id));
        if removed > 0 {
            info!("Stopped tracking {} operation(s) for VM {}", removed, vm_id);
        }
        removed
    }

    pub fn clear_all_tracking(&self) {
        {
            let mut state = self.shared.lock();
            state.registrations.clear();
            self.shared.snapshots.send_replace(Vec::new());
        }
        self.shared.notify_changed();
        info!("Cleared all tracked power operations");
    }

    pub fn operations(&self) -> Vec<OperationSnapshot> {
        self.shared.snapshots.borrow().clone()
    }

    pub fn is_tracking(&self) -> bool {
        self.shared.has_registrations()
    }

    pub fn tracked(&self) -> Vec<TrackedOperation> {
        self.shared.lock()
            .registrations
            .iter()
            .map(|r| r.operation.clone())
            .collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<OperationSnapshot>> {
        self.shared.snapshots.subscribe()
    }
}

impl fmt::Debug for PowerOperationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Take each lock on its own; start and stop nest poller then state
        let tracked = self.shared.lock().registrations.len();
        let running = self.is_running();

        f.debug_struct("PowerOperationTracker")
            .field("config", &self.shared.config)
            .field("tracked", &tracked)
            .field("running", &running)
            .finish()
    }
}

impl Drop for PowerOperationTracker {
    fn drop(&mut self) {
        if let Some(poller) = self.poller().take() {
            poller.token.cancel();
        }
    }
}

fn arm_eviction(shared: &Arc<Shared>, token: &CancellationToken, id: u64, path: EvictionPath) {
    let delay = {
        let mut state = shared.lock();
        if token.is_cancelled() {
            return;
        }
        let Some(registration) = state.registrations.iter_mut().find(|r| r.id == id) else {
            return;
        };
        let armed = registration.armed(path);
        if *armed {
            return;
        }
        *armed = true;
        path.delay(&shared.config)
    };

    let shared = Arc::clone(shared);
    let token = token.child_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = time::sleep(delay) => shared.evict(id, path, &token),
        }
    });
}

async fn poll_one(shared: &Shared, id: u64, tracked: &TrackedOperation) -> (u64, OperationSnapshot) {
    let result = shared.source
        .fetch_status(&tracked.vm_id, &tracked.operation_id)
        .await;
    let now = Instant::now();

    let snapshot = match result {
        Ok(operation) => {
            let snapshot = OperationSnapshot::tracked(operation, tracked, now);
            if snapshot.is_terminal() {
                debug!("Operation {} reached {:?}", tracked.key(), snapshot.operation.task.status);
            }
            snapshot
        }
        Err(e) => {
            warn!("Failed to fetch status of power operation {}: {}", tracked.key(), e);
            OperationSnapshot::unresolved(tracked, now)
        }
    };
    (id, snapshot)
}

async fn poll_cycle(shared: &Shared) -> Vec<(u64, OperationSnapshot)> {
    let batch: Vec<(u64, TrackedOperation)> = shared.lock()
        .registrations
        .iter()
        .map(|r| (r.id, r.operation.clone()))
        .collect();

    match shared.config.strategy {
        PollStrategy::Sequential => {
            let mut snapshots = Vec::with_capacity(batch.len());
            for (id, tracked) in &batch {
                snapshots.push(poll_one(shared, *id, tracked).await);
            }
            snapshots
        }
        // join_all keeps input order, so the batch stays in registration order
        PollStrategy::Concurrent => {
            join_all(batch.iter().map(|(id, tracked)| poll_one(shared, *id, tracked))).await
        }
    }
}

// Polling task. Any change of the registration set drops the in-flight
// cycle and starts over with an immediate poll; an empty set clears the
// published list and parks until something is tracked again.
async fn run_poller(shared: Arc<Shared>, token: CancellationToken, mut changes: watch::Receiver<u64>) {
    debug!("Power operation poller running");

    'restart: loop {
        changes.borrow_and_update();

        if !shared.has_registrations() {
            shared.snapshots.send_if_modified(|snapshots| {
                let had_any = !snapshots.is_empty();
                snapshots.clear();
                had_any
            });

            tokio::select! {
                _ = token.cancelled() => break 'restart,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break 'restart;
                    }
                    continue 'restart;
                }
            }
        }

        // First tick completes immediately
        let mut ticker = time::interval(shared.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break 'restart,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break 'restart;
                    }
                    continue 'restart;
                }
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break 'restart,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break 'restart;
                    }
                    debug!("Registrations changed mid-cycle, discarding in-flight responses");
                    continue 'restart;
                }
                polled = poll_cycle(&shared) => shared.publish_cycle(polled, &token),
            }
        }
    }

    debug!("Power operation poller exited");
}
