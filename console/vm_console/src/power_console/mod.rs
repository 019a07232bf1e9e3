use std::collections::HashMap;
use std::sync::Arc;
use colored::Colorize;
use log::{info, error, warn};
use tokio::time;
use tokio_util::sync::CancellationToken;

use power_tracker::{
    OperationKey, OperationSnapshot, PowerAction, PowerOperation, PowerOperationTracker,
    TaskStatus, TrackerConfig,
};

use crate::api_client::CloudApiClient;
use crate::error::Result;


// Outcome of watching tracked operations until they retire
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchReport {
    pub completed: usize,
    pub failed: usize,
    pub poll_failures: usize,
    pub interrupted: bool,
}

impl WatchReport {
    pub fn is_success(&self) -> bool {
        !self.interrupted && self.failed == 0 && self.poll_failures == 0
    }
}

// Issues power actions against the backend and tracks the resulting tasks
pub struct PowerConsole {
    client: Arc<CloudApiClient>,
    tracker: PowerOperationTracker,
}

impl PowerConsole {
    pub fn new(client: CloudApiClient, config: TrackerConfig) -> Result<Self> {
        let client = Arc::new(client);
        let tracker = PowerOperationTracker::spawn(client.clone(), config)?;

        Ok(Self { client, tracker })
    }

    pub fn tracker(&self) -> &PowerOperationTracker {
        &self.tracker
    }

    pub async fn apply(&self, vm_id: &str, action: PowerAction) -> Result<PowerOperation> {
        let operation = self.client.power_action(vm_id, action).await?;
        self.tracker.start_tracking(vm_id, operation.task.id.clone(), action)?;
        Ok(operation)
    }

    pub async fn power_on(&self, vm_id: &str) -> Result<PowerOperation> {
        self.apply(vm_id, PowerAction::PowerOn).await
    }

    pub async fn power_off(&self, vm_id: &str) -> Result<PowerOperation> {
        self.apply(vm_id, PowerAction::PowerOff).await
    }

    // Apply one action to several VMs; returns how many were accepted
    pub async fn apply_all(&self, vm_ids: &[String], action: PowerAction) -> usize {
        let mut accepted = 0;

        for vm_id in vm_ids {
            let result = match action {
                PowerAction::PowerOn => self.power_on(vm_id).await,
                PowerAction::PowerOff => self.power_off(vm_id).await,
                other => self.apply(vm_id, other).await,
            };
            match result {
                Ok(operation) => {
                    info!("VM {}: {} accepted as task {}", vm_id, action, operation.task.id);
                    accepted += 1;
                }
                Err(e) => error!("VM {}: {} rejected: {}", vm_id, action, e),
            }
        }

        accepted
    }

    // Hand every published snapshot batch to `on_update` until nothing is
    // tracked any more or `shutdown` fires
    pub async fn watch_until_idle<F>(&self, shutdown: &CancellationToken, mut on_update: F) -> WatchReport
    where
        F: FnMut(&[OperationSnapshot]),
    {
        let mut updates = self.tracker.subscribe();
        let mut latest: HashMap<OperationKey, OperationSnapshot> = HashMap::new();
        let recheck = self.tracker.config().poll_interval();
        let mut interrupted = false;

        while self.tracker.is_tracking() {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    interrupted = true;
                    break;
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshots = updates.borrow_and_update().clone();
                    for snapshot in &snapshots {
                        latest.insert(snapshot.key(), snapshot.clone());
                    }
                    if !snapshots.is_empty() {
                        on_update(&snapshots);
                    }
                }
                // Removals that never reached the published list do not notify
                _ = time::sleep(recheck) => {}
            }
        }

        let mut report = WatchReport {
            interrupted,
            ..WatchReport::default()
        };
        for snapshot in latest.values() {
            if snapshot.is_poll_failure() {
                report.poll_failures += 1;
            } else {
                match snapshot.operation.task.status {
                    TaskStatus::Completed => report.completed += 1,
                    TaskStatus::Failed => report.failed += 1,
                    _ => {}
                }
            }
        }

        if interrupted {
            warn!("Stopped watching with {} operation(s) still tracked", self.tracker.tracked().len());
        }
        report
    }

    pub fn shutdown(&self) {
        self.tracker.dispose();
    }
}

// One console line per snapshot
pub fn render_snapshot(snapshot: &OperationSnapshot) -> String {
    let operation = &snapshot.operation;
    let status = format!("{:<10}", format!("{:?}", operation.task.status).to_lowercase());
    let status = match operation.task.status {
        TaskStatus::Completed => status.green(),
        TaskStatus::Failed => status.red(),
        TaskStatus::Unknown => status.dimmed(),
        _ => status.yellow(),
    };

    let mut line = format!(
        "{:<36} {:<10} {} {:>6.1}s  {}",
        operation.vm_id,
        operation.action.as_str(),
        status,
        snapshot.elapsed_ms as f64 / 1000.0,
        operation.message,
    );
    if snapshot.is_poll_failure() {
        line.push_str(&format!(" {}", "[status unavailable]".red().bold()));
    }
    line
}
