use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::repository::model::Zone;
use crate::repository::store::DataStore;
use crate::repository::{load_all, ZONES};

/// Kind of change committed to a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneEventKind {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for ZoneEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneEventKind::Created => write!(f, "created"),
            ZoneEventKind::Updated => write!(f, "updated"),
            ZoneEventKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// A committed zone change; `zone` is the last stored state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneEvent {
    pub zone: Zone,
    pub kind: ZoneEventKind,
}

/// Delay between snapshot attempts while resynchronizing
const RESYNC_RETRY: Duration = Duration::from_secs(1);

/// Pull-based subscription to zone changes.
///
/// Events arrive in commit order. A subscriber that falls behind the bounded
/// buffer is resynchronized: the current zones are compared with the last state
/// it was handed, zones that disappeared are reported as `Deleted` and new or
/// changed zones as `Created`/`Updated`. The final state of every zone is
/// therefore always observed; intermediate states may be skipped or repeated.
pub struct ZoneWatch {
    rx: broadcast::Receiver<ZoneEvent>,
    store: Arc<dyn DataStore>,
    cancel: CancellationToken,
    pending: VecDeque<ZoneEvent>,
    known: HashMap<String, Zone>,
}

impl ZoneWatch {
    /// `snapshot` must be the zone set at the moment `rx` subscribed
    pub(crate) fn new(
        rx: broadcast::Receiver<ZoneEvent>,
        store: Arc<dyn DataStore>,
        cancel: CancellationToken,
        snapshot: Vec<Zone>,
    ) -> Self {
        Self {
            rx,
            store,
            cancel,
            pending: VecDeque::new(),
            known: snapshot.into_iter().map(|z| (z.name.clone(), z)).collect(),
        }
    }

    /// Next event; `None` once cancelled or the repository is gone
    pub async fn next(&mut self) -> Option<ZoneEvent> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            let received = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                received = self.rx.recv() => received,
            };

            match received {
                Ok(event) => {
                    self.observe(&event);
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Zone watcher lagged, resynchronizing");
                    if !self.resync().await {
                        return None;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stop the subscription
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn observe(&mut self, event: &ZoneEvent) {
        match event.kind {
            ZoneEventKind::Deleted => {
                self.known.remove(&event.zone.name);
            }
            ZoneEventKind::Created | ZoneEventKind::Updated => {
                self.known.insert(event.zone.name.clone(), event.zone.clone());
            }
        }
    }

    // Returns false when cancelled before a snapshot could be taken.
    async fn resync(&mut self) -> bool {
        // Commits from here on are delivered again after the snapshot.
        self.rx = self.rx.resubscribe();

        let zones = loop {
            match load_all::<Zone>(self.store.as_ref(), ZONES, "").await {
                Ok(zones) => break zones,
                Err(e) => {
                    warn!(error = %e, "Failed to load zone snapshot, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = tokio::time::sleep(RESYNC_RETRY) => {}
                    }
                }
            }
        };

        let previous = std::mem::take(&mut self.known);
        let names: HashSet<&str> = zones.iter().map(|z| z.name.as_str()).collect();
        let mut gone: Vec<&Zone> = previous
            .values()
            .filter(|z| !names.contains(z.name.as_str()))
            .collect();
        gone.sort_by(|a, b| a.name.cmp(&b.name));
        for zone in gone {
            self.pending.push_back(ZoneEvent {
                zone: zone.clone(),
                kind: ZoneEventKind::Deleted,
            });
        }

        // snapshot is in key order
        for zone in &zones {
            let kind = match previous.get(&zone.name) {
                None => ZoneEventKind::Created,
                Some(last) if last != zone => ZoneEventKind::Updated,
                Some(_) => continue,
            };
            self.pending.push_back(ZoneEvent {
                zone: zone.clone(),
                kind,
            });
        }
        self.known = zones.into_iter().map(|z| (z.name.clone(), z)).collect();
        debug!(pending = self.pending.len(), "Zone watcher resynchronized");
        true
    }
}

/// Handle for a callback-driven watch
pub struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub(crate) fn spawn<F>(mut watch: ZoneWatch, mut callback: F) -> Self
    where
        F: FnMut(ZoneEvent) -> bool + Send + 'static,
    {
        let cancel = watch.cancel.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = watch.next().await {
                if !callback(event) {
                    debug!("Watch callback requested stop");
                    break;
                }
            }
        });
        Self { cancel, task }
    }

    /// Stop delivering events
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the delivery task to finish
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "Watch task failed");
        }
    }
}
