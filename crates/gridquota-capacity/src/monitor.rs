//! Capacity monitor: background task that keeps pools and ledgers in step.
//!
//! All capacity updates and rebalances run on this one task, so two
//! redistributions of the same pool never overlap. Work arrives through a
//! bounded channel fed by [`CapacityHandle`]; a periodic sweep re-aggregates
//! every pool from its hosts and catches anything a dropped event missed.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use gridquota_core::config::CapacityConfig;
use gridquota_fairshare::{RebalanceReport, Redistributor};
use gridquota_state::StateStore;

use crate::aggregate::{CapacityReport, apply_report, refresh_from_hosts};
use crate::error::{CapacityError, CapacityResult};

/// Work items for the capacity monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityEvent {
    /// A discovery cycle reported new capacity for a pool.
    Report(CapacityReport),
    /// A host was added to, updated in, or removed from a pool.
    HostsChanged(String),
    /// A pool's ledgers or declared capacity changed; rebalance it.
    Rebalance(String),
}

impl CapacityEvent {
    pub fn resource_pool_link(&self) -> &str {
        match self {
            Self::Report(report) => &report.resource_pool_link,
            Self::HostsChanged(pool) | Self::Rebalance(pool) => pool,
        }
    }
}

/// Cloneable sender side of the monitor's event channel.
#[derive(Clone)]
pub struct CapacityHandle {
    tx: mpsc::Sender<CapacityEvent>,
}

impl CapacityHandle {
    /// Deliver a capacity report, waiting for channel space.
    pub async fn report(&self, report: CapacityReport) -> CapacityResult<()> {
        self.tx
            .send(CapacityEvent::Report(report))
            .await
            .map_err(|_| CapacityError::MonitorStopped)
    }

    /// Queue an event without waiting. A full channel drops the event; the
    /// next sweep covers it.
    pub fn notify(&self, event: CapacityEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    pool = event.resource_pool_link(),
                    "capacity event channel full, deferring to next sweep"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(pool = event.resource_pool_link(), "capacity monitor stopped, event dropped");
            }
        }
    }

    pub fn rebalance(&self, resource_pool_link: &str) {
        self.notify(CapacityEvent::Rebalance(resource_pool_link.to_string()));
    }

    pub fn hosts_changed(&self, resource_pool_link: &str) {
        self.notify(CapacityEvent::HostsChanged(resource_pool_link.to_string()));
    }
}

/// Serializes capacity updates and pool rebalances.
pub struct CapacityMonitor {
    store: StateStore,
    redistributor: Redistributor,
    events: mpsc::Receiver<CapacityEvent>,
    sweep_interval: Duration,
}

impl CapacityMonitor {
    /// Create a monitor and the handle that feeds it.
    pub fn new(store: StateStore, config: &CapacityConfig) -> (Self, CapacityHandle) {
        let (tx, events) = mpsc::channel(config.event_buffer.max(1));
        let monitor = Self {
            redistributor: Redistributor::new(store.clone()),
            store,
            events,
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
        };
        (monitor, CapacityHandle { tx })
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.redistributor = Redistributor::new(self.store.clone()).with_max_conflict_retries(retries);
        self
    }

    /// Run until shutdown is signalled or every handle is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.sweep_interval.as_secs(),
            "capacity monitor started"
        );
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle(event),
                        None => {
                            info!("capacity event channel closed, monitor exiting");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("capacity monitor shutting down");
                    break;
                }
            }
        }
    }

    fn handle(&self, event: CapacityEvent) {
        let pool = event.resource_pool_link().to_string();
        if let Err(e) = self.process(event) {
            warn!(pool = %pool, error = %e, "capacity event failed");
        }
    }

    /// Apply one event. Returns the rebalance report when a rebalance ran.
    pub fn process(&self, event: CapacityEvent) -> CapacityResult<Option<RebalanceReport>> {
        let (pool, changed) = match event {
            CapacityEvent::Report(report) => {
                let changed = apply_report(&self.store, &report)?;
                (report.resource_pool_link, changed)
            }
            CapacityEvent::HostsChanged(pool) => {
                let changed = refresh_from_hosts(&self.store, &pool)?;
                (pool, changed)
            }
            CapacityEvent::Rebalance(pool) => {
                if self.store.get_pool(&pool)?.is_none() {
                    debug!(pool = %pool, "pool gone, nothing to rebalance");
                    return Ok(None);
                }
                (pool, true)
            }
        };
        if !changed {
            return Ok(None);
        }
        Ok(Some(self.redistributor.rebalance(&pool)?))
    }

    /// Re-aggregate every pool with hosts and rebalance every pool.
    pub fn sweep(&self) -> Vec<RebalanceReport> {
        let pools = match self.store.list_pools() {
            Ok(pools) => pools,
            Err(e) => {
                warn!(error = %e, "capacity sweep could not list pools");
                return Vec::new();
            }
        };

        let mut reports = Vec::new();
        for pool in pools {
            if let Err(e) = refresh_from_hosts(&self.store, &pool.self_link) {
                warn!(pool = %pool.self_link, error = %e, "capacity refresh failed");
                continue;
            }
            match self.redistributor.rebalance(&pool.self_link) {
                Ok(report) => reports.push(report),
                Err(e) => warn!(pool = %pool.self_link, error = %e, "rebalance failed"),
            }
        }
        debug!(pools = reports.len(), "capacity sweep finished");
        reports
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
