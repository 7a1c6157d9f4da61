//! Backend pool and least-connections selection.
//!
//! Selection policy:
//! - Backends that are not alive are skipped.
//! - The first alive backend with zero active connections wins immediately.
//! - Otherwise the alive backend with the fewest active connections wins,
//!   ties broken by lower latency, remaining ties by list order.
//!
//! The pool is fixed at construction; backends are never added or removed.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::backend::{Backend, BackendSnapshot};
use crate::config::{PingConfig, PingSettings, ProxyConfig};

/// Ordered, fixed-size set of backends owned by one proxy.
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
}

impl BackendPool {
    /// Build a pool from already constructed backends.
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self { backends }
    }

    /// Create and start monitoring every backend of `proxy`.
    ///
    /// Each backend gets a child of `shutdown`, so cancelling it stops all monitors.
    pub fn spawn(proxy: &ProxyConfig, global: &PingConfig, shutdown: &CancellationToken) -> Self {
        let backends = proxy
            .backends
            .iter()
            .map(|cfg| {
                let ping = PingSettings::resolve(&cfg.ping, &proxy.ping, global);
                Backend::spawn(cfg.addr.clone(), ping, shutdown.child_token())
            })
            .collect();
        Self::new(backends)
    }

    /// Number of backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether the pool has no backends.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Backends in selection order.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Number of backends currently alive.
    pub fn alive_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }

    /// Choose the backend for a new connection, or `None` if every backend is down.
    ///
    /// Each backend is snapshotted under its own lock, one at a time.
    pub fn select(&self) -> Option<Arc<Backend>> {
        let index = select_best(self.backends.iter().map(|b| b.snapshot()))?;
        self.backends.get(index).cloned()
    }
}

/// Pick the index of the best candidate from snapshots in list order.
///
/// Stops scanning at the first alive backend with no active connections.
pub fn select_best<I>(snapshots: I) -> Option<usize>
where
    I: IntoIterator<Item = BackendSnapshot>,
{
    let mut best: Option<(usize, BackendSnapshot)> = None;

    for (index, snap) in snapshots.into_iter().enumerate() {
        if !snap.alive {
            continue;
        }

        if snap.active_connections == 0 {
            return Some(index);
        }

        let better = match &best {
            None => true,
            Some((_, current)) => {
                snap.active_connections < current.active_connections
                    || (snap.active_connections == current.active_connections
                        && snap.latency < current.latency)
            }
        };

        if better {
            best = Some((index, snap));
        }
    }

    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::MonitorState;
    use proptest::prelude::*;
    use std::time::Duration;

    fn snap(alive: bool, active_connections: usize, latency_us: u64) -> BackendSnapshot {
        BackendSnapshot {
            alive,
            active_connections,
            latency: Duration::from_micros(latency_us),
            monitor: if alive {
                MonitorState::Alive
            } else {
                MonitorState::Disconnected
            },
        }
    }

    #[test]
    fn test_idle_backend_preferred_over_busy() {
        let pick = select_best(vec![snap(true, 3, 10), snap(true, 0, 900)]);
        assert_eq!(pick, Some(1));
    }

    #[test]
    fn test_all_down_returns_none() {
        assert_eq!(select_best(vec![snap(false, 0, 1), snap(false, 2, 1)]), None);
        assert_eq!(select_best(Vec::new()), None);
    }

    #[test]
    fn test_dead_first_backend_is_never_chosen() {
        let pick = select_best(vec![snap(false, 0, 1), snap(true, 5, 100)]);
        assert_eq!(pick, Some(1));
    }

    #[test]
    fn test_fewest_connections_wins() {
        let pick = select_best(vec![snap(true, 4, 1), snap(true, 2, 500), snap(true, 3, 1)]);
        assert_eq!(pick, Some(1));
    }

    #[test]
    fn test_latency_breaks_connection_ties() {
        let pick = select_best(vec![snap(true, 2, 300), snap(true, 2, 100), snap(true, 2, 200)]);
        assert_eq!(pick, Some(1));
    }

    #[test]
    fn test_exact_ties_go_to_first_in_list() {
        let pick = select_best(vec![snap(false, 1, 1), snap(true, 2, 50), snap(true, 2, 50)]);
        assert_eq!(pick, Some(1));

        let pick = select_best(vec![snap(true, 0, 50), snap(true, 0, 1)]);
        assert_eq!(pick, Some(0));
    }

    #[test]
    fn test_scan_stops_at_first_idle_backend() {
        let mut seen = 0;
        let pick = select_best(
            vec![snap(true, 1, 1), snap(true, 0, 1), snap(true, 0, 1)]
                .into_iter()
                .inspect(|_| seen += 1),
        );
        assert_eq!(pick, Some(1));
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_pool_select_uses_live_state() {
        let token = CancellationToken::new();
        let a = Arc::new(Backend::new("10.0.0.1:1", PingSettings::default(), token.clone()));
        let b = Arc::new(Backend::new("10.0.0.2:1", PingSettings::default(), token.clone()));
        let pool = BackendPool::new(vec![Arc::clone(&a), Arc::clone(&b)]);

        assert!(pool.select().is_none());
        assert_eq!(pool.alive_count(), 0);

        b.set_monitor_state(MonitorState::Alive);
        let chosen = pool.select().unwrap();
        assert_eq!(chosen.addr(), "10.0.0.2:1");

        a.set_monitor_state(MonitorState::Alive);
        let chosen = pool.select().unwrap();
        assert_eq!(chosen.addr(), "10.0.0.1:1");
        assert_eq!(pool.alive_count(), 2);
    }

    fn arb_snapshot() -> impl Strategy<Value = BackendSnapshot> {
        (any::<bool>(), 0usize..4, 0u64..4).prop_map(|(alive, conns, lat)| snap(alive, conns, lat))
    }

    proptest! {
        #[test]
        fn prop_none_iff_all_down(snaps in prop::collection::vec(arb_snapshot(), 0..12)) {
            let pick = select_best(snaps.clone());
            prop_assert_eq!(pick.is_none(), snaps.iter().all(|s| !s.alive));
        }

        #[test]
        fn prop_pick_is_first_minimum(snaps in prop::collection::vec(arb_snapshot(), 1..12)) {
            if let Some(i) = select_best(snaps.clone()) {
                let chosen = snaps[i];
                prop_assert!(chosen.alive);

                if let Some(first_idle) = snaps.iter().position(|s| s.alive && s.active_connections == 0) {
                    // Idle capacity always wins, and the earliest idle backend is taken.
                    prop_assert_eq!(i, first_idle);
                } else {
                    let key = |s: &BackendSnapshot| (s.active_connections, s.latency);
                    for (j, other) in snaps.iter().enumerate().filter(|(_, s)| s.alive) {
                        prop_assert!(key(&chosen) <= key(other));
                        if j < i {
                            prop_assert!(key(other) > key(&chosen));
                        }
                    }
                }
            }
        }
    }
}
