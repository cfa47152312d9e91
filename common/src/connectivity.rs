use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::types::ConnectivityState;

pub trait Reachability {
    fn is_reachable(&self) -> bool;
}

impl Reachability for AtomicBool {
    fn is_reachable(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

impl<R: Reachability + ?Sized> Reachability for Arc<R> {
    fn is_reachable(&self) -> bool {
        (**self).is_reachable()
    }
}

impl Reachability for Cell<bool> {
    fn is_reachable(&self) -> bool {
        self.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityTransition {
    EnteredOffline,
    EnteredOnline,
}

#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    interval_ms: u64,
    last_sample_ms: Option<u64>,
    state: ConnectivityState,
}

impl ConnectivityMonitor {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_sample_ms: None,
            state: ConnectivityState::Online,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    pub fn sample_due(&self, now_ms: u64) -> bool {
        self.last_sample_ms
            .map(|last| now_ms.saturating_sub(last) >= self.interval_ms)
            .unwrap_or(true)
    }

    pub fn poll<R: Reachability + ?Sized>(
        &mut self,
        now_ms: u64,
        link: &R,
    ) -> Option<ConnectivityTransition> {
        if !self.sample_due(now_ms) {
            return None;
        }
        self.last_sample_ms = Some(now_ms);

        let sampled = ConnectivityState::from_reachable(link.is_reachable());
        if sampled == self.state {
            return None;
        }
        self.state = sampled;

        Some(match sampled {
            ConnectivityState::Offline => ConnectivityTransition::EnteredOffline,
            ConnectivityState::Online => ConnectivityTransition::EnteredOnline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_poll_samples_immediately() {
        let mut monitor = ConnectivityMonitor::new(5_000);
        let link = Cell::new(false);

        assert_eq!(
            monitor.poll(0, &link),
            Some(ConnectivityTransition::EnteredOffline)
        );
        assert!(!monitor.is_online());
    }

    #[test]
    fn respects_sampling_interval() {
        let mut monitor = ConnectivityMonitor::new(5_000);
        let link = Cell::new(true);
        assert_eq!(monitor.poll(1_000, &link), None);

        link.set(false);
        assert_eq!(monitor.poll(5_999, &link), None);
        assert!(monitor.is_online());

        assert_eq!(
            monitor.poll(6_000, &link),
            Some(ConnectivityTransition::EnteredOffline)
        );
    }

    #[test]
    fn reports_edges_only() {
        let mut monitor = ConnectivityMonitor::new(100);
        let link = Cell::new(false);

        assert_eq!(
            monitor.poll(0, &link),
            Some(ConnectivityTransition::EnteredOffline)
        );
        assert_eq!(monitor.poll(100, &link), None);
        assert_eq!(monitor.poll(200, &link), None);

        link.set(true);
        assert_eq!(
            monitor.poll(300, &link),
            Some(ConnectivityTransition::EnteredOnline)
        );
        assert_eq!(monitor.poll(400, &link), None);
    }

    #[test]
    fn atomic_flag_is_a_reachability_source() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut monitor = ConnectivityMonitor::new(100);

        assert_eq!(monitor.poll(0, &flag), None);
        flag.store(false, Ordering::Relaxed);
        assert_eq!(
            monitor.poll(100, &flag),
            Some(ConnectivityTransition::EnteredOffline)
        );
    }
}
