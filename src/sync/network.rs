//! Network/Connectivity Monitor
//!
//! `ONLINE <-> OFFLINE` state machine. Inputs are the platform signal
//! (`set_observed`), request outcomes, and a time-bounded override for
//! tests and debugging. The effective status is published on a watch channel.

use super::api::ResourceFetcher;
use super::models::NetworkStatus;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

struct MonitorState {
    observed: NetworkStatus,
    forced: Option<(NetworkStatus, Instant)>,
}

impl MonitorState {
    /// Override wins until it lapses
    fn effective(&mut self, now: Instant) -> NetworkStatus {
        match self.forced {
            Some((status, until)) if now < until => status,
            Some(_) => {
                self.forced = None;
                log::info!("Network override expired, observed status is {:?}", self.observed);
                self.observed
            }
            None => self.observed,
        }
    }
}

pub struct NetworkMonitor {
    state: Mutex<MonitorState>,
    tx: watch::Sender<NetworkStatus>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            state: Mutex::new(MonitorState {
                observed: initial,
                forced: None,
            }),
            tx,
        }
    }

    /// Current effective status
    pub fn status(&self) -> NetworkStatus {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let status = state.effective(Instant::now());
        drop(state);
        self.publish(status);
        status
    }

    pub fn is_online(&self) -> bool {
        self.status() == NetworkStatus::Online
    }

    /// Platform connectivity signal
    pub fn set_observed(&self, status: NetworkStatus) {
        let effective = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.observed != status {
                log::info!("Network status observed: {:?} -> {:?}", state.observed, status);
            }
            state.observed = status;
            state.effective(Instant::now())
        };
        self.publish(effective);
    }

    /// A request failed at the transport level
    pub fn report_network_failure(&self) {
        self.set_observed(NetworkStatus::Offline);
    }

    /// A request reached the server
    pub fn report_success(&self) {
        self.set_observed(NetworkStatus::Online);
    }

    /// Pin the status for `duration`, regardless of observations
    pub fn force_status(&self, status: NetworkStatus, duration: Duration) {
        let effective = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.forced = Some((status, Instant::now() + duration));
            state.effective(Instant::now())
        };
        log::info!("Network status forced to {:?} for {:?}", status, duration);
        self.publish(effective);
    }

    pub fn clear_override(&self) {
        let effective = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.forced = None;
            state.effective(Instant::now())
        };
        self.publish(effective);
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    /// Health check; updates the observed status and returns the effective one
    pub async fn probe(&self, fetcher: &dyn ResourceFetcher) -> NetworkStatus {
        match fetcher.health().await {
            Ok(()) => self.report_success(),
            Err(e) => {
                log::debug!("Connectivity probe failed: {}", e);
                if e.classify().is_network() {
                    self.report_network_failure();
                } else {
                    // The server answered, so the network is up
                    self.report_success();
                }
            }
        }
        self.status()
    }

    fn publish(&self, status: NetworkStatus) {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_heuristics() {
        let monitor = NetworkMonitor::default();
        assert!(monitor.is_online());

        monitor.report_network_failure();
        assert_eq!(monitor.status(), NetworkStatus::Offline);

        monitor.report_success();
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let monitor = NetworkMonitor::default();
        let mut rx = monitor.subscribe();

        monitor.set_observed(NetworkStatus::Offline);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), NetworkStatus::Offline);

        // No change, no notification
        monitor.set_observed(NetworkStatus::Offline);
        assert!(!rx.has_changed().unwrap());

        monitor.set_observed(NetworkStatus::Online);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), NetworkStatus::Online);
    }

    #[tokio::test]
    async fn test_forced_status_expires() {
        let monitor = NetworkMonitor::default();

        monitor.force_status(NetworkStatus::Offline, Duration::from_millis(50));
        assert!(!monitor.is_online());

        // Observations do not override a pinned status
        monitor.report_success();
        assert!(!monitor.is_online());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(monitor.is_online());
    }

    #[test]
    fn test_clear_override() {
        let monitor = NetworkMonitor::default();
        monitor.force_status(NetworkStatus::Offline, Duration::from_secs(60));
        assert!(!monitor.is_online());

        monitor.clear_override();
        assert!(monitor.is_online());
    }
}
