//! Lifetime of one open phone view.
//!
//! A view pins the link so its handle stays open, runs a [`LineMonitor`],
//! and tracks every operation it dispatches. Closing the view cancels and
//! joins the monitor, waits for in-flight operations, then unpins.

use crate::link::error::LinkResult;
use crate::link::monitor::LineMonitor;
use crate::link::service::{OperationHandle, TransportCore};
use crate::link::types::{ConnectionParameters, LineStatus};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;

pub struct PhoneView {
    core: Arc<TransportCore>,
    params: ConnectionParameters,
    tracker: TaskTracker,
    monitor: Option<LineMonitor>,
    closed: bool,
}

impl PhoneView {
    /// Pin the link and start monitoring `params.device`.
    pub async fn open(core: Arc<TransportCore>, params: ConnectionParameters) -> Self {
        core.gate().pin().await;
        let monitor = LineMonitor::start(
            Arc::clone(core.gate()),
            params.clone(),
            core.config().poll_interval(),
        );
        log::info!("view opened on {} ({})", params.device, params.shorthand());
        Self {
            core,
            params,
            tracker: TaskTracker::new(),
            monitor: Some(monitor),
            closed: false,
        }
    }

    pub fn core(&self) -> &Arc<TransportCore> {
        &self.core
    }

    /// Parameters the view was opened with.
    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    pub fn line_status(&self) -> Option<watch::Receiver<Option<LineStatus>>> {
        self.monitor.as_ref().map(LineMonitor::subscribe)
    }

    /// Dispatch an operation owned by this view.
    pub fn spawn<T, F, Fut>(&self, op: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<TransportCore>) -> Fut,
        Fut: Future<Output = LinkResult<T>> + Send + 'static,
    {
        self.core.dispatch_tracked(&self.tracker, op)
    }

    /// Operations still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop the monitor, wait for every spawned operation, release the pin.
    /// Calling it twice is harmless.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop().await;
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.core.gate().unpin().await;
        self.closed = true;
        log::info!("view on {} closed", self.params.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::connection::PhoneConnection;
    use crate::link::commands::Category;
    use crate::link::config::LinkConfig;
    use crate::link::service::Completion;
    use crate::link::simulated::{SimReply, SimulatedConnection, SimulatedFactory};
    use std::time::Duration;

    fn core_with(sim: Arc<SimulatedConnection>) -> Arc<TransportCore> {
        let factory = SimulatedFactory::new();
        factory.add(sim);
        let config = LinkConfig {
            recv_window_ms: 5,
            poll_interval_ms: 20,
            ..LinkConfig::default()
        };
        Arc::new(TransportCore::new(Arc::new(factory), config))
    }

    #[tokio::test]
    async fn test_close_waits_for_operations_and_unpins() {
        let sim = SimulatedConnection::with_responder("SIM0", |line| {
            if line.starts_with("AT+ECAP") {
                SimReply::ok("+ECAP: \"JPEG\"")
            } else {
                SimReply::Silent
            }
        });
        let core = core_with(sim.clone());
        let params = ConnectionParameters::new("SIM0");
        let mut view = PhoneView::open(Arc::clone(&core), params.clone()).await;
        assert!(core.gate().is_pinned().await);

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let p = params.clone();
                view.spawn(move |core| async move {
                    core.capability(&p, Category::Pictures, Completion::none()).await
                })
            })
            .collect();

        view.close().await;
        assert_eq!(view.in_flight(), 0);
        for h in handles {
            assert!(h.join().await.unwrap().contains("JPEG"));
        }
        assert!(!core.gate().is_pinned().await);
        assert!(!sim.is_open());
        assert_eq!(sim.open_count(), 1, "operations reused the pinned handle");

        view.close().await;
        assert!(view.is_closed());
    }

    #[tokio::test]
    async fn test_view_exposes_monitor_updates() {
        let sim = SimulatedConnection::silent("SIM0");
        let core = core_with(sim);
        let mut view = PhoneView::open(core, ConnectionParameters::new("SIM0")).await;
        let mut rx = view.line_status().unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.is_some()))
            .await
            .unwrap()
            .unwrap();
        view.close().await;
        assert!(view.line_status().is_none());
    }
}
