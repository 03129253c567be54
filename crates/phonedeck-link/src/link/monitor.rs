//! Background line monitor.
//!
//! Samples the control lines and receive queue of one device once per
//! interval and publishes the latest [`LineStatus`] on a watch channel. Each
//! tick only *tries* to take the gate, with a timeout shorter than the
//! interval; when an operation holds it the tick is skipped.

use crate::link::gate::Gate;
use crate::link::service::sample_line_status;
use crate::link::types::{ConnectionParameters, LineStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to a running monitor task.
pub struct LineMonitor {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    status_rx: watch::Receiver<Option<LineStatus>>,
}

impl LineMonitor {
    /// Spawn the sampling task.
    pub fn start(gate: Arc<Gate>, params: ConnectionParameters, interval: Duration) -> Self {
        let (status_tx, status_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor_loop(gate, params, interval, status_tx, cancel.clone()));
        Self {
            cancel,
            task: Some(task),
            status_rx,
        }
    }

    /// Receiver for status updates. The initial value is `None` until the
    /// first successful sample.
    pub fn subscribe(&self) -> watch::Receiver<Option<LineStatus>> {
        self.status_rx.clone()
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<LineStatus> {
        self.status_rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Cancel the task and wait for it to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("line monitor task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for LineMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn monitor_loop(
    gate: Arc<Gate>,
    params: ConnectionParameters,
    interval: Duration,
    status_tx: watch::Sender<Option<LineStatus>>,
    cancel: CancellationToken,
) {
    let wait = (interval / 2).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    log::debug!("line monitor on {} every {:?}", params.device, interval);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::debug!("line monitor on {} cancelled", params.device);
                break;
            }

            _ = ticker.tick() => {
                let Some(mut guard) = gate.try_acquire_for(wait).await else {
                    log::trace!("line monitor tick skipped, link busy");
                    continue;
                };
                let sample = match guard.connect(&params).await {
                    Ok(conn) => sample_line_status(conn.as_ref()).await,
                    Err(e) => Err(e),
                };
                guard.release().await;
                drop(guard);

                match sample {
                    Ok(status) => {
                        status_tx.send_replace(Some(status));
                    }
                    Err(e) => log::debug!("line monitor sample failed: {}", e),
                }
            }
        }
    }
}
