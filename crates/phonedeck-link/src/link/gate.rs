//! The exclusive-access gate over the phone link.
//!
//! Every sequence of sends and receives runs while holding a [`GateGuard`].
//! The gate owns the link slot: at most one cached open handle plus a pin
//! count. While something is pinned (a view with a running line monitor),
//! the cached handle survives between operations; otherwise it is closed
//! when the operation releases the gate.

use crate::link::connection::{ConnectionFactory, PhoneConnection};
use crate::link::error::LinkResult;
use crate::link::types::ConnectionParameters;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
struct LinkSlot {
    current: Option<(ConnectionParameters, Arc<dyn PhoneConnection>)>,
    pins: usize,
}

impl LinkSlot {
    async fn close_current(&mut self) {
        if let Some((_, conn)) = self.current.take() {
            close_quietly(conn.as_ref()).await;
        }
    }
}

async fn close_quietly(conn: &dyn PhoneConnection) {
    if let Err(e) = conn.close().await {
        log::warn!("closing {} failed: {}", conn.device(), e);
    }
}

/// Single exclusive-access token for the link. Cheap to share behind an
/// `Arc`; never global.
pub struct Gate {
    slot: Arc<Mutex<LinkSlot>>,
    factory: Arc<dyn ConnectionFactory>,
}

impl Gate {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(LinkSlot::default())),
            factory,
        }
    }

    pub fn factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.factory
    }

    /// Wait for the gate.
    pub async fn acquire(&self) -> GateGuard {
        let slot = Arc::clone(&self.slot).lock_owned().await;
        GateGuard {
            slot,
            factory: Arc::clone(&self.factory),
            transient: Vec::new(),
        }
    }

    /// Wait at most `timeout` for the gate.
    pub async fn try_acquire_for(&self, timeout: Duration) -> Option<GateGuard> {
        let slot = tokio::time::timeout(timeout, Arc::clone(&self.slot).lock_owned())
            .await
            .ok()?;
        Some(GateGuard {
            slot,
            factory: Arc::clone(&self.factory),
            transient: Vec::new(),
        })
    }

    /// Keep the cached handle open between operations.
    pub async fn pin(&self) {
        self.slot.lock().await.pins += 1;
    }

    /// Drop one pin; the cached handle is closed when the last pin goes.
    pub async fn unpin(&self) {
        let mut slot = self.slot.lock().await;
        slot.pins = slot.pins.saturating_sub(1);
        if slot.pins == 0 {
            slot.close_current().await;
        }
    }

    pub async fn is_pinned(&self) -> bool {
        self.slot.lock().await.pins > 0
    }
}

/// Proof of exclusive access. Obtain handles through [`GateGuard::connect`]
/// and finish with [`GateGuard::release`].
pub struct GateGuard {
    slot: OwnedMutexGuard<LinkSlot>,
    factory: Arc<dyn ConnectionFactory>,
    transient: Vec<Arc<dyn PhoneConnection>>,
}

impl GateGuard {
    /// Handle for `params`.
    ///
    /// Reuses the cached handle when its parameters match. A pinned handle
    /// on another device is left alone and a transient handle is opened
    /// instead; any other cached handle is replaced.
    pub async fn connect(
        &mut self,
        params: &ConnectionParameters,
    ) -> LinkResult<Arc<dyn PhoneConnection>> {
        if let Some((cached, conn)) = &self.slot.current {
            if cached == params && conn.is_open() {
                return Ok(Arc::clone(conn));
            }
            if self.slot.pins > 0 && cached.device != params.device && conn.is_open() {
                let conn = self.factory.open(params).await?;
                log::debug!("transient handle on {} beside pinned {}", params.device, cached.device);
                self.transient.push(Arc::clone(&conn));
                return Ok(conn);
            }
        }
        self.slot.close_current().await;
        let conn = self.factory.open(params).await?;
        self.slot.current = Some((params.clone(), Arc::clone(&conn)));
        Ok(conn)
    }

    /// Close transient handles, and the cached one unless pinned. The gate
    /// itself is released when the guard is dropped.
    pub async fn release(&mut self) {
        for conn in self.transient.drain(..) {
            close_quietly(conn.as_ref()).await;
        }
        if self.slot.pins == 0 {
            self.slot.close_current().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::simulated::{SimulatedConnection, SimulatedFactory};

    fn gate_with(devices: &[&str]) -> (Gate, Vec<Arc<SimulatedConnection>>) {
        let factory = SimulatedFactory::new();
        let sims: Vec<_> = devices.iter().map(|d| SimulatedConnection::silent(*d)).collect();
        for s in &sims {
            factory.add(s.clone());
        }
        (Gate::new(Arc::new(factory)), sims)
    }

    #[tokio::test]
    async fn test_unpinned_release_closes() {
        let (gate, sims) = gate_with(&["A"]);
        let mut guard = gate.acquire().await;
        let conn = guard.connect(&ConnectionParameters::new("A")).await.unwrap();
        assert!(conn.is_open());
        guard.release().await;
        assert!(!sims[0].is_open());
    }

    #[tokio::test]
    async fn test_pinned_handle_is_reused() {
        let (gate, sims) = gate_with(&["A"]);
        gate.pin().await;
        let params = ConnectionParameters::new("A");
        for _ in 0..3 {
            let mut guard = gate.acquire().await;
            guard.connect(&params).await.unwrap();
            guard.release().await;
        }
        assert!(sims[0].is_open());
        assert_eq!(sims[0].open_count(), 1);
        gate.unpin().await;
        assert!(!sims[0].is_open());
    }

    #[tokio::test]
    async fn test_pinned_other_device_uses_transient() {
        let (gate, sims) = gate_with(&["A", "B"]);
        gate.pin().await;
        {
            let mut guard = gate.acquire().await;
            guard.connect(&ConnectionParameters::new("A")).await.unwrap();
            guard.release().await;
        }
        let mut guard = gate.acquire().await;
        guard.connect(&ConnectionParameters::new("B")).await.unwrap();
        assert!(sims[1].is_open());
        guard.release().await;
        assert!(sims[0].is_open(), "pinned handle survives");
        assert!(!sims[1].is_open(), "transient handle closed");
    }

    #[tokio::test]
    async fn test_changed_params_reopen() {
        let (gate, sims) = gate_with(&["A"]);
        gate.pin().await;
        let mut guard = gate.acquire().await;
        guard.connect(&ConnectionParameters::new("A")).await.unwrap();
        let mut slower = ConnectionParameters::new("A");
        slower.baud_rate = crate::link::types::BaudRate::Baud9600;
        guard.connect(&slower).await.unwrap();
        assert_eq!(sims[0].open_count(), 2);
        assert_eq!(sims[0].last_params().await.unwrap().baud_rate.value(), 9600);
    }

    #[tokio::test]
    async fn test_try_acquire_times_out_while_held() {
        let (gate, _) = gate_with(&["A"]);
        let _held = gate.acquire().await;
        assert!(gate.try_acquire_for(Duration::from_millis(20)).await.is_none());
    }
}
