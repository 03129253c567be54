use phonedeck_link::link::connection::{ConnectionFactory, SerialPortFactory};
use phonedeck_link::link::service::{Completion, OperationHandle, ScanProgressFn};
use phonedeck_link::link::{
    ConnectionParameters, LinkConfig, LinkError, LinkResult, LiveSettings, PhoneView, ScanReport,
    TransportCore,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub type PhoneDeckState = Arc<PhoneDeck>;

/// Application-side owner of the transport core.
///
/// Settings edits land in [`LiveSettings`]; every operation started here
/// takes a snapshot first, so later edits never affect work in flight.
pub struct PhoneDeck {
    core: Arc<TransportCore>,
    settings: LiveSettings,
    ports: RwLock<ScanReport>,
    view: Mutex<Option<PhoneView>>,
}

impl PhoneDeck {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: LinkConfig) -> PhoneDeckState {
        Arc::new(PhoneDeck {
            core: Arc::new(TransportCore::new(factory, config)),
            settings: LiveSettings::default(),
            ports: RwLock::new(ScanReport::default()),
            view: Mutex::new(None),
        })
    }

    /// State backed by real serial devices.
    pub fn serial(config: LinkConfig) -> PhoneDeckState {
        let factory = Arc::new(SerialPortFactory::new(config.read_timeout()));
        Self::new(factory, config)
    }

    pub fn core(&self) -> &Arc<TransportCore> {
        &self.core
    }

    pub fn settings(&self) -> &LiveSettings {
        &self.settings
    }

    /// Edit the live settings. Running operations keep their snapshot.
    pub fn update_settings(&self, edit: impl FnOnce(&mut ConnectionParameters)) {
        self.settings.update(edit);
    }

    /// Replace the settings from raw form values. Nothing changes when any
    /// value is out of range.
    pub fn apply_raw_settings(
        &self,
        device: &str,
        baud: u32,
        data_bits: u8,
        stop_bits: &str,
        parity: u8,
        flow: u8,
    ) -> LinkResult<()> {
        let params = ConnectionParameters::from_raw(device, baud, data_bits, stop_bits, parity, flow)?;
        log::debug!("settings now {} on {}", params.shorthand(), params.device);
        self.settings.update(move |p| *p = params);
        Ok(())
    }

    /// Snapshot the settings and dispatch `op` with them. When a view is
    /// open the operation is tracked by it.
    pub async fn dispatch<T, F, Fut>(&self, op: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<TransportCore>, ConnectionParameters) -> Fut,
        Fut: Future<Output = LinkResult<T>> + Send + 'static,
    {
        let params = self.settings.snapshot();
        let view = self.view.lock().await;
        match view.as_ref() {
            Some(v) => v.spawn(move |core| op(core, params)),
            None => self.core.dispatch(move |core| op(core, params)),
        }
    }

    // ── Port scan ─────────────────────────────────────────────────

    /// Scan every candidate device with the current settings and replace
    /// the stored port metadata.
    pub async fn scan_ports(&self, progress: ScanProgressFn) -> LinkResult<ScanReport> {
        let handle = self
            .dispatch(move |core, params| async move {
                core.scan_ports(&params, None, progress, Completion::none()).await
            })
            .await;
        let report = handle.join().await?;
        *self.ports.write().await = report.clone();
        Ok(report)
    }

    /// Result of the last scan.
    pub async fn ports(&self) -> ScanReport {
        self.ports.read().await.clone()
    }

    /// Point the settings at a device found by the last scan.
    pub async fn select_port(&self, device: &str) -> LinkResult<()> {
        if !self.ports.read().await.is_active(device) {
            return Err(LinkError::invalid(format!("{} did not answer the last scan", device)));
        }
        let device = device.to_string();
        self.update_settings(move |p| p.device = device);
        Ok(())
    }

    // ── View lifecycle ────────────────────────────────────────────

    /// Open a view on the current settings, closing any previous one.
    pub async fn open_view(&self) -> LinkResult<()> {
        let params = self.settings.snapshot();
        if params.device.is_empty() {
            return Err(LinkError::invalid("no device selected"));
        }
        let mut slot = self.view.lock().await;
        if let Some(mut old) = slot.take() {
            old.close().await;
        }
        *slot = Some(PhoneView::open(Arc::clone(&self.core), params).await);
        Ok(())
    }

    /// Close the open view, waiting for its operations.
    pub async fn close_view(&self) {
        let view = self.view.lock().await.take();
        if let Some(mut view) = view {
            view.close().await;
        }
    }

    pub async fn has_view(&self) -> bool {
        self.view.lock().await.is_some()
    }
}
