//! Transport core: every phone-facing operation.
//!
//! Each operation takes its own [`ConnectionParameters`] snapshot, holds the
//! gate for its whole sequence, and fires its [`Completion`] exactly once
//! (success or failure) before the gate is released. Operations return
//! ordinary `LinkResult`s; a failure never poisons the link for the next
//! operation.

use crate::link::alarms::{parse_alarm_list, PhoneAlarm};
use crate::link::commands::{render, Category, CommandTable};
use crate::link::config::LinkConfig;
use crate::link::connection::{ConnectionFactory, PhoneConnection};
use crate::link::elements::{parse_element_list, type_code_for_extension, PhoneElement};
use crate::link::error::{LinkError, LinkResult};
use crate::link::exchange::{exchange, exchange_bytes, RetryPolicy};
use crate::link::gate::Gate;
use crate::link::messages::{encode_body, parse_message_list, parse_message_response, PhoneMessage};
use crate::link::scanner;
use crate::link::signal::{signal_power, SignalQuality};
use crate::link::transfer::{ChunkedFraming, DownloadReceipt, TransferFraming, UploadReceipt};
use crate::link::types::*;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Callbacks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One-shot completion callback. A panic inside the callback is caught and
/// logged.
pub struct Completion<T> {
    callback: Option<Box<dyn FnOnce(&LinkResult<T>) + Send>>,
}

impl<T> Completion<T> {
    pub fn new(f: impl FnOnce(&LinkResult<T>) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(f)),
        }
    }

    pub fn none() -> Self {
        Self { callback: None }
    }

    fn fire(self, result: &LinkResult<T>) {
        if let Some(cb) = self.callback {
            if std::panic::catch_unwind(AssertUnwindSafe(|| cb(result))).is_err() {
                log::error!("completion callback panicked");
            }
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::none()
    }
}

/// Per-candidate scan progress callback.
pub type ScanProgressFn = Arc<dyn Fn(ScanProgress) + Send + Sync>;

/// Per-item callback for batch helpers.
pub type ItemCallback<I, T> = Arc<dyn Fn(&I, &LinkResult<T>) + Send + Sync>;

fn guard_progress(progress: &ScanProgressFn, tick: ScanProgress) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| progress(tick))).is_err() {
        log::error!("scan progress callback panicked");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Call control arguments
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallKind {
    Voice,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DialMode {
    Tone,
    Pulse,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeDirection {
    Up,
    Down,
}

fn validate_number(number: &str) -> LinkResult<()> {
    let n = number.trim();
    if n.is_empty() {
        return Err(LinkError::invalid("empty phone number"));
    }
    if let Some(bad) = n.chars().find(|c| !(c.is_ascii_digit() || "+*#pPwW,".contains(*c))) {
        return Err(LinkError::invalid(format!("invalid character '{}' in number", bad)));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Operation handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A dispatched operation.
pub struct OperationHandle<T> {
    pub id: uuid::Uuid,
    join: JoinHandle<LinkResult<T>>,
}

impl<T> OperationHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the operation's result.
    pub async fn join(self) -> LinkResult<T> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(LinkError::io(format!("operation {} aborted: {}", self.id, e))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport core
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Owns the gate and runs every operation through it.
pub struct TransportCore {
    gate: Arc<Gate>,
    config: LinkConfig,
    framing: Arc<dyn TransferFraming>,
}

impl TransportCore {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: LinkConfig) -> Self {
        let framing = Arc::new(ChunkedFraming::new(config.chunk_size, config.download_quiet_polls));
        Self {
            gate: Arc::new(Gate::new(factory)),
            config,
            framing,
        }
    }

    /// Swap the file transfer framing.
    pub fn with_framing(mut self, framing: Arc<dyn TransferFraming>) -> Self {
        self.framing = framing;
        self
    }

    pub fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn commands(&self) -> &CommandTable {
        &self.config.commands
    }

    pub fn policy(&self) -> RetryPolicy {
        self.config.retry_policy()
    }

    // ── Dispatch ──────────────────────────────────────────────────

    /// Run an operation on its own task. `op` receives a handle to the core;
    /// the parameters it uses must already be captured by value.
    pub fn dispatch<T, F, Fut>(self: &Arc<Self>, op: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<TransportCore>) -> Fut,
        Fut: Future<Output = LinkResult<T>> + Send + 'static,
    {
        let id = uuid::Uuid::new_v4();
        let join = tokio::spawn(op(Arc::clone(self)));
        OperationHandle { id, join }
    }

    /// Like [`dispatch`](Self::dispatch) but tracked, so the owner can wait
    /// for every in-flight operation.
    pub fn dispatch_tracked<T, F, Fut>(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        op: F,
    ) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<TransportCore>) -> Fut,
        Fut: Future<Output = LinkResult<T>> + Send + 'static,
    {
        let id = uuid::Uuid::new_v4();
        let join = tracker.spawn(op(Arc::clone(self)));
        OperationHandle { id, join }
    }

    // ── Operation skeleton ────────────────────────────────────────

    /// Acquire the gate, connect, run `body`, close, fire `done`, release.
    async fn run<T, F, Fut>(
        &self,
        label: &str,
        params: &ConnectionParameters,
        done: Completion<T>,
        body: F,
    ) -> LinkResult<T>
    where
        F: FnOnce(Arc<dyn PhoneConnection>) -> Fut,
        Fut: Future<Output = LinkResult<T>>,
    {
        let mut guard = self.gate.acquire().await;
        log::debug!("{} on {} ({})", label, params.device, params.shorthand());

        let result = match guard.connect(params).await {
            Err(e) => Err(e),
            Ok(conn) => match AssertUnwindSafe(body(conn)).catch_unwind().await {
                Ok(r) => r,
                Err(_) => Err(LinkError::io(format!("{} aborted", label)).with_port(&params.device)),
            },
        };

        guard.release().await;
        if let Err(e) = &result {
            if e.is_no_answer() {
                log::debug!("{}: {}", label, e);
            } else {
                log::warn!("{}: {}", label, e);
            }
        }
        done.fire(&result);
        drop(guard);
        result
    }

    /// One exchange, reply text or error.
    async fn ask(&self, conn: &dyn PhoneConnection, command: &str) -> LinkResult<String> {
        exchange(conn, command, &self.policy()).await.into_result()
    }

    // ── Queries ───────────────────────────────────────────────────

    /// Raw capability text for `category`.
    pub async fn capability(
        &self,
        params: &ConnectionParameters,
        category: Category,
        done: Completion<String>,
    ) -> LinkResult<String> {
        let command = self.commands().capability(category).to_string();
        self.run("capability", params, done, |conn| async move {
            self.ask(conn.as_ref(), &command).await
        })
        .await
    }

    /// Elements of a file category.
    pub async fn list_elements(
        &self,
        params: &ConnectionParameters,
        category: Category,
        done: Completion<Vec<PhoneElement>>,
    ) -> LinkResult<Vec<PhoneElement>> {
        let command = match self.commands().files(category) {
            Ok(_) => self.commands().list(category).to_string(),
            Err(e) => {
                let result = Err(e);
                done.fire(&result);
                return result;
            }
        };
        self.run("list elements", params, done, |conn| async move {
            let reply = self.ask(conn.as_ref(), &command).await?;
            Ok(parse_element_list(&reply))
        })
        .await
    }

    pub async fn list_messages(
        &self,
        params: &ConnectionParameters,
        done: Completion<Vec<PhoneMessage>>,
    ) -> LinkResult<Vec<PhoneMessage>> {
        let command = self.commands().list(Category::Messages).to_string();
        self.run("list messages", params, done, |conn| async move {
            let reply = self.ask(conn.as_ref(), &command).await?;
            Ok(parse_message_list(&reply))
        })
        .await
    }

    /// Read one message by id.
    pub async fn read_message(
        &self,
        params: &ConnectionParameters,
        id: &str,
        done: Completion<PhoneMessage>,
    ) -> LinkResult<PhoneMessage> {
        let command = render(&self.commands().messages.read, &[("id", id)]);
        let id = id.to_string();
        self.run("read message", params, done, |conn| async move {
            let reply = self.ask(conn.as_ref(), &command).await?;
            let mut msg = parse_message_response(&reply)
                .ok_or_else(|| LinkError::parse(format!("no message in reply to '{}'", command)))?;
            if msg.id.is_none() {
                msg.id = Some(id);
            }
            Ok(msg)
        })
        .await
    }

    pub async fn list_alarms(
        &self,
        params: &ConnectionParameters,
        done: Completion<Vec<PhoneAlarm>>,
    ) -> LinkResult<Vec<PhoneAlarm>> {
        let command = self.commands().list(Category::Alarms).to_string();
        self.run("list alarms", params, done, |conn| async move {
            let reply = self.ask(conn.as_ref(), &command).await?;
            Ok(parse_alarm_list(&reply))
        })
        .await
    }

    pub async fn signal_strength(
        &self,
        params: &ConnectionParameters,
        done: Completion<SignalQuality>,
    ) -> LinkResult<SignalQuality> {
        let command = self.commands().call.signal.clone();
        self.run("signal strength", params, done, |conn| async move {
            signal_power(conn.as_ref(), &command, &self.policy()).await
        })
        .await
    }

    /// Send any command line; the reply text (or bracketed diagnostic) comes
    /// back as-is.
    pub async fn send_command(
        &self,
        params: &ConnectionParameters,
        line: &str,
        done: Completion<String>,
    ) -> LinkResult<String> {
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        self.run("manual command", params, done, |conn| async move {
            Ok(exchange(conn.as_ref(), &line, &self.policy()).await.text())
        })
        .await
    }

    /// Sample control lines and the receive queue.
    pub async fn line_status(
        &self,
        params: &ConnectionParameters,
        done: Completion<LineStatus>,
    ) -> LinkResult<LineStatus> {
        self.run("line status", params, done, |conn| async move {
            sample_line_status(conn.as_ref()).await
        })
        .await
    }

    // ── Files ─────────────────────────────────────────────────────

    /// Upload a local file into `category`. The phone-side name is the file
    /// stem; the type code comes from the extension.
    pub async fn upload_file(
        &self,
        params: &ConnectionParameters,
        category: Category,
        source: &Path,
        done: Completion<UploadReceipt>,
    ) -> LinkResult<UploadReceipt> {
        let commands = match self.commands().files(category) {
            Ok(c) => c.clone(),
            Err(e) => {
                let result = Err(e);
                done.fire(&result);
                return result;
            }
        };
        let name = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let type_code = source
            .extension()
            .map(|e| type_code_for_extension(&e.to_string_lossy()))
            .unwrap_or_default();
        let framing = Arc::clone(&self.framing);
        self.run("upload file", params, done, |conn| async move {
            framing
                .upload(conn.as_ref(), &commands, source, &name, &type_code, &self.policy())
                .await
        })
        .await
    }

    /// Download `element` into `dest_dir` as
    /// `<sanitized name>.<derived extension>`. An existing file is replaced.
    pub async fn download_element(
        &self,
        params: &ConnectionParameters,
        category: Category,
        element: &PhoneElement,
        dest_dir: &Path,
        done: Completion<DownloadReceipt>,
    ) -> LinkResult<DownloadReceipt> {
        let commands = match self.commands().files(category) {
            Ok(c) => c.clone(),
            Err(e) => {
                let result = Err(e);
                done.fire(&result);
                return result;
            }
        };
        let dest = dest_dir.join(element.local_file_name());
        let framing = Arc::clone(&self.framing);
        self.run("download element", params, done, |conn| async move {
            framing
                .download(conn.as_ref(), &commands, element, &dest, &self.policy())
                .await
        })
        .await
    }

    pub async fn delete_element(
        &self,
        params: &ConnectionParameters,
        category: Category,
        element: &PhoneElement,
        done: Completion<String>,
    ) -> LinkResult<String> {
        let command = match self.commands().files(category) {
            Ok(c) => render(&c.delete, &[("id", element.id.as_str())]),
            Err(e) => {
                let result = Err(e);
                done.fire(&result);
                return result;
            }
        };
        self.run("delete element", params, done, |conn| async move {
            self.ask(conn.as_ref(), &command).await
        })
        .await
    }

    /// Delete several elements, each as its own gated operation. A failed
    /// item does not stop the batch.
    pub async fn delete_elements(
        &self,
        params: &ConnectionParameters,
        category: Category,
        elements: &[PhoneElement],
        on_item: ItemCallback<PhoneElement, String>,
    ) -> Vec<LinkResult<String>> {
        let mut results = Vec::with_capacity(elements.len());
        for element in elements {
            let cb = Arc::clone(&on_item);
            let item = element.clone();
            let done = Completion::new(move |r: &LinkResult<String>| cb(&item, r));
            results.push(self.delete_element(params, category, element, done).await);
        }
        results
    }

    // ── Alarms ────────────────────────────────────────────────────

    pub async fn upload_alarm(
        &self,
        params: &ConnectionParameters,
        alarm: &PhoneAlarm,
        done: Completion<String>,
    ) -> LinkResult<String> {
        let slot = alarm.slot().to_string();
        let command = render(
            &self.commands().alarms.set,
            &[
                ("slot", slot.as_str()),
                ("date", alarm.date.as_str()),
                ("time", alarm.time.as_str()),
                ("days", alarm.days.as_str()),
            ],
        );
        self.run("upload alarm", params, done, |conn| async move {
            self.ask(conn.as_ref(), &command).await
        })
        .await
    }

    /// Upload several alarms, each as its own gated operation.
    pub async fn upload_alarms(
        &self,
        params: &ConnectionParameters,
        alarms: &[PhoneAlarm],
        on_item: ItemCallback<PhoneAlarm, String>,
    ) -> Vec<LinkResult<String>> {
        let mut results = Vec::with_capacity(alarms.len());
        for alarm in alarms {
            let cb = Arc::clone(&on_item);
            let item = alarm.clone();
            let done = Completion::new(move |r: &LinkResult<String>| cb(&item, r));
            results.push(self.upload_alarm(params, alarm, done).await);
        }
        results
    }

    pub async fn delete_alarm(
        &self,
        params: &ConnectionParameters,
        slot: u32,
        done: Completion<String>,
    ) -> LinkResult<String> {
        if slot == 0 {
            let result = Err(LinkError::invalid("alarm slots start at 1"));
            done.fire(&result);
            return result;
        }
        let command = render(&self.commands().alarms.delete, &[("slot", slot.to_string().as_str())]);
        self.run("delete alarm", params, done, |conn| async move {
            self.ask(conn.as_ref(), &command).await
        })
        .await
    }

    // ── Messages ──────────────────────────────────────────────────

    /// Send an SMS: header command, wait for the prompt, then body and
    /// Ctrl-Z. Returns the phone's final reply.
    pub async fn send_message(
        &self,
        params: &ConnectionParameters,
        message: &PhoneMessage,
        done: Completion<String>,
    ) -> LinkResult<String> {
        let recipient = message.recipient.clone().unwrap_or_default();
        if let Err(e) = validate_number(&recipient) {
            let result = Err(e);
            done.fire(&result);
            return result;
        }
        let header = render(&self.commands().messages.send, &[("number", recipient.trim())]);
        let body = encode_body(&message.body.replace('\u{1A}', ""));
        self.run("send message", params, done, |conn| async move {
            let policy = self.policy();
            let prompt = exchange(conn.as_ref(), &header, &policy).await.into_result()?;
            if !prompt.contains('>') {
                return Err(LinkError::parse(format!(
                    "expected send prompt, got {:?}",
                    prompt.trim()
                ))
                .with_port(conn.device()));
            }
            exchange_bytes(conn.as_ref(), "message body", &body, &policy)
                .await
                .into_result()
        })
        .await
    }

    pub async fn delete_message(
        &self,
        params: &ConnectionParameters,
        id: &str,
        done: Completion<String>,
    ) -> LinkResult<String> {
        let command = render(&self.commands().messages.delete, &[("id", id)]);
        self.run("delete message", params, done, |conn| async move {
            self.ask(conn.as_ref(), &command).await
        })
        .await
    }

    // ── Call control ──────────────────────────────────────────────

    /// Fire-and-forget command: silence is success, only a link failure is
    /// an error.
    async fn fire_and_forget(
        &self,
        label: &str,
        params: &ConnectionParameters,
        command: String,
        done: Completion<String>,
    ) -> LinkResult<String> {
        self.run(label, params, done, |conn| async move {
            match exchange(conn.as_ref(), &command, &self.policy()).await.into_result() {
                Ok(text) => Ok(text),
                Err(e) if e.is_no_answer() => Ok(String::new()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub async fn dial(
        &self,
        params: &ConnectionParameters,
        number: &str,
        kind: CallKind,
        mode: DialMode,
        done: Completion<String>,
    ) -> LinkResult<String> {
        if let Err(e) = validate_number(number) {
            let result = Err(e);
            done.fire(&result);
            return result;
        }
        let mode = match mode {
            DialMode::Tone => "T",
            DialMode::Pulse => "P",
            DialMode::Auto => "",
        };
        let suffix = match kind {
            CallKind::Voice => ";",
            CallKind::Data => "",
        };
        let command = render(
            &self.commands().call.dial,
            &[("mode", mode), ("number", number.trim()), ("suffix", suffix)],
        );
        self.fire_and_forget("dial", params, command, done).await
    }

    pub async fn hangup(
        &self,
        params: &ConnectionParameters,
        done: Completion<String>,
    ) -> LinkResult<String> {
        let command = self.commands().call.hangup.clone();
        self.fire_and_forget("hangup", params, command, done).await
    }

    pub async fn answer(
        &self,
        params: &ConnectionParameters,
        done: Completion<String>,
    ) -> LinkResult<String> {
        let command = self.commands().call.answer.clone();
        self.fire_and_forget("answer", params, command, done).await
    }

    pub async fn volume(
        &self,
        params: &ConnectionParameters,
        direction: VolumeDirection,
        done: Completion<String>,
    ) -> LinkResult<String> {
        let command = match direction {
            VolumeDirection::Up => self.commands().call.volume_up.clone(),
            VolumeDirection::Down => self.commands().call.volume_down.clone(),
        };
        self.fire_and_forget("volume", params, command, done).await
    }

    // ── Port scan ─────────────────────────────────────────────────

    /// Probe `candidates` (or the factory's list when `None`) with `params`.
    /// The gate is held for the whole scan.
    pub async fn scan_ports(
        &self,
        params: &ConnectionParameters,
        candidates: Option<Vec<String>>,
        progress: ScanProgressFn,
        done: Completion<ScanReport>,
    ) -> LinkResult<ScanReport> {
        let mut guard = self.gate.acquire().await;
        let candidates = candidates.unwrap_or_else(|| self.gate.factory().candidate_devices());
        log::info!("scanning {} candidate devices", candidates.len());

        let report = scanner::scan(
            &mut guard,
            params,
            &candidates,
            &self.commands().identity,
            &self.policy(),
            &|tick: ScanProgress| guard_progress(&progress, tick),
        )
        .await;
        log::info!(
            "scan finished: {} of {} answered in {} ms",
            report.active.len(),
            report.scanned,
            report.scan_time_ms
        );

        let result = Ok(report);
        done.fire(&result);
        drop(guard);
        result
    }
}

/// Control lines plus receive queue depth of an open handle.
pub async fn sample_line_status(conn: &dyn PhoneConnection) -> LinkResult<LineStatus> {
    Ok(LineStatus {
        device: conn.device().to_string(),
        lines: conn.control_lines().await?,
        available_bytes: conn.available_bytes().await?,
        sampled_at: chrono::Utc::now(),
    })
}
