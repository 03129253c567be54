//! File transfer framing.
//!
//! The byte-level framing of uploads and downloads is a pluggable
//! [`TransferFraming`] strategy. The shipped [`ChunkedFraming`] announces an
//! upload with a header command, streams the file in fixed-size chunks with
//! no per-chunk acknowledgement, then waits for the final reply. Downloads
//! stream the phone's output to disk until the link goes quiet, holding back
//! the trailing result code so it never lands in the file.

use crate::link::commands::{render, CategoryCommands};
use crate::link::connection::{decode_text, encode_text, PhoneConnection};
use crate::link::elements::PhoneElement;
use crate::link::error::{LinkError, LinkResult};
use crate::link::exchange::{collect_reply, drain_stale, final_code, ResultCode, RetryPolicy};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Longest trailer held back from a download (`\r\nERROR\r\n` and
/// friends).
const TRAILER_HOLDBACK: usize = 32;

/// Result of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub bytes_sent: u64,
    pub chunks: usize,
    /// Phone's final reply, possibly empty.
    pub reply: String,
}

/// Result of a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReceipt {
    pub path: PathBuf,
    pub bytes_written: u64,
}

/// How file bytes travel over the link.
#[async_trait::async_trait]
pub trait TransferFraming: Send + Sync {
    /// Send the file at `source` as `name` with `type_code`.
    async fn upload(
        &self,
        conn: &dyn PhoneConnection,
        commands: &CategoryCommands,
        source: &Path,
        name: &str,
        type_code: &str,
        policy: &RetryPolicy,
    ) -> LinkResult<UploadReceipt>;

    /// Fetch `element` into `dest`.
    async fn download(
        &self,
        conn: &dyn PhoneConnection,
        commands: &CategoryCommands,
        element: &PhoneElement,
        dest: &Path,
        policy: &RetryPolicy,
    ) -> LinkResult<DownloadReceipt>;
}

/// Header command, then raw chunks, no per-chunk acknowledgement.
#[derive(Debug, Clone)]
pub struct ChunkedFraming {
    pub chunk_size: usize,
    /// Consecutive empty polls that end a download once data has arrived.
    pub quiet_polls: u32,
}

impl Default for ChunkedFraming {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            quiet_polls: 3,
        }
    }
}

impl ChunkedFraming {
    pub fn new(chunk_size: usize, quiet_polls: u32) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            quiet_polls: quiet_polls.max(1),
        }
    }
}

/// Split `held` into the part that is safe to write and the tail that may
/// still turn out to be the closing result code.
fn flushable(held: &[u8]) -> usize {
    held.len().saturating_sub(TRAILER_HOLDBACK)
}

/// Drop a trailing final result code (and the line break before it) from
/// the held-back tail.
fn strip_trailer(tail: &[u8]) -> &[u8] {
    if final_code(&decode_text(tail)).is_none() {
        return tail;
    }
    let is_eol = |b: u8| b == b'\r' || b == b'\n';
    let mut end = tail.len();
    while end > 0 && is_eol(tail[end - 1]) {
        end -= 1;
    }
    let mut start = end;
    while start > 0 && !is_eol(tail[start - 1]) {
        start -= 1;
    }
    while start > 0 && is_eol(tail[start - 1]) {
        start -= 1;
    }
    &tail[..start]
}

#[async_trait::async_trait]
impl TransferFraming for ChunkedFraming {
    async fn upload(
        &self,
        conn: &dyn PhoneConnection,
        commands: &CategoryCommands,
        source: &Path,
        name: &str,
        type_code: &str,
        policy: &RetryPolicy,
    ) -> LinkResult<UploadReceipt> {
        let mut file = tokio::fs::File::open(source)
            .await
            .map_err(|e| LinkError::io(format!("cannot read {}: {}", source.display(), e)))?;
        let size = file.metadata().await?.len();

        let header = render(
            &commands.upload,
            &[("name", name), ("type", type_code), ("size", size.to_string().as_str())],
        );
        let mut line = encode_text(&header);
        line.push(b'\r');
        drain_stale(conn, policy).await?;
        conn.send(&line).await?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut sent = 0u64;
        let mut chunks = 0usize;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            conn.send(&buf[..n]).await?;
            sent += n as u64;
            chunks += 1;
        }
        log::debug!(
            "{}: uploaded {} bytes of {} in {} chunks",
            conn.device(),
            sent,
            source.display(),
            chunks
        );

        let reply = collect_reply(conn, policy).await?.unwrap_or_default();
        Ok(UploadReceipt {
            bytes_sent: sent,
            chunks,
            reply,
        })
    }

    async fn download(
        &self,
        conn: &dyn PhoneConnection,
        commands: &CategoryCommands,
        element: &PhoneElement,
        dest: &Path,
        policy: &RetryPolicy,
    ) -> LinkResult<DownloadReceipt> {
        let command = render(&commands.download, &[("id", element.id.as_str())]);
        let mut line = encode_text(&command);
        line.push(b'\r');
        drain_stale(conn, policy).await?;
        conn.send(&line).await?;

        let file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| LinkError::io(format!("cannot create {}: {}", dest.display(), e)))?;

        match self.receive_into(conn, &command, file, policy).await {
            Ok(written) => {
                log::debug!("{}: downloaded {} bytes to {}", conn.device(), written, dest.display());
                Ok(DownloadReceipt {
                    path: dest.to_path_buf(),
                    bytes_written: written,
                })
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(dest).await {
                    log::debug!("could not remove partial {}: {}", dest.display(), rm);
                }
                Err(e.with_port(conn.device()))
            }
        }
    }
}

impl ChunkedFraming {
    /// Stream the reply to `command` into `file`. Returns the bytes written.
    /// The caller removes the file on error.
    async fn receive_into(
        &self,
        conn: &dyn PhoneConnection,
        command: &str,
        mut file: tokio::fs::File,
        policy: &RetryPolicy,
    ) -> LinkResult<u64> {
        let mut held: Vec<u8> = Vec::new();
        let mut written = 0u64;
        let mut started = false;
        let mut empty_polls = 0u32;
        let mut echo_pending = true;

        loop {
            let chunk = conn.recv(policy.recv_window).await?;
            if chunk.is_empty() {
                empty_polls += 1;
                let budget = if started { self.quiet_polls } else { policy.max_trials };
                if empty_polls >= budget {
                    break;
                }
                continue;
            }
            empty_polls = 0;
            started = true;
            held.extend_from_slice(&chunk);

            if echo_pending {
                // A leading echo of the command is not file content.
                let echo = encode_text(command);
                if held.len() < echo.len() + 2 && echo.starts_with(&held[..held.len().min(echo.len())]) {
                    continue;
                }
                if held.starts_with(&echo) {
                    let mut skip = echo.len();
                    while skip < held.len() && (held[skip] == b'\r' || held[skip] == b'\n') {
                        skip += 1;
                    }
                    held.drain(..skip);
                }
                echo_pending = false;
            }

            let n = flushable(&held);
            if n > 0 {
                file.write_all(&held[..n]).await?;
                written += n as u64;
                held.drain(..n);
            }
        }

        if !started {
            return Err(LinkError::no_answer(command, policy.max_trials));
        }

        let tail = strip_trailer(&held);
        if written == 0 && tail.iter().all(|b| b.is_ascii_whitespace()) {
            if let Some(code) = final_code(&decode_text(&held)).filter(ResultCode::is_error) {
                return Err(LinkError::io(format!("phone refused '{}': {:?}", command, code)));
            }
        }
        file.write_all(tail).await?;
        written += tail.len() as u64;
        file.flush().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::connection::ConnectionFactory;
    use crate::link::simulated::{SimReply, SimulatedConnection, SimulatedFactory};
    use crate::link::types::ConnectionParameters;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_trials: 3,
            recv_window: Duration::from_millis(5),
        }
    }

    async fn open(sim: Arc<SimulatedConnection>) -> Arc<dyn PhoneConnection> {
        let factory = SimulatedFactory::new();
        let device = sim.device().to_string();
        factory.add(sim);
        factory.open(&ConnectionParameters::new(device)).await.unwrap()
    }

    #[test]
    fn test_strip_trailer() {
        assert_eq!(strip_trailer(b"data\r\nOK\r\n"), b"data");
        assert_eq!(strip_trailer(b"data\r\n"), b"data\r\n");
        assert_eq!(strip_trailer(b"\r\nOK\r\n"), b"");
    }

    #[tokio::test]
    async fn test_upload_streams_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tone.mid");
        let content: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &content).unwrap();

        let len = content.len();
        let sim = SimulatedConnection::with_responder("SIM0", move |line| {
            if line.starts_with("AT+EWRT=\"sounds\",\"tone\",\"MIDI\",") {
                SimReply::AcceptRaw {
                    bytes: len,
                    then: "\r\nOK\r\n".to_string(),
                }
            } else {
                SimReply::Silent
            }
        });
        let conn = open(sim.clone()).await;
        let framing = ChunkedFraming::new(1024, 3);
        let cmds = CategoryCommands::for_directory("sounds");
        let receipt = framing
            .upload(conn.as_ref(), &cmds, &src, "tone", "MIDI", &fast())
            .await
            .unwrap();

        assert_eq!(receipt.bytes_sent, 2500);
        assert_eq!(receipt.chunks, 3);
        assert!(receipt.reply.contains("OK"));
        assert_eq!(sim.raw_received().await, content);
        assert_eq!(sim.lines_seen().await[0], "AT+EWRT=\"sounds\",\"tone\",\"MIDI\",2500");
    }

    #[tokio::test]
    async fn test_upload_missing_file_is_io_error() {
        let sim = SimulatedConnection::silent("SIM0");
        let conn = open(sim.clone()).await;
        let err = ChunkedFraming::default()
            .upload(
                conn.as_ref(),
                &CategoryCommands::for_directory("pictures"),
                Path::new("/nonexistent/phonedeck.jpg"),
                "x",
                "JPEG",
                &fast(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::link::error::LinkErrorKind::IoError);
        assert!(sim.sends().await.is_empty(), "nothing sent for a missing file");
    }

    #[tokio::test]
    async fn test_download_strips_trailer() {
        let payload: Vec<u8> = (0..200u8).collect();
        let mut reply = payload.clone();
        reply.extend_from_slice(b"\r\nOK\r\n");
        let sim = SimulatedConnection::with_responder("SIM0", move |line| {
            if line == "AT+EREAD=4" {
                SimReply::Bytes(reply.clone())
            } else {
                SimReply::Silent
            }
        });
        sim.set_chunk_limit(64);
        let conn = open(sim).await;

        let dir = tempfile::tempdir().unwrap();
        let element = PhoneElement::new("4", Some("JPEG"), "cat pic");
        let dest = dir.path().join(element.local_file_name());
        let receipt = ChunkedFraming::default()
            .download(
                conn.as_ref(),
                &CategoryCommands::for_directory("pictures"),
                &element,
                &dest,
                &fast(),
            )
            .await
            .unwrap();

        assert_eq!(receipt.bytes_written, 200);
        assert_eq!(std::fs::read(&dest).unwrap(), payload);
        assert!(dest.ends_with("cat_pic.jpg"));
    }

    #[tokio::test]
    async fn test_download_refused_leaves_no_file() {
        let sim = SimulatedConnection::with_responder("SIM0", |_| SimReply::Text("\r\nERROR\r\n".into()));
        let conn = open(sim).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x.jpg");
        let err = ChunkedFraming::default()
            .download(
                conn.as_ref(),
                &CategoryCommands::for_directory("pictures"),
                &PhoneElement::new("9", Some("JPEG"), "x"),
                &dest,
                &fast(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::link::error::LinkErrorKind::IoError);
        assert!(err.message.contains("AT+EREAD=9"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_download_link_failure_removes_partial_file() {
        let sim = SimulatedConnection::with_responder("SIM0", |line| {
            if line == "AT+EREAD=2" {
                SimReply::Bytes(vec![0x55; 100])
            } else {
                SimReply::Silent
            }
        });
        sim.set_chunk_limit(40);
        let conn = open(sim.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("y.jpg");

        let failing = conn.clone();
        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            failing.close().await.unwrap();
        });
        let result = ChunkedFraming::new(1024, 50)
            .download(
                conn.as_ref(),
                &CategoryCommands::for_directory("pictures"),
                &PhoneElement::new("2", Some("JPEG"), "y"),
                &dest,
                &fast(),
            )
            .await;
        closer.await.unwrap();

        let err = result.unwrap_err();
        assert_eq!(err.kind, crate::link::error::LinkErrorKind::IoError);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_download_no_answer() {
        let sim = SimulatedConnection::silent("SIM0");
        let conn = open(sim).await;
        let dir = tempfile::tempdir().unwrap();
        let err = ChunkedFraming::default()
            .download(
                conn.as_ref(),
                &CategoryCommands::for_directory("pictures"),
                &PhoneElement::new("1", None, "x"),
                &dir.path().join("x"),
                &fast(),
            )
            .await
            .unwrap_err();
        assert!(err.is_no_answer());
    }
}
