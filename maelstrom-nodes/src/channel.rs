//! Line-oriented duplex transport between a node and the Maelstrom harness.
//!
//! Inbound traffic is read one line at a time from any [`AsyncBufRead`].
//! Outbound traffic goes through an [`Outbox`]: handlers push whole
//! envelopes into an unbounded queue and a single writer task drains it, so
//! two handlers finishing at the same moment can never interleave partial
//! lines on stdout.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::message::{self, Envelope};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Sending half of the outbound channel. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Receiving half of the outbound channel, consumed by [`spawn_writer`] in
/// production or read directly by tests.
pub type OutboxReceiver = mpsc::UnboundedReceiver<Envelope>;

#[derive(Debug, thiserror::Error)]
#[error("outbound channel closed")]
pub struct OutboxClosed;

/// Creates a connected outbox pair.
pub fn outbox() -> (Outbox, OutboxReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Outbox { tx }, rx)
}

impl Outbox {
    /// Queues one envelope for delivery. Never blocks.
    pub fn push(&self, envelope: Envelope) -> Result<(), OutboxClosed> {
        self.tx.send(envelope).map_err(|_| OutboxClosed)
    }
}

/// Spawns the task that serializes queued envelopes onto `writer`.
///
/// The task ends when every [`Outbox`] handle has been dropped, or with an
/// error if the writer fails.
pub fn spawn_writer<W>(mut rx: OutboxReceiver, mut writer: W) -> JoinHandle<io::Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            write_envelope(&mut writer, &envelope).await?;
        }
        writer.flush().await
    })
}

/// Writes a single envelope as one JSON line and flushes.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = match message::encode(envelope) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(error = %err, dest = %envelope.dest, "dropping unencodable message");
            return Ok(());
        }
    };
    trace!(line = %String::from_utf8_lossy(&encoded).trim_end(), "sent");
    writer.write_all(&encoded).await?;
    writer.flush().await
}

/// Reads the next non-empty line, without its terminator.
///
/// Lines that are not valid UTF-8 are logged and skipped. Returns
/// `Ok(None)` at end of input.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let bytes = reader.read_until(b'\n', &mut buf).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let line = match String::from_utf8(std::mem::take(&mut buf)) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, len = bytes, "skipping line that is not valid UTF-8");
                continue;
            }
        };
        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
}
