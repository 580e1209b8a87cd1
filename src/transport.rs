// ABOUTME: Line-framed JSON over a child process's stdio, shared by both wire protocols.
// ABOUTME: Also holds the request ledger correlating outbound ids to waiting callers.

use crate::error::BridgeError;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

/// Buffers raw bytes and yields complete lines, however the underlying stream
/// chunks them. A line split across two reads is reassembled; trailing `\r`
/// is stripped.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, get back every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Any unterminated tail still buffered.
    pub fn pending(&self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buf).into_owned())
        }
    }
}

/// Reads newline-delimited JSON documents from an async stream.
///
/// Malformed lines come back as `Err(BridgeError::Protocol)` without
/// terminating the stream; the next call keeps reading. `None` means EOF.
pub struct JsonLineReader<R> {
    reader: R,
    framer: LineFramer,
    queued: VecDeque<String>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> JsonLineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            framer: LineFramer::new(),
            queued: VecDeque::new(),
            eof: false,
        }
    }

    pub async fn next(&mut self) -> Option<Result<Value, BridgeError>> {
        loop {
            while let Some(line) = self.queued.pop_front() {
                if line.trim().is_empty() {
                    continue;
                }
                return Some(serde_json::from_str(&line).map_err(|e| {
                    BridgeError::Protocol(format!("malformed frame: {e}"))
                }));
            }
            if self.eof {
                return None;
            }
            let mut chunk = [0u8; 4096];
            match self.reader.read(&mut chunk).await {
                Ok(0) => {
                    self.eof = true;
                    // A final unterminated line still counts as a frame.
                    if let Some(tail) = self.framer.pending() {
                        self.queued.push_back(tail);
                        self.framer = LineFramer::new();
                    }
                }
                Ok(n) => {
                    self.queued.extend(self.framer.push(&chunk[..n]));
                }
                Err(e) => {
                    self.eof = true;
                    return Some(Err(BridgeError::Transport(format!("stdout read failed: {e}"))));
                }
            }
        }
    }
}

/// Serialize one JSON document plus a newline to the sink.
pub async fn write_json_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &Value,
) -> Result<(), BridgeError> {
    let mut line = serde_json::to_vec(value)
        .map_err(|e| BridgeError::Protocol(format!("unserializable frame: {e}")))?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| BridgeError::Transport(format!("stdin write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::Transport(format!("stdin flush failed: {e}")))
}

/// Correlates outbound request ids with waiting callers.
///
/// Ids are unique and monotonically increasing for the ledger's lifetime.
/// Each entry is fulfilled or failed exactly once; a response for an unknown
/// id is a no-op.
pub struct RequestLedger {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, BridgeError>>>>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate an id and register a waiter for its response.
    pub fn register(&self) -> (u64, oneshot::Receiver<Result<Value, BridgeError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        (id, rx)
    }

    /// Deliver a response. Returns false (and changes nothing) if the id is
    /// unknown - already fulfilled, forgotten, or never issued.
    pub fn fulfill(&self, id: u64, result: Result<Value, BridgeError>) -> bool {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop a waiter without fulfilling it (e.g. the write failed before the
    /// request ever reached the agent).
    pub fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Fail every outstanding request, used at teardown.
    pub fn fail_all(&self, mut err: impl FnMut() -> BridgeError) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(err()));
        }
    }
}

impl Default for RequestLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn framer_reassembles_split_lines() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"{\"a\":").is_empty());
        let lines = framer.push(b"1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        let lines = framer.push(b":3}\n");
        assert_eq!(lines, vec!["{\"c\":3}".to_string()]);
        assert!(framer.pending().is_none());
    }

    #[test]
    fn framer_strips_carriage_returns() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"{}\r\n");
        assert_eq!(lines, vec!["{}".to_string()]);
    }

    #[tokio::test]
    async fn reader_survives_malformed_lines() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = JsonLineReader::new(server);

        client.write_all(b"{\"ok\":true}\nnot json\n{\"n\":2}\n").await.unwrap();
        drop(client);

        assert_eq!(reader.next().await.unwrap().unwrap(), json!({"ok": true}));
        assert!(matches!(
            reader.next().await.unwrap(),
            Err(BridgeError::Protocol(_))
        ));
        assert_eq!(reader.next().await.unwrap().unwrap(), json!({"n": 2}));
        assert!(reader.next().await.is_none());
    }

    #[test]
    fn ledger_ids_are_monotonic() {
        let ledger = RequestLedger::new();
        let (a, _rx_a) = ledger.register();
        let (b, _rx_b) = ledger.register();
        assert!(b > a);
    }

    #[tokio::test]
    async fn ledger_fulfills_exactly_once() {
        let ledger = RequestLedger::new();
        let (id, rx) = ledger.register();
        assert!(ledger.fulfill(id, Ok(json!("first"))));
        assert!(!ledger.fulfill(id, Ok(json!("second"))));
        assert_eq!(rx.await.unwrap().unwrap(), json!("first"));
    }

    #[test]
    fn ledger_unknown_id_is_noop() {
        let ledger = RequestLedger::new();
        assert!(!ledger.fulfill(999, Ok(json!(null))));
    }
}
