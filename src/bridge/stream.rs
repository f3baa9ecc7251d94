//! Host channel over an async byte stream
//!
//! Messages are framed as one JSON object per line:
//!
//! ```text
//! {"kind":"call","id":1,"message":{"action":"get","resource":"dataContextList"}}
//! {"kind":"reply","id":1,"message":{"success":true,"values":[]}}
//! ```
//!
//! Both sides may issue `call` frames; each is answered by a `reply` frame
//! carrying the same id. Ids are only unique per direction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::channel::{HostChannel, InboundHandler};
use crate::error::{Result, StackerError};

/// One line on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    Call { id: u64, message: Value },
    Reply { id: u64, message: Value },
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<Value>>,
}

struct Shared {
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Mutex<Pending>,
    handler: RwLock<Option<Weak<dyn InboundHandler>>>,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| StackerError::Channel(format!("write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| StackerError::Channel(format!("flush failed: {}", e)))
    }

    fn dispatch(&self, message: Value) -> Value {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.handle(message),
            None => {
                tracing::warn!("Host message arrived with no handler attached");
                json!({ "success": false })
            }
        }
    }

    fn resolve(&self, id: u64, message: Value) {
        let waiter = self.pending().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                // The caller may have stopped waiting in the meantime
                let _ = tx.send(message);
            }
            None => tracing::debug!("Discarding reply {} with no waiting call", id),
        }
    }

    fn shut_down(&self) {
        let mut pending = self.pending();
        pending.closed = true;
        pending.waiters.clear();
    }
}

/// [`HostChannel`] speaking JSON lines over a reader/writer pair
pub struct StreamChannel {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl StreamChannel {
    /// Start the channel. Must be called from within a tokio runtime, which
    /// runs the task reading from `reader`.
    pub fn new<R, W>(reader: R, writer: W, timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(Pending::default()),
            handler: RwLock::new(None),
        });
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&shared)));
        Self {
            shared,
            next_id: AtomicU64::new(1),
            timeout,
            reader_task,
        }
    }

    /// Channel over the process's stdin and stdout
    pub fn stdio(timeout: Duration) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Calls still waiting on a reply
    pub fn pending_calls(&self) -> usize {
        self.shared.pending().waiters.len()
    }

    /// True once the host side of the stream has gone away
    pub fn is_closed(&self) -> bool {
        self.shared.pending().closed
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[async_trait]
impl HostChannel for StreamChannel {
    fn attach(&self, handler: Weak<dyn InboundHandler>) {
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn call(&self, message: Value) -> Result<Option<Value>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending();
            if pending.closed {
                return Err(StackerError::Channel("stream closed".to_string()));
            }
            pending.waiters.insert(id, tx);
        }

        if let Err(e) = self.shared.write_frame(&Frame::Call { id, message }).await {
            self.shared.pending().waiters.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Err(StackerError::Channel(
                "stream closed before reply".to_string(),
            )),
            Err(_) => {
                self.shared.pending().waiters.remove(&id);
                tracing::debug!("Call {} timed out after {:?}", id, self.timeout);
                Ok(None)
            }
        }
    }
}

async fn read_loop<R>(reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("Host stream reached end of input");
                break;
            }
            Err(e) => {
                tracing::warn!("Host stream read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Reply { id, message }) => shared.resolve(id, message),
            Ok(Frame::Call { id, message }) => {
                let reply = shared.dispatch(message);
                if let Err(e) = shared.write_frame(&Frame::Reply { id, message: reply }).await {
                    tracing::warn!("Failed to answer host call {}: {}", id, e);
                }
            }
            Err(e) => tracing::warn!("Ignoring malformed frame: {}", e),
        }
    }
    shared.shut_down();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_format() {
        let frame = Frame::Call {
            id: 7,
            message: json!({"action": "get", "resource": "interactiveFrame"}),
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("\"kind\":\"call\""));
        assert!(text.contains("\"id\":7"));

        let parsed: Frame =
            serde_json::from_str(r#"{"kind":"reply","id":7,"message":{"success":true}}"#).unwrap();
        assert_eq!(
            parsed,
            Frame::Reply {
                id: 7,
                message: json!({"success": true})
            }
        );
    }

    #[tokio::test]
    async fn test_call_times_out_without_reply() {
        let (local, _remote) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        let channel = StreamChannel::new(reader, writer, Duration::from_millis(20));

        let outcome = channel.call(json!({"action": "get"})).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_fails_after_stream_end() {
        let (local, remote) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        let channel = StreamChannel::new(reader, writer, Duration::from_secs(5));
        drop(remote);

        // Let the reader task observe end of input
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = channel.call(json!({})).await.unwrap_err();
        assert!(matches!(err, StackerError::Channel(_)));
    }
}
