// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("write queue stayed full for {0:?}, record dropped")]
    Timeout(Duration),
    #[error("writer is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WriteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WriteError::Timeout(_) => ErrorKind::Timeout,
            WriteError::Closed | WriteError::Io(_) => ErrorKind::Other,
        }
    }
}

/// Bounded queue in front of a slow sink.
///
/// A background task drains the queue into the sink. When the queue is
/// full, `write` waits at most `timeout` and then drops the record; a zero
/// timeout waits indefinitely.
pub struct DeferredWriter {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    drain: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    timeout: Duration,
}

impl DeferredWriter {
    pub fn new<W>(capacity: usize, timeout: Duration, sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let drain = tokio::spawn(drain(rx, sink));
        Self {
            tx: Mutex::new(Some(tx)),
            drain: Mutex::new(Some(drain)),
            timeout,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), WriteError> {
        let tx = self.sender().ok_or(WriteError::Closed)?;
        if self.timeout.is_zero() {
            return tx.send(bytes).await.map_err(|_| WriteError::Closed);
        }
        match tx.send_timeout(bytes, self.timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "writer: queue full, dropping record"
                );
                Err(WriteError::Timeout(self.timeout))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(WriteError::Closed),
        }
    }

    /// Stops accepting records, drains what is queued and shuts the sink down.
    pub async fn close(&self) -> Result<(), WriteError> {
        drop(self.tx.lock().unwrap_or_else(|e| e.into_inner()).take());
        let handle = self.drain.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(handle) = handle else {
            return Ok(());
        };
        match handle.await {
            Ok(res) => res.map_err(WriteError::from),
            Err(join) => Err(WriteError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                join.to_string(),
            ))),
        }
    }
}

async fn drain<W>(mut rx: mpsc::Receiver<Vec<u8>>, mut sink: W) -> std::io::Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let mut written = 0usize;
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = sink.write_all(&bytes).await {
            warn!(error = %e, "writer: sink write failed, record dropped");
            continue;
        }
        written += 1;
    }
    sink.flush().await?;
    sink.shutdown().await?;
    debug!(written, "writer: drained");
    Ok(())
}
