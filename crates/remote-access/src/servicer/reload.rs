// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::{ConfigHooks, ServicerConfig};
use crate::context::Context;
use crate::messager::{ChannelProducer, Message, Producer};
use crate::option::{option_message, Options};
use crate::worker::{Worker, WorkerError};

/// Watches a service file and republishes its top-level values as an
/// option update whenever the file's modification time changes.
pub struct ConfigReloader {
    path: PathBuf,
    interval: Duration,
    hooks: ConfigHooks,
    producer: ChannelProducer,
    tx: mpsc::Sender<Message>,
    task: Mutex<Option<(Context, JoinHandle<()>)>>,
}

impl ConfigReloader {
    pub fn new(path: &Path, interval: Duration, hooks: ConfigHooks) -> Self {
        let (producer, tx) = ChannelProducer::new(4);
        Self {
            path: path.to_path_buf(),
            interval,
            hooks,
            producer,
            tx,
            task: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

async fn watch(
    ctx: Context,
    path: PathBuf,
    interval: Duration,
    hooks: ConfigHooks,
    tx: mpsc::Sender<Message>,
) {
    let mut seen = modified(&path);
    loop {
        tokio::select! {
            biased;
            _ = ctx.done() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let current = modified(&path);
        if current.is_none() || current == seen {
            continue;
        }
        seen = current;

        match ServicerConfig::from_file(&path, &hooks) {
            Ok(config) => {
                let update = Options::new(Arc::new(config.layer()));
                if tx.send(option_message(&update)).await.is_err() {
                    debug!(path = %path.display(), "reload: broker gone, stopping");
                    break;
                }
                info!(service = %config.name, path = %path.display(), "reload: options updated");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "reload: ignoring unparsable config");
            }
        }
    }
}

impl Producer for ConfigReloader {
    fn messages(&self) -> Option<mpsc::Receiver<Message>> {
        self.producer.messages()
    }
}

#[async_trait]
impl Worker for ConfigReloader {
    async fn start(&self, ctx: &Context) -> Result<(), WorkerError> {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return Ok(());
        }
        let ctx = ctx.child();
        let handle = tokio::spawn(watch(
            ctx.clone(),
            self.path.clone(),
            self.interval,
            self.hooks.clone(),
            self.tx.clone(),
        ));
        *task = Some((ctx, handle));
        Ok(())
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((ctx, handle)) = task {
            ctx.cancel();
            handle.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::{keys, options_from_message};

    const BODY: &str = "Name = \"db\"\n[Resource.static]\ndefault = [{ Host = \"h\", Port = 1 }]\n";

    #[tokio::test]
    async fn test_emits_update_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.toml");
        std::fs::write(&path, format!("ConnTimeOut = 100\n{BODY}")).unwrap();

        let reloader = ConfigReloader::new(&path, Duration::from_millis(10), ConfigHooks::new());
        let mut rx = reloader.messages().unwrap();
        reloader.start(&Context::background()).await.unwrap();

        // Make sure the new mtime differs on coarse-grained filesystems.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, format!("ConnTimeOut = 250\n{BODY}")).unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let options = options_from_message(&msg).unwrap();
        assert_eq!(
            options.duration_ms(keys::CONN_TIMEOUT, Duration::ZERO),
            Duration::from_millis(250)
        );
        reloader.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_parse_errors_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.toml");
        std::fs::write(&path, BODY).unwrap();

        let reloader = ConfigReloader::new(&path, Duration::from_millis(10), ConfigHooks::new());
        let mut rx = reloader.messages().unwrap();
        reloader.start(&Context::background()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, "Name = ").unwrap();

        let got = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(got.is_err());
        reloader.stop().await.unwrap();
    }
}
