// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::factory::ServicerFactory;
use super::mapper::{Mapper, MapperError};
use super::{Servicer, ServicerError};
use crate::config::{ConfigError, RemoteAccessConfig};
use crate::context::{Context, ContextError};
use crate::error::ErrorKind;
use crate::timer::{JobFuture, OnceSuccess};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("invalid glob {pattern:?}: {source}")]
    Glob {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
    #[error("{path}: file name does not match service name {name:?}")]
    FileName { path: PathBuf, name: String },
    #[error("{path}: {source}")]
    Duplicate {
        path: PathBuf,
        #[source]
        source: MapperError,
    },
    #[error("service {name:?} failed to start: {source}")]
    Start {
        name: String,
        #[source]
        source: ServicerError,
    },
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::Config { source, .. } => source.kind(),
            LoadError::Duplicate { source, .. } => source.kind(),
            LoadError::Start { source, .. } => source.kind(),
            LoadError::Glob { .. } | LoadError::Scan { .. } | LoadError::FileName { .. } => {
                ErrorKind::ConfigError
            }
        }
    }
}

/// Translates a path glob into an anchored regex. `**` crosses directory
/// separators, `*` and `?` do not.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                // `**/` also matches zero directories.
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    Regex::new(&out)
}

fn scan(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<(), LoadError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(LoadError::Scan {
                path: dir.to_path_buf(),
                source,
            })
        }
    };
    for entry in entries {
        let entry = entry.map_err(|source| LoadError::Scan {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                scan(&path, recursive, out)?;
            }
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>, LoadError> {
    let regex = glob_to_regex(pattern).map_err(|source| LoadError::Glob {
        pattern: pattern.to_string(),
        source,
    })?;
    let first_wild = pattern.find(['*', '?']).unwrap_or(pattern.len());
    let (root, relative) = match pattern[..first_wild].rfind('/') {
        Some(0) => ("/", false),
        Some(i) => (&pattern[..i], false),
        None => (".", true),
    };
    let recursive = pattern.contains("**") || pattern[first_wild..].contains('/');

    let mut found = Vec::new();
    scan(Path::new(root), recursive, &mut found)?;
    let mut matched: Vec<PathBuf> = found
        .into_iter()
        .map(|p| {
            if relative {
                p.strip_prefix(".").map(Path::to_path_buf).unwrap_or(p)
            } else {
                p
            }
        })
        .filter(|p| regex.is_match(&p.to_string_lossy()))
        .collect();
    matched.sort();
    Ok(matched)
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    files: Vec<PathBuf>,
    allow_start_fail: bool,
    retry_interval: Duration,
    check_file_name: bool,
    reload_interval: Option<Duration>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            allow_start_fail: true,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            check_file_name: true,
            reload_interval: None,
        }
    }
}

impl LoadOptions {
    pub fn files<P: Into<PathBuf>>(paths: impl IntoIterator<Item = P>) -> Self {
        Self {
            files: paths.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Expands `pattern` against the filesystem now.
    pub fn glob(pattern: &str) -> Result<Self, LoadError> {
        Ok(Self::files(expand_glob(pattern)?))
    }

    pub fn from_config(config: &RemoteAccessConfig) -> Result<Self, LoadError> {
        Ok(Self::glob(&config.conf_glob)?
            .allow_start_fail(config.allow_start_fail)
            .retry_interval(config.retry_interval))
    }

    pub fn allow_start_fail(mut self, allow: bool) -> Self {
        self.allow_start_fail = allow;
        self
    }

    /// Zero disables background retries, making start failures fatal.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn check_file_name(mut self, check: bool) -> Self {
        self.check_file_name = check;
        self
    }

    pub fn reload_interval(mut self, interval: Duration) -> Self {
        self.reload_interval = Some(interval);
        self
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.files
    }
}

/// Background retries of services that failed their first start.
pub struct RetryHandle {
    ctx: Context,
    names: Vec<String>,
    task: JoinHandle<Vec<String>>,
}

impl fmt::Debug for RetryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHandle")
            .field("services", &self.names)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl RetryHandle {
    fn spawn(retry: OnceSuccess, names: Vec<String>) -> Self {
        let ctx = Context::background();
        let run_ctx = ctx.clone();
        let task = tokio::spawn(async move { retry.run(&run_ctx).await });
        Self { ctx, names, task }
    }

    /// Services being retried.
    pub fn services(&self) -> &[String] {
        &self.names
    }

    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the retries to end and returns the services that never
    /// started. If the retry task itself died, every retried service is
    /// reported.
    pub async fn wait(self) -> Vec<String> {
        match self.task.await {
            Ok(left) => left,
            Err(e) => {
                error!(error = %e, services = ?self.names, "loader: retry task died");
                self.names
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub retrying: Vec<String>,
    pub retry: Option<RetryHandle>,
}

/// A load that stopped at `error`.
///
/// Services registered before the failure stay registered, and starts
/// already deferred keep retrying under `retry`.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct LoadFailure {
    #[source]
    pub error: LoadError,
    pub retry: Option<RetryHandle>,
}

impl LoadFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl From<LoadError> for LoadFailure {
    fn from(error: LoadError) -> Self {
        Self { error, retry: None }
    }
}

/// Turns service files into started servicers registered in a [`Mapper`].
pub struct Loader {
    factory: Arc<ServicerFactory>,
}

impl Loader {
    pub fn new(factory: Arc<ServicerFactory>) -> Self {
        Self { factory }
    }

    /// Loads every file in sorted order. Construction errors, duplicates
    /// and fatal start failures abort the load; earlier services stay
    /// registered and starts deferred before the failure keep retrying.
    pub async fn load(
        &self,
        ctx: &Context,
        mapper: &Arc<Mapper>,
        opts: &LoadOptions,
    ) -> Result<LoadReport, LoadFailure> {
        let retry = OnceSuccess::new(opts.retry_interval);
        let mut report = LoadReport::default();
        let outcome = self
            .load_files(ctx, mapper, opts, &retry, &mut report)
            .await;
        if !retry.is_empty() {
            report.retry = Some(RetryHandle::spawn(retry, report.retrying.clone()));
        }

        match outcome {
            Ok(()) => {
                info!(
                    loaded = report.loaded.len(),
                    retrying = report.retrying.len(),
                    "loader: load finished"
                );
                Ok(report)
            }
            Err(error) => {
                if !report.retrying.is_empty() {
                    warn!(
                        retrying = ?report.retrying,
                        error = %error,
                        "loader: load aborted, deferred starts keep retrying"
                    );
                }
                Err(LoadFailure {
                    error,
                    retry: report.retry,
                })
            }
        }
    }

    async fn load_files(
        &self,
        ctx: &Context,
        mapper: &Arc<Mapper>,
        opts: &LoadOptions,
        retry: &OnceSuccess,
        report: &mut LoadReport,
    ) -> Result<(), LoadError> {
        let retry_enabled = opts.allow_start_fail && !opts.retry_interval.is_zero();
        let mut files = opts.files.clone();
        files.sort();
        files.dedup();

        for path in &files {
            let servicer = self
                .factory
                .build_from_file(path, opts.reload_interval)
                .map_err(|source| LoadError::Config {
                    path: path.clone(),
                    source,
                })?;
            let name = servicer.name().to_string();
            if opts.check_file_name
                && path.file_stem().and_then(|s| s.to_str()) != Some(name.as_str())
            {
                return Err(LoadError::FileName {
                    path: path.clone(),
                    name,
                });
            }

            let servicer: Arc<dyn Servicer> = Arc::new(servicer);
            mapper
                .add(Arc::clone(&servicer))
                .map_err(|source| LoadError::Duplicate {
                    path: path.clone(),
                    source,
                })?;

            match servicer.start(ctx).await {
                Ok(()) => {
                    debug!(service = %name, path = %path.display(), "loader: service loaded");
                    report.loaded.push(name);
                }
                Err(e) if retry_enabled => {
                    warn!(service = %name, error = %e, "loader: start failed, retrying in background");
                    let job = retry_job(
                        Arc::clone(&self.factory),
                        Arc::clone(mapper),
                        path.clone(),
                        opts.reload_interval,
                    );
                    if retry.add_job(name.clone(), job).is_ok() {
                        report.retrying.push(name);
                    }
                }
                Err(source) => {
                    mapper.pop(&name);
                    return Err(LoadError::Start { name, source });
                }
            }
        }
        Ok(())
    }
}

fn retry_job(
    factory: Arc<ServicerFactory>,
    mapper: Arc<Mapper>,
    path: PathBuf,
    reload_interval: Option<Duration>,
) -> impl Fn(Context) -> JobFuture + Send + Sync + 'static {
    move |ctx: Context| {
        let factory = Arc::clone(&factory);
        let mapper = Arc::clone(&mapper);
        let path = path.clone();
        Box::pin(async move { restart(&ctx, &factory, &mapper, &path, reload_interval).await })
            as JobFuture
    }
}

/// Rebuilds the service from its file and starts it under `ctx`; on success
/// it replaces the failed instance in `mapper`.
async fn restart(
    ctx: &Context,
    factory: &ServicerFactory,
    mapper: &Mapper,
    path: &Path,
    reload_interval: Option<Duration>,
) -> Result<(), String> {
    let servicer: Arc<dyn Servicer> = Arc::new(
        factory
            .build_from_file(path, reload_interval)
            .map_err(|e| e.to_string())?,
    );
    if let Err(e) = servicer.start(ctx).await {
        let _ = servicer.stop().await;
        return Err(e.to_string());
    }
    if let Some(e @ ContextError::Cancelled) = ctx.err() {
        let _ = servicer.stop().await;
        return Err(e.to_string());
    }
    if let Some(previous) = mapper.set(Arc::clone(&servicer)) {
        if let Err(e) = previous.stop().await {
            warn!(service = %servicer.name(), error = %e, "loader: failed to stop replaced service");
        }
    }
    info!(service = %servicer.name(), "loader: service started after retry");
    Ok(())
}
