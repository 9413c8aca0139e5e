//! Cancellation cascade
//!
//! On SIGINT or SIGTERM every registered cancel function runs, the cascade
//! waits for each registered build to finish unwinding, and then every
//! registered temporary file is removed. Registration and draining share
//! one mutex; the lists are swapped out before they are walked, so anything
//! registered during a cascade belongs to the next one.

use crate::store::lock::with;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, warn};

type CancelFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Registered {
    funcs: Vec<(u64, CancelFn)>,
    files: Vec<PathBuf>,
    runners: Vec<watch::Receiver<bool>>,
}

/// Process-scoped registry of things to tear down on termination
#[derive(Default)]
pub struct CancellationRegistry {
    registered: Mutex<Registered>,
    cascade: tokio::sync::Mutex<()>,
    ignore_runners: AtomicBool,
    next_func: AtomicU64,
}

/// Marks a build as running until dropped
pub struct RunnerGuard {
    done: watch::Sender<bool>,
}

impl Drop for RunnerGuard {
    fn drop(&mut self) {
        let _ = self.done.send(true);
    }
}

/// A temporary file registered for removal; unregistered on drop
///
/// Dropping does not delete the file; its owner does that.
pub struct TrackedFile {
    registry: Arc<CancellationRegistry>,
    path: PathBuf,
}

impl TrackedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TrackedFile {
    fn drop(&mut self) {
        self.registry.remove_file(&self.path);
    }
}

/// A cancel function registered for the lifetime of one build
pub struct TrackedFunc {
    registry: Arc<CancellationRegistry>,
    id: u64,
}

impl Drop for TrackedFunc {
    fn drop(&mut self) {
        self.registry.remove_func(self.id);
    }
}

impl CancellationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Skip waiting for builds during the cascade
    pub fn set_ignore_runners(&self, ignore: bool) {
        self.ignore_runners.store(ignore, Ordering::SeqCst);
    }

    /// Register `func` until the next cascade; returns its id
    pub fn add_func(&self, func: impl FnOnce() + Send + 'static) -> u64 {
        let id = self.next_func.fetch_add(1, Ordering::Relaxed);
        with(&self.registered, |r| r.funcs.push((id, Box::new(func))));
        id
    }

    pub fn remove_func(&self, id: u64) {
        with(&self.registered, |r| r.funcs.retain(|(f, _)| *f != id));
    }

    /// Register `func` for the lifetime of the returned handle
    pub fn track_func(self: &Arc<Self>, func: impl FnOnce() + Send + 'static) -> TrackedFunc {
        TrackedFunc {
            registry: Arc::clone(self),
            id: self.add_func(func),
        }
    }

    pub fn add_file(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        with(&self.registered, |r| r.files.push(path));
    }

    pub fn remove_file(&self, path: &Path) {
        with(&self.registered, |r| r.files.retain(|p| p != path));
    }

    /// Register `path` for the lifetime of the returned handle
    pub fn track_file(self: &Arc<Self>, path: impl Into<PathBuf>) -> TrackedFile {
        let path = path.into();
        self.add_file(path.clone());
        TrackedFile {
            registry: Arc::clone(self),
            path,
        }
    }

    /// Register a running build; the cascade waits until the guard drops
    pub fn add_runner(&self) -> RunnerGuard {
        let (tx, rx) = watch::channel(false);
        with(&self.registered, |r| {
            r.runners.retain(|rx| !*rx.borrow());
            r.runners.push(rx);
        });
        RunnerGuard { done: tx }
    }

    /// Forget everything registered
    pub fn reset(&self) {
        with(&self.registered, |r| *r = Registered::default());
    }

    /// Number of cancel functions currently registered
    pub fn func_count(&self) -> usize {
        with(&self.registered, |r| r.funcs.len())
    }

    /// Number of files currently registered
    pub fn file_count(&self) -> usize {
        with(&self.registered, |r| r.files.len())
    }

    #[cfg(test)]
    pub(crate) fn tracked_files(&self) -> Vec<PathBuf> {
        with(&self.registered, |r| r.files.clone())
    }

    /// Cancel, wait for runners, then remove files
    pub async fn cascade(&self) {
        let _running = self.cascade.lock().await;
        let drained = with(&self.registered, std::mem::take);

        debug!(
            "Cancelling {} builds, removing {} files",
            drained.runners.len(),
            drained.files.len()
        );

        for (_, func) in drained.funcs {
            func();
        }

        if !self.ignore_runners.load(Ordering::SeqCst) {
            for mut runner in drained.runners {
                let _ = runner.wait_for(|done| *done).await;
            }
        }

        for file in drained.files {
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {}", file.display(), e),
            }
        }
    }

    /// Run the cascade on SIGINT or SIGTERM, then call `finish`
    pub fn install_with(
        self: &Arc<Self>,
        finish: impl FnOnce() + Send + 'static,
    ) -> io::Result<tokio::task::JoinHandle<()>> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let registry = Arc::clone(self);

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => {},
                _ = terminate.recv() => {},
            }
            registry.cascade().await;
            finish();
        }))
    }

    /// Run the cascade on SIGINT or SIGTERM, then exit with status 1
    pub fn install(self: &Arc<Self>) -> io::Result<tokio::task::JoinHandle<()>> {
        self.install_with(|| {
            eprintln!("\n\n!!! SIGINT or SIGTERM received, crashing container...");
            std::process::exit(1);
        })
    }
}
