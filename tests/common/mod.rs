//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;

use vmsetup::core::{ArtifactCache, CacheError, CacheKey, Ledger, LedgerError, MarkerLedger};
use vmsetup::domain::DiscoveredEnv;
use vmsetup::StepAction;

/// Counts invocations; fails while `failing` is set
#[derive(Default)]
pub struct CountingAction {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl CountingAction {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let action = Self::new();
        action.set_failing(true);
        action
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepAction for CountingAction {
    async fn execute(&self, _env: &DiscoveredEnv) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("simulated install failure");
        }
        Ok(())
    }
}

/// Writes a small "install" into a directory, counting invocations
pub struct InstallAction {
    pub target: PathBuf,
    calls: AtomicUsize,
}

impl InstallAction {
    pub fn new(target: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            target: target.into(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepAction for InstallAction {
    async fn execute(&self, _env: &DiscoveredEnv) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(self.target.join("bin")).await?;
        fs::write(self.target.join("bin/tool"), b"#!/bin/sh\necho tool 1.0\n").await?;
        fs::write(self.target.join("VERSION"), b"1.0\n").await?;
        Ok(())
    }
}

/// How a scripted cache answers `restore`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreBehavior {
    Succeed,
    Corrupt,
}

/// Cache double that records every call
pub struct ScriptedCache {
    available: bool,
    has_entry: bool,
    restore: RestoreBehavior,
    fail_store: bool,
    pub available_calls: AtomicUsize,
    pub has_calls: AtomicUsize,
    pub restore_calls: AtomicUsize,
    pub store_calls: AtomicUsize,
}

impl ScriptedCache {
    pub fn new(available: bool, has_entry: bool, restore: RestoreBehavior) -> Arc<Self> {
        Arc::new(Self {
            available,
            has_entry,
            restore,
            fail_store: false,
            available_calls: AtomicUsize::new(0),
            has_calls: AtomicUsize::new(0),
            restore_calls: AtomicUsize::new(0),
            store_calls: AtomicUsize::new(0),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Self::new(false, true, RestoreBehavior::Succeed)
    }

    pub fn failing_store() -> Arc<Self> {
        Arc::new(Self {
            available: true,
            has_entry: false,
            restore: RestoreBehavior::Succeed,
            fail_store: true,
            available_calls: AtomicUsize::new(0),
            has_calls: AtomicUsize::new(0),
            restore_calls: AtomicUsize::new(0),
            store_calls: AtomicUsize::new(0),
        })
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactCache for ScriptedCache {
    async fn available(&self) -> bool {
        self.available_calls.fetch_add(1, Ordering::SeqCst);
        self.available
    }

    async fn has(&self, _key: &CacheKey) -> bool {
        self.has_calls.fetch_add(1, Ordering::SeqCst);
        self.has_entry
    }

    async fn restore(&self, key: &CacheKey, _destination: &Path) -> Result<(), CacheError> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        match self.restore {
            RestoreBehavior::Succeed => Ok(()),
            RestoreBehavior::Corrupt => Err(CacheError::Corrupt {
                key: key.to_string(),
                reason: "digest mismatch".to_string(),
            }),
        }
    }

    async fn store(&self, key: &CacheKey, _source: &Path) -> Result<(), CacheError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_store {
            return Err(CacheError::StoreFailed {
                key: key.to_string(),
                reason: "disk full".to_string(),
            });
        }
        Ok(())
    }
}

/// Ledger whose writes fail; reads delegate to a real marker ledger
pub struct FailingLedger {
    inner: MarkerLedger,
}

impl FailingLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            inner: MarkerLedger::new(dir),
        })
    }
}

#[async_trait]
impl Ledger for FailingLedger {
    async fn is_complete(&self, name: &str) -> bool {
        self.inner.is_complete(name).await
    }

    async fn mark_complete(&self, _name: &str) -> Result<(), LedgerError> {
        Err(LedgerError::Io {
            path: self.inner.dir().to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only filesystem"),
        })
    }

    async fn reset(&self, name: &str) -> Result<(), LedgerError> {
        self.inner.reset(name).await
    }

    async fn reset_all(&self) -> Result<(), LedgerError> {
        self.inner.reset_all().await
    }

    async fn completed(&self) -> Result<Vec<String>, LedgerError> {
        self.inner.completed().await
    }
}
