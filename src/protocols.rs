//! Collaborator traits for everything the handler core does not own.
//!
//! | Concern | Trait | Provided implementations |
//! |---------|-------|--------------------------|
//! | Moving envelopes between nodes | [`Transport`] | `mesh::MeshTransport` |
//! | FTP persistence | [`FileStore`] | `storage::FsStore` |
//! | Console diagnostics | [`ConsoleSink`] | `console::StdConsole`, `console::RecordingConsole` |
//!
//! Handlers depend only on these traits, so tests can substitute failing
//! stores or recording sinks without touching handler code.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::outcome::Notification;

/// Delivery of forwarded envelopes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Enqueue `envelope`, which node `from` has just finished with, for
    /// delivery toward its destination. Ownership passes to the transport.
    async fn forward(&self, from: &str, envelope: Envelope) -> Result<()>;
}

/// Path-addressed byte storage used by the FTP handler.
pub trait FileStore: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// Create or truncate `path` and write `bytes`. Returns bytes written.
    fn write(&self, path: &Path, bytes: &[u8]) -> Result<u64>;

    /// Current size of the artifact at `path`.
    fn size(&self, path: &Path) -> Result<u64>;

    fn remove(&self, path: &Path) -> Result<()>;
}

/// Write-only operator console.
pub trait ConsoleSink: Send + Sync {
    fn emit(&self, notification: &Notification);
}
