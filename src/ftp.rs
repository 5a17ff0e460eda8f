//! # File Transfer
//!
//! A single-envelope file push. The outbound leg carries the whole body as
//! base64; the receiver writes it under `FPATH/file_name` and returns an
//! acknowledgement (without the body) to the sender, preserving `time_sent`
//! so the sender can compute throughput.
//!
//! ## Failure handling
//!
//! | Cause | Receiver does | Ack |
//! |-------|---------------|-----|
//! | Fragmentation signaled by transport | nothing written | FAILED, `bytes_written` = body length received |
//! | Unsafe `file_name` / undecodable body | nothing written | FAILED, `bytes_written` = 0 |
//! | Write error | partial file removed if it did not pre-exist | FAILED, `bytes_written` = 0 |
//! | Size on disk != declared size | same cleanup, protocol fault reported | FAILED, `bytes_written` = 0 |
//!
//! I/O errors are reported once and never retried.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::envelope::{Envelope, FtpPayload, Payload, Route, decode_blob, encode_blob};
use crate::identity::Contact;
use crate::outcome::{Fault, Notification, Outcome};
use crate::protocols::FileStore;
use crate::state::NodeState;

/// First leg of a transfer of `bytes` into `fpath/file_name` on `destination`.
pub fn request(
    state: &NodeState,
    destination: Contact,
    fpath: impl Into<String>,
    file_name: impl Into<String>,
    bytes: &[u8],
) -> Envelope {
    Envelope::new(
        Route::new(state.contact().clone(), destination, state.node_time()),
        Payload::Ftp(FtpPayload {
            fpath: fpath.into(),
            file_name: file_name.into(),
            size: bytes.len() as u64,
            data: Some(encode_blob(bytes)),
            ..Default::default()
        }),
    )
}

pub fn handle(
    state: &NodeState,
    store: &dyn FileStore,
    route: Route,
    payload: FtpPayload,
    fragmentation_failure: bool,
) -> Outcome {
    if !route.is_addressed_to(state.name()) {
        return Outcome::forward(Envelope::new(route, Payload::Ftp(payload)));
    }

    if fragmentation_failure {
        let received = payload
            .data
            .as_deref()
            .and_then(|d| decode_blob(d).ok())
            .map_or(0, |b| b.len() as u64);
        debug!(file = %payload.file_name, received, "fragmented transfer");
        let peer = route.source.name.clone();
        let path = shown_path(&payload.fpath, &payload.file_name);
        return failed_ack(state, route, payload, received)
            .with(Notification::FileStoreFailed { peer, path });
    }

    if payload.failure {
        return Outcome::terminal().with(Notification::FileTransferInterrupted {
            file_name: payload.file_name,
            peer: route.source.name,
            bytes_written: payload.bytes_written.unwrap_or(0),
        });
    }

    if payload.complete {
        let secs = state.elapsed_since(route.time_sent).max(0.0).ceil() as u64;
        let bytes_per_sec = if secs == 0 { 0 } else { payload.size / secs };
        return Outcome::terminal().with(Notification::FileTransferComplete {
            file_name: payload.file_name,
            peer: route.source.name,
            secs,
            bytes_per_sec,
        });
    }

    store_body(state, store, route, payload)
}

fn store_body(state: &NodeState, store: &dyn FileStore, route: Route, mut payload: FtpPayload) -> Outcome {
    let peer = route.source.name.clone();

    let Some(path) = target_path(&payload.fpath, &payload.file_name) else {
        warn!(file = %payload.file_name, from = %peer, "rejected unsafe file name");
        let path = shown_path(&payload.fpath, &payload.file_name);
        return failed_ack(state, route, payload, 0)
            .with(Notification::FileStoreFailed { peer, path });
    };
    let shown = path.display().to_string();

    let body = match payload.data.as_deref().map(decode_blob) {
        Some(Ok(body)) => body,
        Some(Err(e)) => {
            return failed_ack(state, route, payload, 0)
                .with(Notification::Fault(Fault::Protocol(format!("FTP: body is not base64: {}", e))))
                .with(Notification::FileStoreFailed { peer, path: shown });
        }
        None => {
            return failed_ack(state, route, payload, 0)
                .with(Notification::Fault(Fault::Protocol("FTP: transfer carries no body".into())))
                .with(Notification::FileStoreFailed { peer, path: shown });
        }
    };

    let existed = store.exists(&path);
    let written = store.write(&path, &body).and_then(|_| store.size(&path));

    match written {
        Ok(on_disk) if on_disk == payload.size => {
            debug!(path = %shown, bytes = on_disk, "file stored");
            payload.complete = true;
            payload.data = None;
            payload.bytes_written = Some(on_disk);
            let back = route.back_to_source(state.contact(), route.time_sent);
            Outcome::forward(Envelope::new(back, Payload::Ftp(payload)))
                .with(Notification::FileStored { peer, path: shown })
        }
        Ok(on_disk) => {
            warn!(path = %shown, on_disk, declared = payload.size, "size mismatch");
            discard_partial(store, &path, existed);
            let fault = Fault::Protocol(format!(
                "FTP: {} wrote {} bytes, expected {}",
                shown, on_disk, payload.size
            ));
            failed_ack(state, route, payload, 0)
                .with(Notification::Fault(fault))
                .with(Notification::FileStoreFailed { peer, path: shown })
        }
        Err(e) => {
            warn!(path = %shown, error = %e, "file store failed");
            discard_partial(store, &path, existed);
            failed_ack(state, route, payload, 0)
                .with(Notification::Fault(Fault::TransientIo(format!("{:#}", e))))
                .with(Notification::FileStoreFailed { peer, path: shown })
        }
    }
}

fn discard_partial(store: &dyn FileStore, path: &Path, existed: bool) {
    if existed || !store.exists(path) {
        return;
    }
    if let Err(e) = store.remove(path) {
        warn!(path = %path.display(), error = %e, "failed to remove partial file");
    }
}

/// `fpath/file_name`, or `None` when `file_name` is not a single plain component.
fn target_path(fpath: &str, file_name: &str) -> Option<PathBuf> {
    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !file_name.contains(['/', '\\']) => {
            Some(Path::new(fpath).join(file_name))
        }
        _ => None,
    }
}

/// How the target of a transfer appears in console lines.
fn shown_path(fpath: &str, file_name: &str) -> String {
    match target_path(fpath, file_name) {
        Some(path) => path.display().to_string(),
        None => format!("{}/{}", fpath, file_name),
    }
}

fn failed_ack(state: &NodeState, route: Route, mut payload: FtpPayload, bytes_written: u64) -> Outcome {
    payload.failure = true;
    payload.data = None;
    payload.bytes_written = Some(bytes_written);
    let back = route.back_to_source(state.contact(), route.time_sent);
    Outcome::forward(Envelope::new(back, Payload::Ftp(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeConfig;
    use crate::storage::FsStore;
    use anyhow::{Result, anyhow};

    fn node(name: &str, time: f64) -> NodeState {
        NodeState::new(Contact::named(name), &NodeConfig::default(), time)
    }

    fn split(outcome: &Outcome) -> (Route, FtpPayload) {
        match &outcome.forward {
            Some(Envelope { route, payload: Payload::Ftp(p) }) => (route.clone(), p.clone()),
            other => panic!("expected ftp forward, got {:?}", other),
        }
    }

    fn outbound(fpath: &str, name: &str, body: &[u8]) -> Envelope {
        request(&node("A", 2.0), Contact::named("B"), fpath, name, body)
    }

    fn parts(env: Envelope) -> (Route, FtpPayload) {
        match env.payload {
            Payload::Ftp(p) => (env.route, p),
            other => panic!("not ftp: {:?}", other),
        }
    }

    /// Writes fewer bytes than asked.
    struct ShortStore;

    impl FileStore for ShortStore {
        fn exists(&self, path: &Path) -> bool {
            FsStore.exists(path)
        }
        fn write(&self, path: &Path, bytes: &[u8]) -> Result<u64> {
            FsStore.write(path, &bytes[..bytes.len() / 2])
        }
        fn size(&self, path: &Path) -> Result<u64> {
            FsStore.size(path)
        }
        fn remove(&self, path: &Path) -> Result<()> {
            FsStore.remove(path)
        }
    }

    struct BrokenStore;

    impl FileStore for BrokenStore {
        fn exists(&self, _: &Path) -> bool {
            false
        }
        fn write(&self, _: &Path, _: &[u8]) -> Result<u64> {
            Err(anyhow!("disk full"))
        }
        fn size(&self, _: &Path) -> Result<u64> {
            Err(anyhow!("unreachable"))
        }
        fn remove(&self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stored_file_is_acknowledged_without_body() {
        let dir = tempfile::tempdir().unwrap();
        let fpath = dir.path().to_str().unwrap();
        let (route, payload) = parts(outbound(fpath, "notes.txt", b"hello world"));

        let outcome = handle(&node("B", 3.0), &FsStore, route, payload, false);
        let (back, ack) = split(&outcome);

        assert!(ack.complete);
        assert!(!ack.failure);
        assert_eq!(ack.data, None);
        assert_eq!(ack.bytes_written, Some(11));
        assert_eq!(back.destination.name, "A");
        assert_eq!(back.time_sent, 2.0);
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"hello world");
        assert!(matches!(outcome.notifications[0], Notification::FileStored { .. }));

        let wire = crate::envelope::encode_envelope(outcome.forward.as_ref().unwrap()).unwrap();
        assert!(!wire.contains("\"data\""));
    }

    #[test]
    fn sender_reports_throughput_on_ack() {
        let route = Route::new(Contact::named("B"), Contact::named("A"), 2.0);
        let ack = FtpPayload {
            fpath: "/tmp".into(),
            file_name: "f".into(),
            size: 1000,
            complete: true,
            bytes_written: Some(1000),
            ..Default::default()
        };

        let outcome = handle(&node("A", 3.5), &FsStore, route.clone(), ack.clone(), false);
        assert_eq!(outcome.notifications[0].to_string(), "FTP: f --> B in 2 at 500");

        let instant = handle(&node("A", 2.0), &FsStore, route, ack, false);
        assert_eq!(instant.notifications[0].to_string(), "FTP: f --> B in 0 at 0");
    }

    #[test]
    fn size_mismatch_fails_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let fpath = dir.path().to_str().unwrap();
        let (route, payload) = parts(outbound(fpath, "half.bin", b"0123456789"));

        let outcome = handle(&node("B", 3.0), &ShortStore, route, payload, false);
        let (_, ack) = split(&outcome);

        assert!(ack.failure);
        assert_eq!(ack.bytes_written, Some(0));
        assert_eq!(ack.data, None);
        assert!(!dir.path().join("half.bin").exists());
        assert!(outcome.faults().any(|f| matches!(f, Fault::Protocol(_))));
    }

    #[test]
    fn mismatch_keeps_preexisting_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("keep.bin");
        std::fs::write(&target, b"old").unwrap();
        let (route, payload) = parts(outbound(dir.path().to_str().unwrap(), "keep.bin", b"0123456789"));

        let outcome = handle(&node("B", 3.0), &ShortStore, route, payload, false);
        assert!(split(&outcome).1.failure);
        assert!(target.exists());
    }

    #[test]
    fn write_error_becomes_failed_ack() {
        let (route, payload) = parts(outbound("/nowhere", "x.bin", b"abc"));
        let outcome = handle(&node("B", 3.0), &BrokenStore, route, payload, false);
        let (back, ack) = split(&outcome);

        assert!(ack.failure);
        assert_eq!(ack.bytes_written, Some(0));
        assert_eq!(back.destination.name, "A");
        assert!(outcome.faults().any(|f| matches!(f, Fault::TransientIo(m) if m.contains("disk full"))));
    }

    #[test]
    fn fragmentation_reports_bytes_received() {
        let (route, payload) = parts(outbound("/nowhere", "x.bin", b"abcdef"));
        let outcome = handle(&node("B", 3.0), &BrokenStore, route, payload, true);
        let (_, ack) = split(&outcome);
        assert!(ack.failure);
        assert_eq!(ack.bytes_written, Some(6));
        assert_eq!(ack.data, None);
        assert_eq!(outcome.notifications.len(), 1);
        assert_eq!(outcome.notifications[0].to_string(), "FTP: ERROR: A --> /nowhere/x.bin");
    }

    #[test]
    fn interrupted_transfer_is_reported_at_sender() {
        let route = Route::new(Contact::named("B"), Contact::named("A"), 2.0);
        let ack = FtpPayload {
            file_name: "x.bin".into(),
            failure: true,
            bytes_written: Some(6),
            ..Default::default()
        };
        let outcome = handle(&node("A", 3.0), &FsStore, route, ack, false);
        assert!(outcome.is_terminal());
        assert_eq!(
            outcome.notifications[0].to_string(),
            "FTP: ERROR: x.bin --> B INTERRUPTED AFTER 6"
        );
    }

    #[test]
    fn traversal_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["../escape", "a/b", "..", ""] {
            let (route, payload) = parts(outbound(dir.path().to_str().unwrap(), name, b"x"));
            let outcome = handle(&node("B", 3.0), &FsStore, route, payload, false);
            assert!(split(&outcome).1.failure, "{} accepted", name);
        }
    }

    #[test]
    fn transit_passes_through() {
        let (route, payload) = parts(outbound("/tmp", "x", b"x"));
        let outcome = handle(&node("Z", 3.0), &BrokenStore, route.clone(), payload.clone(), true);
        assert_eq!(split(&outcome), (route, payload));
    }
}
