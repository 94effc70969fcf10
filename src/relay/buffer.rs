//! # Buffer/Flush Policy
//!
//! Accumulates relayed audio bytes per session direction and persists them
//! as segments on a time-windowed schedule. Batching into >= 10 second
//! segments keeps the filesystem write rate bounded under continuous
//! small-frame traffic while keeping memory growth bounded.
//!
//! ## Flush Rules:
//! - The timer is soft: it is evaluated when traffic arrives, never by a
//!   background task. A quiet lane is flushed only by the final flush on
//!   disconnect.
//! - An empty lane never produces a segment.
//! - A segment that does not start with the WebM magic gets a minimal EBML
//!   header prepended so every file is independently parseable — only the
//!   first chunk of a MediaRecorder stream naturally carries one.
//! - A failed write keeps the bytes buffered so the next flush retries them.

use crate::relay::session::{Role, Session};
use crate::relay::storage::SegmentStore;
use chrono::Utc;
use std::io;
use std::time::{Duration, Instant};
use tracing::debug;

/// First four bytes of any EBML/WebM document.
pub const WEBM_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Minimal EBML header prepended to segments cut mid-stream.
pub const WEBM_HEADER: [u8; 24] = [
    0x1A, 0x45, 0xDF, 0xA3, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F, 0x42, 0x86, 0x81,
    0x01, 0x42, 0x84, 0x81, 0x01, 0x42, 0x85, 0x81, 0x01,
];

/// Time-windowed flush policy shared by all sessions.
pub struct FlushPolicy {
    interval: Duration,
}

impl FlushPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Append `payload` to the lane carrying bytes toward `role`, then flush
    /// if the interval has elapsed since that lane's last flush.
    ///
    /// ## Returns:
    /// - `Ok(Some(filename))`: the append triggered a flush and a segment
    ///   was written
    /// - `Ok(None)`: bytes buffered, interval not yet elapsed
    /// - `Err(_)`: a flush was due but the write failed; bytes are retained
    pub fn accumulate(
        &self,
        session: &Session,
        role: Role,
        payload: &[u8],
        store: &SegmentStore,
    ) -> io::Result<Option<String>> {
        let due = {
            let mut lane = session.lane(role).lock().unwrap();
            lane.buffer.extend_from_slice(payload);
            lane.last_flush.elapsed() >= self.interval
        };

        if due {
            self.flush(session, role, store)
        } else {
            Ok(None)
        }
    }

    /// Persist a lane's accumulated bytes unconditionally (final-flush
    /// semantics). No-op on an empty lane.
    ///
    /// The bytes are moved out under the lane lock, but the durable write
    /// happens with no lock held. On failure the original bytes are spliced
    /// back to the front of the lane so arrival order survives a retry.
    pub fn flush(
        &self,
        session: &Session,
        role: Role,
        store: &SegmentStore,
    ) -> io::Result<Option<String>> {
        let raw = {
            let mut lane = session.lane(role).lock().unwrap();
            if lane.buffer.is_empty() {
                return Ok(None);
            }
            std::mem::take(&mut lane.buffer)
        };

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let filename = format!("{}_{}_{}.webm", session.id, role, timestamp);
        let data = patch_header(&raw);

        match store.write_segment(&filename, &data) {
            Ok(written) => {
                let mut lane = session.lane(role).lock().unwrap();
                lane.last_flush = Instant::now();
                debug!(
                    session_id = %session.id,
                    role = %role,
                    bytes = data.len(),
                    filename = %written,
                    "Flushed segment"
                );
                Ok(Some(written))
            }
            Err(e) => {
                // Retain for retry; newer bytes may have landed behind us.
                let mut lane = session.lane(role).lock().unwrap();
                let mut restored = raw;
                restored.extend_from_slice(&lane.buffer);
                lane.buffer = restored;
                Err(e)
            }
        }
    }
}

/// Prepend the minimal EBML header unless the data already starts with one.
fn patch_header(raw: &[u8]) -> Vec<u8> {
    if raw.starts_with(&WEBM_MAGIC) {
        raw.to_vec()
    } else {
        let mut out = Vec::with_capacity(WEBM_HEADER.len() + raw.len());
        out.extend_from_slice(&WEBM_HEADER);
        out.extend_from_slice(raw);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::message::{ControlMessage, PeerLink, SendError};
    use crate::relay::session::{ConnId, Peer};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct NullLink;

    impl PeerLink for NullLink {
        fn send_control(&self, _m: &ControlMessage) -> Result<(), SendError> {
            Ok(())
        }
        fn send_frame(&self, _f: Vec<u8>) -> Result<(), SendError> {
            Ok(())
        }
    }

    fn session() -> Session {
        let peer = || Peer {
            conn_id: ConnId::new(),
            link: Arc::new(NullLink),
        };
        Session::new("test-session".to_string(), peer(), peer())
    }

    #[test]
    fn header_prepended_when_magic_missing() {
        let patched = patch_header(b"raw opus bytes");
        assert!(patched.starts_with(&WEBM_HEADER));
        assert!(patched.ends_with(b"raw opus bytes"));
    }

    #[test]
    fn header_not_duplicated() {
        let mut data = WEBM_MAGIC.to_vec();
        data.extend_from_slice(b"rest of stream");
        let patched = patch_header(&data);
        assert_eq!(patched, data);
    }

    #[test]
    fn buffered_until_interval_elapses() {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        let policy = FlushPolicy::new(Duration::from_secs(3600));
        let session = session();

        for _ in 0..5 {
            let written = policy
                .accumulate(&session, Role::Operator, &[0u8; 1000], &store)
                .unwrap();
            assert!(written.is_none());
        }
        assert!(store.list_session("test-session").unwrap().is_empty());
        assert_eq!(
            session.lane(Role::Operator).lock().unwrap().buffer.len(),
            5000
        );
    }

    #[test]
    fn elapsed_interval_writes_one_patched_segment() {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        // Zero interval: every accumulate is past due.
        let policy = FlushPolicy::new(Duration::ZERO);
        let session = session();

        let written = policy
            .accumulate(&session, Role::Operator, b"frame-1", &store)
            .unwrap()
            .expect("flush due");
        assert!(written.starts_with("test-session_operator_"));
        assert!(written.ends_with(".webm"));

        let bytes = store.read_segment(&written).unwrap();
        assert!(bytes.starts_with(&WEBM_HEADER));
        assert!(bytes.ends_with(b"frame-1"));
        assert!(session.lane(Role::Operator).lock().unwrap().buffer.is_empty());
    }

    #[test]
    fn empty_lane_flush_is_a_no_op() {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        let policy = FlushPolicy::new(Duration::ZERO);
        let session = session();

        assert!(policy.flush(&session, Role::Client, &store).unwrap().is_none());
        assert!(store.list_session("test-session").unwrap().is_empty());
    }

    #[test]
    fn segments_concatenate_to_the_relayed_stream() {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        let policy = FlushPolicy::new(Duration::from_secs(3600));
        let session = session();

        policy.accumulate(&session, Role::Client, b"aaa", &store).unwrap();
        policy.accumulate(&session, Role::Client, b"bbb", &store).unwrap();
        let first = policy.flush(&session, Role::Client, &store).unwrap().unwrap();

        policy.accumulate(&session, Role::Client, b"ccc", &store).unwrap();
        let second = policy.flush(&session, Role::Client, &store).unwrap().unwrap();

        let mut combined = store.read_segment(&first).unwrap();
        combined.extend(store.read_segment(&second).unwrap());

        // Stream minus nothing, plus one header patch per segment.
        let mut expected = WEBM_HEADER.to_vec();
        expected.extend_from_slice(b"aaabbb");
        expected.extend_from_slice(&WEBM_HEADER);
        expected.extend_from_slice(b"ccc");
        assert_eq!(combined, expected);
    }

    #[test]
    fn failed_write_retains_bytes_for_retry() {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        // Point a second store handle at a path that cannot be written.
        let broken = SegmentStore::unchecked(dir.path().join("missing").join("deeper"));

        let policy = FlushPolicy::new(Duration::ZERO);
        let session = session();

        let err = policy.accumulate(&session, Role::Operator, b"keep-me", &broken);
        assert!(err.is_err());
        assert_eq!(
            session.lane(Role::Operator).lock().unwrap().buffer,
            b"keep-me"
        );

        // Retry against a writable store succeeds with all bytes intact.
        let written = policy.flush(&session, Role::Operator, &store).unwrap().unwrap();
        let bytes = store.read_segment(&written).unwrap();
        assert!(bytes.ends_with(b"keep-me"));
    }
}
