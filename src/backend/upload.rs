//! Chunked Upload Assembly
//!
//! Large files arrive as ordered base64 fragments over several frames. The
//! assembler accumulates fragments per (connection, tempId) key, reports
//! progress, and hands the decoded bytes to the message pipeline once every
//! declared slot is filled and a frame has carried the last-chunk marker.
//! Fragments are joined as base64 text first and
//! decoded once, so chunk boundaries never have to fall on 4-character
//! base64 group boundaries.
//!
//! Accumulators are bound to the connection: a disconnect purges them, and
//! a periodic sweep drops any that stopped receiving chunks.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info, warn};

use crate::backend::error::EngineError;
use crate::backend::registry::ConnectionId;
use crate::shared::event::FileChunkPayload;

/// Fully reassembled upload, ready for the message pipeline.
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub chat_id: i64,
    pub message_text: Option<String>,
    pub file_name: String,
    pub file_type: String,
    /// Size the client declared up front, in bytes.
    pub declared_size: u64,
    pub bytes: Vec<u8>,
}

/// What one accepted chunk produced.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Chunk stored; upload still in flight.
    Accepted { progress: u8 },
    /// Final slot filled; the upload is decoded and removed.
    Complete(Box<CompletedUpload>),
}

struct Accumulator {
    chat_id: i64,
    message_text: Option<String>,
    file_name: String,
    file_type: String,
    declared_size: u64,
    slots: Vec<Option<String>>,
    filled: usize,
    /// Latched once any frame carries the last-chunk marker.
    last_seen: bool,
    last_chunk_at: Instant,
}

impl Accumulator {
    fn progress(&self) -> u8 {
        ((self.filled * 100) / self.slots.len().max(1)) as u8
    }
}

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Per-connection accumulator table for in-flight chunked uploads.
pub struct ChunkAssembler {
    inflight: Mutex<HashMap<(ConnectionId, String), Accumulator>>,
    max_bytes: u64,
}

impl ChunkAssembler {
    pub fn new(max_bytes: u64) -> Self {
        Self { inflight: Mutex::new(HashMap::new()), max_bytes }
    }

    /// Accept one chunk frame. The first chunk must carry the upload
    /// metadata; later chunks only need the tempId, index and data.
    pub fn ingest(
        &self,
        conn: ConnectionId,
        payload: FileChunkPayload,
    ) -> Result<ChunkOutcome, EngineError> {
        if payload.total_chunks == 0 {
            return Err(EngineError::validation("totalChunks", "totalChunks must be at least 1"));
        }
        if payload.chunk_index >= payload.total_chunks {
            return Err(EngineError::validation(
                "chunkIndex",
                format!(
                    "chunkIndex {} out of range for {} chunks",
                    payload.chunk_index, payload.total_chunks
                ),
            ));
        }

        let key = (conn, payload.temp_id.clone());
        let mut inflight = self.lock();

        if !inflight.contains_key(&key) {
            if !payload.is_first_chunk {
                return Err(EngineError::not_found("upload", &payload.temp_id));
            }
            let chat_id = payload
                .chat_id
                .ok_or_else(|| EngineError::validation("chat_id", "chat_id is required"))?;
            let file_name = payload
                .file_name
                .clone()
                .ok_or_else(|| EngineError::validation("fileName", "fileName is required"))?;
            let file_type = payload
                .file_type
                .clone()
                .ok_or_else(|| EngineError::validation("fileType", "fileType is required"))?;
            let declared_size = payload
                .file_size
                .ok_or_else(|| EngineError::validation("fileSize", "fileSize is required"))?;
            // Oversized uploads are refused before any data accumulates.
            if declared_size > self.max_bytes {
                return Err(EngineError::FileTooLarge {
                    size_mib: declared_size as f64 / BYTES_PER_MIB as f64,
                    limit_mib: self.max_bytes / BYTES_PER_MIB,
                });
            }

            info!(
                "[Upload] Starting chunked upload {} ({} chunks, {} bytes declared)",
                payload.temp_id, payload.total_chunks, declared_size
            );
            inflight.insert(
                key.clone(),
                Accumulator {
                    chat_id,
                    message_text: payload.message_text.clone(),
                    file_name,
                    file_type,
                    declared_size,
                    slots: vec![None; payload.total_chunks],
                    filled: 0,
                    last_seen: false,
                    last_chunk_at: Instant::now(),
                },
            );
        }

        let acc = match inflight.get_mut(&key) {
            Some(acc) => acc,
            None => return Err(EngineError::not_found("upload", &payload.temp_id)),
        };

        if acc.slots.len() != payload.total_chunks {
            return Err(EngineError::validation(
                "totalChunks",
                "totalChunks changed mid-upload",
            ));
        }

        // A retransmitted slot overwrites without recounting.
        if acc.slots[payload.chunk_index].replace(payload.chunk_data).is_none() {
            acc.filled += 1;
        }
        if payload.is_last_chunk {
            acc.last_seen = true;
        }
        acc.last_chunk_at = Instant::now();

        // Completion needs both a full slot table and an explicit last-chunk
        // marker from the client, so a retransmit storm cannot finish an
        // upload the client has not finished sending.
        if acc.filled < acc.slots.len() || !acc.last_seen {
            let progress = acc.progress();
            debug!(
                "[Upload] {} chunk {}/{} ({}%)",
                payload.temp_id,
                payload.chunk_index + 1,
                payload.total_chunks,
                progress
            );
            return Ok(ChunkOutcome::Accepted { progress });
        }

        let acc = match inflight.remove(&key) {
            Some(acc) => acc,
            None => return Err(EngineError::not_found("upload", &payload.temp_id)),
        };
        drop(inflight);

        let joined: String = acc.slots.into_iter().flatten().collect();
        let bytes = BASE64
            .decode(joined.as_bytes())
            .map_err(|e| EngineError::validation("chunkData", format!("Invalid base64 data: {}", e)))?;

        info!(
            "[Upload] Completed chunked upload {} ({} bytes decoded)",
            payload.temp_id,
            bytes.len()
        );
        Ok(ChunkOutcome::Complete(Box::new(CompletedUpload {
            chat_id: acc.chat_id,
            message_text: acc.message_text,
            file_name: acc.file_name,
            file_type: acc.file_type,
            declared_size: acc.declared_size,
            bytes,
        })))
    }

    /// Drop every in-flight upload owned by a connection.
    pub fn purge_connection(&self, conn: ConnectionId) {
        let mut inflight = self.lock();
        let before = inflight.len();
        inflight.retain(|(owner, _), _| *owner != conn);
        let dropped = before - inflight.len();
        if dropped > 0 {
            info!("[Upload] Purged {} in-flight upload(s) for {:?}", dropped, conn);
        }
    }

    /// Drop uploads that have not received a chunk within `max_idle`.
    /// Returns how many were dropped.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let mut inflight = self.lock();
        let before = inflight.len();
        inflight.retain(|(_, temp_id), acc| {
            let stale = acc.last_chunk_at.elapsed() > max_idle;
            if stale {
                warn!("[Upload] Dropping stalled upload {}", temp_id);
            }
            !stale
        });
        before - inflight.len()
    }

    /// Number of uploads currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(ConnectionId, String), Accumulator>> {
        match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::registry::ConnectionRegistry;
    use assert_matches::assert_matches;

    fn conn() -> ConnectionId {
        let reg = ConnectionRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        reg.register(1, tx).0
    }

    fn assembler() -> ChunkAssembler {
        ChunkAssembler::new(BYTES_PER_MIB)
    }

    fn chunk(temp_id: &str, index: usize, total: usize, data: &str, first: bool) -> FileChunkPayload {
        FileChunkPayload {
            temp_id: temp_id.into(),
            chunk_data: data.into(),
            chunk_index: index,
            total_chunks: total,
            is_first_chunk: first,
            is_last_chunk: index + 1 == total,
            chat_id: first.then_some(7),
            file_name: first.then(|| "notes.txt".into()),
            file_size: first.then_some(11),
            file_type: first.then(|| "text/plain".into()),
            message_text: None,
        }
    }

    // "hello world" split into three base64 fragments on non-group boundaries.
    fn fragments() -> [&'static str; 3] {
        let encoded = "aGVsbG8gd29ybGQ=";
        [&encoded[..5], &encoded[5..10], &encoded[10..]]
    }

    #[test]
    fn test_out_of_order_chunks_reassemble() {
        let assembler = assembler();
        let c = conn();
        let parts = fragments();

        // First frame must open the accumulator even when a later slot
        // would otherwise arrive first.
        assert_matches!(
            assembler.ingest(c, chunk("t1", 0, 3, parts[0], true)).unwrap(),
            ChunkOutcome::Accepted { progress: 33 }
        );
        assert_matches!(
            assembler.ingest(c, chunk("t1", 2, 3, parts[2], false)).unwrap(),
            ChunkOutcome::Accepted { progress: 66 }
        );
        let done = assembler.ingest(c, chunk("t1", 1, 3, parts[1], false)).unwrap();
        let upload = match done {
            ChunkOutcome::Complete(u) => u,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(upload.bytes, b"hello world");
        assert_eq!(upload.chat_id, 7);
        assert_eq!(upload.file_name, "notes.txt");
        assert_eq!(assembler.inflight_count(), 0);
    }

    #[test]
    fn test_duplicate_slot_does_not_complete_early() {
        let assembler = assembler();
        let c = conn();
        let parts = fragments();

        assembler.ingest(c, chunk("t1", 0, 3, parts[0], true)).unwrap();
        assembler.ingest(c, chunk("t1", 0, 3, parts[0], false)).unwrap();
        let outcome = assembler.ingest(c, chunk("t1", 1, 3, parts[1], false)).unwrap();
        assert_matches!(outcome, ChunkOutcome::Accepted { .. });
        assert_eq!(assembler.inflight_count(), 1);
    }

    #[test]
    fn test_full_slots_without_last_marker_stay_in_flight() {
        let assembler = assembler();
        let c = conn();
        let encoded = "aGVsbG8gd29ybGQ=";
        let (head, tail) = encoded.split_at(7);

        assembler.ingest(c, chunk("t1", 0, 2, head, true)).unwrap();
        // Every slot filled, but the client never said this was the end.
        let mut second = chunk("t1", 1, 2, tail, false);
        second.is_last_chunk = false;
        let outcome = assembler.ingest(c, second).unwrap();
        assert_matches!(outcome, ChunkOutcome::Accepted { progress: 100 });
        assert_eq!(assembler.inflight_count(), 1);

        // A retransmit of the final slot carrying the marker finishes it.
        let done = assembler.ingest(c, chunk("t1", 1, 2, tail, false)).unwrap();
        let upload = match done {
            ChunkOutcome::Complete(u) => u,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(upload.bytes, b"hello world");
    }

    #[test]
    fn test_declared_size_over_cap_rejected_up_front() {
        let assembler = assembler();
        let c = conn();
        let mut payload = chunk("big", 0, 4, "QUJD", true);
        payload.file_size = Some(2 * BYTES_PER_MIB);
        let err = assembler.ingest(c, payload).unwrap_err();
        assert_matches!(err, EngineError::FileTooLarge { limit_mib: 1, .. });
        // Nothing accumulates, so later chunks hit an unknown tempId.
        assert_eq!(assembler.inflight_count(), 0);
        let err = assembler.ingest(c, chunk("big", 1, 4, "QUJD", false)).unwrap_err();
        assert_matches!(err, EngineError::NotFound { what: "upload", .. });
    }

    #[test]
    fn test_unknown_temp_id_rejected() {
        let assembler = assembler();
        let err = assembler.ingest(conn(), chunk("ghost", 1, 3, "QUJD", false)).unwrap_err();
        assert_matches!(err, EngineError::NotFound { what: "upload", .. });
    }

    #[test]
    fn test_first_chunk_requires_metadata() {
        let assembler = assembler();
        let mut payload = chunk("t1", 0, 2, "QUJD", true);
        payload.file_name = None;
        let err = assembler.ingest(conn(), payload).unwrap_err();
        assert_matches!(err, EngineError::Validation { field: "fileName", .. });
    }

    #[test]
    fn test_chunk_index_out_of_range() {
        let assembler = assembler();
        let err = assembler.ingest(conn(), chunk("t1", 3, 3, "QUJD", true)).unwrap_err();
        assert_matches!(err, EngineError::Validation { field: "chunkIndex", .. });
    }

    #[test]
    fn test_purge_connection_drops_uploads() {
        let assembler = assembler();
        let c = conn();
        assembler.ingest(c, chunk("t1", 0, 3, "QUJD", true)).unwrap();
        assembler.purge_connection(c);
        assert_eq!(assembler.inflight_count(), 0);
        // A later chunk for the purged upload is an unknown tempId.
        let err = assembler.ingest(c, chunk("t1", 1, 3, "QUJD", false)).unwrap_err();
        assert_matches!(err, EngineError::NotFound { .. });
    }

    #[test]
    fn test_sweep_drops_only_idle() {
        let assembler = assembler();
        let c = conn();
        assembler.ingest(c, chunk("t1", 0, 3, "QUJD", true)).unwrap();
        assert_eq!(assembler.sweep_idle(Duration::from_secs(60)), 0);
        assert_eq!(assembler.sweep_idle(Duration::ZERO), 1);
        assert_eq!(assembler.inflight_count(), 0);
    }

    #[test]
    fn test_invalid_base64_fails_on_completion() {
        let assembler = assembler();
        let c = conn();
        assembler.ingest(c, chunk("t1", 0, 2, "!!!", true)).unwrap();
        let err = assembler.ingest(c, chunk("t1", 1, 2, "???", false)).unwrap_err();
        assert_matches!(err, EngineError::Validation { field: "chunkData", .. });
    }
}
