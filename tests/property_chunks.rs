//! Property test: chunked reassembly is independent of arrival order and
//! chunk boundaries, as long as the metadata-bearing frame comes first.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use proptest::prelude::*;
use tokio::sync::mpsc;
use wirechat::backend::registry::{ConnectionId, ConnectionRegistry};
use wirechat::backend::upload::{ChunkAssembler, ChunkOutcome};
use wirechat::shared::event::FileChunkPayload;

fn test_conn() -> ConnectionId {
    let registry = ConnectionRegistry::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    registry.register(1, tx).0
}

fn frame(
    temp_id: &str,
    index: usize,
    total: usize,
    data: &str,
    carries_metadata: bool,
    size: u64,
) -> FileChunkPayload {
    FileChunkPayload {
        temp_id: temp_id.into(),
        chunk_data: data.into(),
        chunk_index: index,
        total_chunks: total,
        is_first_chunk: carries_metadata,
        is_last_chunk: index + 1 == total,
        chat_id: carries_metadata.then_some(1),
        file_name: carries_metadata.then(|| "blob.bin".into()),
        file_size: carries_metadata.then_some(size),
        file_type: carries_metadata.then(|| "application/octet-stream".into()),
        message_text: None,
    }
}

fn split_into(encoded: &str, total: usize) -> Vec<String> {
    let step = encoded.len().div_ceil(total);
    (0..total)
        .map(|i| {
            let start = (i * step).min(encoded.len());
            let end = ((i + 1) * step).min(encoded.len());
            encoded[start..end].to_string()
        })
        .collect()
}

fn upload_strategy() -> impl Strategy<Value = (Vec<u8>, Vec<usize>)> {
    (prop::collection::vec(any::<u8>(), 1..2048), 1usize..8).prop_flat_map(|(data, total)| {
        let order: Vec<usize> = (0..total).collect();
        (Just(data), Just(order).prop_shuffle())
    })
}

proptest! {
    #[test]
    fn reassembly_is_order_and_boundary_independent((data, order) in upload_strategy()) {
        let assembler = ChunkAssembler::new(64 * 1024 * 1024);
        let conn = test_conn();
        let total = order.len();
        let encoded = BASE64.encode(&data);
        let parts = split_into(&encoded, total);

        let mut completed = None;
        for (sent, &slot) in order.iter().enumerate() {
            let payload = frame("p1", slot, total, &parts[slot], sent == 0, data.len() as u64);
            match assembler.ingest(conn, payload).unwrap() {
                ChunkOutcome::Accepted { progress } => {
                    prop_assert!(sent + 1 < total, "must only accept before the last slot");
                    prop_assert!(progress <= 100);
                }
                ChunkOutcome::Complete(upload) => {
                    prop_assert_eq!(sent + 1, total, "must complete exactly on the last slot");
                    completed = Some(upload);
                }
            }
        }

        let upload = completed.expect("upload must complete");
        prop_assert_eq!(&upload.bytes, &data);
        prop_assert_eq!(upload.declared_size, data.len() as u64);
        prop_assert_eq!(assembler.inflight_count(), 0);
    }
}
