//! File sends over the wire: single-frame uploads and the chunked path
//! with acks, progress reporting and connection-scoped cleanup.

mod common;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use common::TestServer;
use pretty_assertions::assert_eq;
use wirechat::shared::event::{FileChunkPayload, SendFilePayload};
use wirechat::shared::{ChatType, ClientEvent, MessageType, ServerEvent};

fn chunk(temp_id: &str, chat_id: i64, index: usize, total: usize, data: &str) -> ClientEvent {
    let first = index == 0;
    ClientEvent::SendFileMessageChunk(FileChunkPayload {
        temp_id: temp_id.into(),
        chunk_data: data.into(),
        chunk_index: index,
        total_chunks: total,
        is_first_chunk: first,
        is_last_chunk: index + 1 == total,
        chat_id: first.then_some(chat_id),
        file_name: first.then(|| "notes.txt".into()),
        file_size: first.then_some(11),
        file_type: first.then(|| "text/plain".into()),
        message_text: None,
    })
}

#[tokio::test]
async fn test_single_frame_file_send() {
    let server = TestServer::new();
    let alice = server.store.add_user("alice", None);
    let bob = server.store.add_user("bob", None);
    let chat = server.store.add_chat(Some("pair"), ChatType::Private, &[alice, bob]);

    let mut a = server.connect(alice).await;
    let mut b = server.connect(bob).await;
    a.drain();
    b.drain();

    server
        .send(
            &a,
            ClientEvent::SendFileMessage(SendFilePayload {
                chat_id: chat,
                message_text: Some("look at this".into()),
                file_buffer: BASE64.encode(b"fake png bytes"),
                file_name: "pic.png".into(),
                file_type: "image/png".into(),
                file_size: 14,
                temp_id: "f1".into(),
            }),
        )
        .await;

    match a.next_event() {
        ServerEvent::NewMessage(payload) => {
            assert_eq!(payload.message.message_type, MessageType::Image);
            let attachment = payload.message.attachment.as_ref().unwrap();
            assert_eq!(attachment.original_filename, "pic.png");
            assert_eq!(attachment.file_size, 14);
            assert_eq!(server.blobs.get(&attachment.file_url).unwrap(), b"fake png bytes");
        }
        other => panic!("expected new_message, got {other:?}"),
    }
    match a.next_event() {
        ServerEvent::FileUploadSuccess(ack) => {
            assert_eq!(ack.temp_id, "f1");
            assert!(ack.file_url.is_some());
        }
        other => panic!("expected file_upload_success, got {other:?}"),
    }
    assert!(matches!(b.next_event(), ServerEvent::NewMessage(_)));
}

#[tokio::test]
async fn test_declared_size_over_limit_rejected() {
    let server = TestServer::new();
    let alice = server.store.add_user("alice", None);
    let chat = server.store.add_chat(None, ChatType::Private, &[alice]);

    let mut a = server.connect(alice).await;
    a.drain();

    server
        .send(
            &a,
            ClientEvent::SendFileMessage(SendFilePayload {
                chat_id: chat,
                message_text: None,
                file_buffer: "QUJD".into(),
                file_name: "huge.bin".into(),
                file_type: "application/octet-stream".into(),
                file_size: 51 * 1024 * 1024,
                temp_id: "f2".into(),
            }),
        )
        .await;

    match a.next_event() {
        ServerEvent::FileUploadError(payload) => {
            assert!(payload.error.contains("50MB"));
            assert_eq!(payload.temp_id.as_deref(), Some("f2"));
        }
        other => panic!("expected file_upload_error, got {other:?}"),
    }
    assert!(server.blobs.is_empty());
}

#[tokio::test]
async fn test_chunked_upload_out_of_order_completes_once() {
    let server = TestServer::new();
    let alice = server.store.add_user("alice", None);
    let bob = server.store.add_user("bob", None);
    let chat = server.store.add_chat(Some("pair"), ChatType::Private, &[alice, bob]);

    let mut a = server.connect(alice).await;
    let mut b = server.connect(bob).await;
    a.drain();
    b.drain();

    let encoded = BASE64.encode(b"hello world");
    let parts = [&encoded[..5], &encoded[5..10], &encoded[10..]];

    // First frame opens the upload; the remaining slots arrive out of order.
    server.send(&a, chunk("t1", chat, 0, 3, parts[0])).await;
    server.send(&a, chunk("t1", chat, 2, 3, parts[2])).await;
    server.send(&a, chunk("t1", chat, 1, 3, parts[1])).await;

    // Two accepted chunks, then completion: ack + progress each time.
    let events = a.drain();
    let acks: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::FileChunkAck(p) => Some(p.chunk_index),
            _ => None,
        })
        .collect();
    assert_eq!(acks, vec![0, 2, 1]);
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::FileUploadProgressUpdate(p) => Some(p.progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![33, 66, 100]);

    let new_messages: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::NewMessage(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(new_messages.len(), 1, "exactly one broadcast per completed upload");
    let attachment = new_messages[0].message.attachment.as_ref().unwrap();
    assert_eq!(server.blobs.get(&attachment.file_url).unwrap(), b"hello world");
    assert!(events.iter().any(|e| matches!(e, ServerEvent::FileUploadSuccess(p) if p.temp_id == "t1")));

    let bob_events = b.drain();
    assert_eq!(
        bob_events.iter().filter(|e| matches!(e, ServerEvent::NewMessage(_))).count(),
        1
    );
}

fn chunk_without_marker(temp_id: &str, chat_id: i64, index: usize, total: usize, data: &str) -> ClientEvent {
    let ClientEvent::SendFileMessageChunk(mut payload) = chunk(temp_id, chat_id, index, total, data)
    else {
        unreachable!()
    };
    payload.is_last_chunk = false;
    ClientEvent::SendFileMessageChunk(payload)
}

#[tokio::test]
async fn test_upload_waits_for_last_chunk_marker() {
    let server = TestServer::new();
    let alice = server.store.add_user("alice", None);
    let chat = server.store.add_chat(None, ChatType::Private, &[alice]);

    let mut a = server.connect(alice).await;
    a.drain();

    let encoded = BASE64.encode(b"hello world");
    let (head, tail) = encoded.split_at(7);
    server.send(&a, chunk_without_marker("t1", chat, 0, 2, head)).await;
    server.send(&a, chunk_without_marker("t1", chat, 1, 2, tail)).await;

    // Both slots acked, but without the closing marker nothing is persisted.
    let events = a.drain();
    assert_eq!(
        events.iter().filter(|e| matches!(e, ServerEvent::FileChunkAck(_))).count(),
        2
    );
    assert!(!events.iter().any(|e| matches!(e, ServerEvent::NewMessage(_))));
    assert!(!events.iter().any(|e| matches!(e, ServerEvent::FileUploadSuccess(_))));
    assert!(server.blobs.is_empty());

    // The closing retransmit finishes the upload.
    server.send(&a, chunk("t1", chat, 1, 2, tail)).await;
    let events = a.drain();
    assert!(events.iter().any(|e| matches!(e, ServerEvent::FileUploadSuccess(p) if p.temp_id == "t1")));
}

#[tokio::test]
async fn test_chunked_upload_rejects_oversized_declaration() {
    let server = TestServer::new();
    let alice = server.store.add_user("alice", None);
    let chat = server.store.add_chat(None, ChatType::Private, &[alice]);

    let mut a = server.connect(alice).await;
    a.drain();

    server
        .send(
            &a,
            ClientEvent::SendFileMessageChunk(FileChunkPayload {
                temp_id: "t9".into(),
                chunk_data: "QUJD".into(),
                chunk_index: 0,
                total_chunks: 8,
                is_first_chunk: true,
                is_last_chunk: false,
                chat_id: Some(chat),
                file_name: Some("huge.bin".into()),
                file_size: Some(51 * 1024 * 1024),
                file_type: Some("application/octet-stream".into()),
                message_text: None,
            }),
        )
        .await;

    match a.next_event() {
        ServerEvent::FileUploadError(payload) => {
            assert!(payload.error.contains("50MB"));
            assert_eq!(payload.temp_id.as_deref(), Some("t9"));
        }
        other => panic!("expected file_upload_error, got {other:?}"),
    }
    // The refusal left nothing behind: later chunks hit an unknown upload.
    server.send(&a, chunk("t9", chat, 1, 8, "QUJD")).await;
    assert!(matches!(a.next_event(), ServerEvent::FileUploadError(_)));
    assert!(server.blobs.is_empty());
}

#[tokio::test]
async fn test_chunk_for_unknown_upload_errors() {
    let server = TestServer::new();
    let alice = server.store.add_user("alice", None);
    let chat = server.store.add_chat(None, ChatType::Private, &[alice]);

    let mut a = server.connect(alice).await;
    a.drain();

    server.send(&a, chunk("ghost", chat, 1, 3, "QUJD")).await;
    match a.next_event() {
        ServerEvent::FileUploadError(payload) => {
            assert_eq!(payload.temp_id.as_deref(), Some("ghost"));
        }
        other => panic!("expected file_upload_error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_discards_partial_upload() {
    let server = TestServer::new();
    let alice = server.store.add_user("alice", None);
    let chat = server.store.add_chat(None, ChatType::Private, &[alice]);

    let mut a = server.connect(alice).await;
    a.drain();
    server.send(&a, chunk("t1", chat, 0, 3, "QUJD")).await;
    server.disconnect(&a).await;

    // Reconnect and resume: the partial upload is gone, so a non-first
    // chunk is an unknown upload.
    let mut a = server.connect(alice).await;
    a.drain();
    server.send(&a, chunk("t1", chat, 1, 3, "QUJD")).await;
    assert!(matches!(a.next_event(), ServerEvent::FileUploadError(_)));
    assert!(server.blobs.is_empty());
}
