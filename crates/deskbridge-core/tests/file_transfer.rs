//! Tests for chunked file transfer over the data conduit.

mod common;

use std::time::Duration;

use common::{random_bytes, test_config, Harness};
use deskbridge_core::protocol::Message;
use deskbridge_core::transfer::{FileTransferRecord, TransferStatus};
use deskbridge_core::{ConnectOptions, Error, SessionNotice};

fn finished(notice: &SessionNotice, id: &str) -> bool {
    matches!(notice, SessionNotice::Transfer(r) if r.id == id && !r.is_active())
}

fn record(notice: SessionNotice) -> FileTransferRecord {
    match notice {
        SessionNotice::Transfer(record) => record,
        other => panic!("not a transfer notice: {other:?}"),
    }
}

fn start(id: &str, name: &str, size: u64) -> Message {
    Message::FileStart {
        transfer_id: id.to_string(),
        name: name.to_string(),
        size,
        drop_x: None,
        drop_y: None,
    }
}

fn chunk(id: &str, seq: Option<u64>, bytes: &[u8]) -> Message {
    Message::FileChunk {
        transfer_id: id.to_string(),
        chunk: bytes.to_vec(),
        seq,
    }
}

fn end(id: &str) -> Message {
    Message::FileEnd {
        transfer_id: id.to_string(),
    }
}

/// A file goes out as FILE_START, sequenced chunks and FILE_END.
#[tokio::test]
async fn test_send_file() {
    let mut h = Harness::start(test_config(), None);
    let (id, conduit) = h.authenticated_client("200000002").await;
    let content = random_bytes(10);
    let path = h.source_file("notes.txt", &content);

    let transfer = h.handle.send_file(id, &path, None).await.unwrap();
    let done = record(h.wait_for(|n| finished(n, &transfer)).await);
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(done.bytes_transferred, 10);
    assert_eq!(done.percent, 100);

    let sent: Vec<Message> = conduit
        .sent()
        .into_iter()
        .filter(|m| m.kind().starts_with("FILE_"))
        .collect();
    assert_eq!(sent.len(), 5);
    assert!(matches!(&sent[0], Message::FileStart { name, size: 10, .. } if name == "notes.txt"));

    let mut received = Vec::new();
    for (expected_seq, message) in sent[1..4].iter().enumerate() {
        match message {
            Message::FileChunk {
                transfer_id,
                chunk,
                seq,
            } => {
                assert_eq!(transfer_id, &transfer);
                assert_eq!(*seq, Some(expected_seq as u64));
                assert!(chunk.len() <= 4);
                received.extend_from_slice(chunk);
            }
            other => panic!("expected a chunk, got {other:?}"),
        }
    }
    assert_eq!(received, content);
    assert_eq!(sent[4], end(&transfer));
}

/// Zero-length files complete without chunks.
#[tokio::test]
async fn test_send_empty_file() {
    let mut h = Harness::start(test_config(), None);
    let (id, conduit) = h.authenticated_client("200000002").await;
    let path = h.source_file("empty.txt", b"");

    let transfer = h.handle.send_file(id, &path, None).await.unwrap();
    let done = record(h.wait_for(|n| finished(n, &transfer)).await);
    assert_eq!(done.status, TransferStatus::Completed);
    assert!(conduit.sent().contains(&end(&transfer)));
}

/// Sending needs an authenticated session and an existing file.
#[tokio::test]
async fn test_send_file_preconditions() {
    let h = Harness::start(test_config(), None);
    let (pending, endpoint) = h.dial("200000002", ConnectOptions::default()).await;
    endpoint.conduit().open();
    let path = h.source_file("notes.txt", b"hello");

    assert!(matches!(
        h.handle.send_file(pending, &path, None).await,
        Err(Error::SessionNotReady { .. })
    ));

    let (id, _) = h.authenticated_client("300000003").await;
    assert!(matches!(
        h.handle.send_file(id, path.with_file_name("missing.txt"), None).await,
        Err(Error::FileNotFound(_))
    ));
    assert!(h.handle.transfers().await.unwrap().is_empty());
}

/// Received chunks are staged and finalized into the download directory.
#[tokio::test]
async fn test_receive_file() {
    let mut h = Harness::start(test_config(), None);
    let host = h.host().await;
    let (_, conduit) = h.accepted_guest(&host, "200000002").await;

    conduit.deliver(&start("tf-1", "report.txt", 6));
    conduit.deliver(&chunk("tf-1", Some(0), b"abc"));
    conduit.deliver(&chunk("tf-1", Some(1), b"def"));
    conduit.deliver(&end("tf-1"));

    let done = record(h.wait_for(|n| finished(n, "tf-1")).await);
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(done.bytes_transferred, 6);
    let path = done.path.unwrap();
    assert!(path.starts_with(&h.downloads));
    assert_eq!(std::fs::read(path).unwrap(), b"abcdef");
}

/// Chunks without sequence numbers are accepted in arrival order.
#[tokio::test]
async fn test_receive_unsequenced_chunks() {
    let mut h = Harness::start(test_config(), None);
    let host = h.host().await;
    let (_, conduit) = h.accepted_guest(&host, "200000002").await;

    conduit.deliver(&start("tf-2", "a.bin", 4));
    conduit.deliver(&chunk("tf-2", None, b"ab"));
    conduit.deliver(&chunk("tf-2", None, b"cd"));
    conduit.deliver(&end("tf-2"));

    let done = record(h.wait_for(|n| finished(n, "tf-2")).await);
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(std::fs::read(done.path.unwrap()).unwrap(), b"abcd");
}

/// A sender's file name cannot escape the download directory.
#[tokio::test]
async fn test_receive_file_name_is_sanitized() {
    let mut h = Harness::start(test_config(), None);
    let host = h.host().await;
    let (_, conduit) = h.accepted_guest(&host, "200000002").await;

    conduit.deliver(&start("tf-3", "../../evil.txt", 1));
    conduit.deliver(&chunk("tf-3", Some(0), b"x"));
    conduit.deliver(&end("tf-3"));

    let done = record(h.wait_for(|n| finished(n, "tf-3")).await);
    let path = done.path.unwrap();
    assert_eq!(path.parent().unwrap(), h.downloads);
    assert_eq!(path.file_name().unwrap(), "evil.txt");
}

/// More bytes than declared fail the transfer and nothing is kept.
#[tokio::test]
async fn test_receive_overflow_fails() {
    let mut h = Harness::start(test_config(), None);
    let host = h.host().await;
    let (_, conduit) = h.accepted_guest(&host, "200000002").await;

    conduit.deliver(&start("tf-4", "small.txt", 2));
    conduit.deliver(&chunk("tf-4", Some(0), b"abc"));
    conduit.deliver(&end("tf-4"));

    let failed = record(h.wait_for(|n| finished(n, "tf-4")).await);
    assert_eq!(failed.status, TransferStatus::Error);
    assert!(failed.error.is_some());
    h.settle().await;
    assert!(!h.downloads.join("small.txt").exists());
}

/// A gap in the sequence fails the transfer.
#[tokio::test]
async fn test_receive_out_of_order_fails() {
    let mut h = Harness::start(test_config(), None);
    let host = h.host().await;
    let (_, conduit) = h.accepted_guest(&host, "200000002").await;

    conduit.deliver(&start("tf-5", "gap.txt", 4));
    conduit.deliver(&chunk("tf-5", Some(1), b"cd"));

    let failed = record(h.wait_for(|n| finished(n, "tf-5")).await);
    assert_eq!(failed.status, TransferStatus::Error);
}

/// Ending early is a failure, not a short file.
#[tokio::test]
async fn test_receive_truncated_fails() {
    let mut h = Harness::start(test_config(), None);
    let host = h.host().await;
    let (_, conduit) = h.accepted_guest(&host, "200000002").await;

    conduit.deliver(&start("tf-6", "short.txt", 8));
    conduit.deliver(&chunk("tf-6", Some(0), b"abcd"));
    conduit.deliver(&end("tf-6"));

    let failed = record(h.wait_for(|n| finished(n, "tf-6")).await);
    assert_eq!(failed.status, TransferStatus::Error);
    assert_eq!(failed.bytes_transferred, 4);
}

/// File messages on an unauthenticated session are ignored.
#[tokio::test]
async fn test_receive_requires_authentication() {
    let h = Harness::start(test_config(), Some("654321"));
    let host = h.host().await;
    let conduit = host.incoming_conduit("200000002", None);
    conduit.open();

    conduit.deliver(&start("tf-7", "sneaky.txt", 1));
    conduit.deliver(&chunk("tf-7", Some(0), b"x"));
    conduit.deliver(&end("tf-7"));
    h.settle().await;

    assert!(h.handle.transfers().await.unwrap().is_empty());
    assert!(!h.downloads.join("sneaky.txt").exists());
}

/// Closing a session fails its in-flight transfers.
#[tokio::test]
async fn test_session_close_aborts_transfer() {
    let mut h = Harness::start(test_config(), None);
    let host = h.host().await;
    let (_, conduit) = h.accepted_guest(&host, "200000002").await;

    conduit.deliver(&start("tf-8", "big.bin", 100));
    conduit.deliver(&chunk("tf-8", Some(0), b"abcd"));
    h.settle().await;
    conduit.hang_up();

    let failed = record(h.wait_for(|n| finished(n, "tf-8")).await);
    assert_eq!(failed.status, TransferStatus::Error);
    assert_eq!(failed.bytes_transferred, 4);
}

/// Two transfers on one session progress independently.
#[tokio::test]
async fn test_interleaved_transfers() {
    let mut h = Harness::start(test_config(), None);
    let host = h.host().await;
    let (_, conduit) = h.accepted_guest(&host, "200000002").await;

    conduit.deliver(&start("tf-a", "a.txt", 2));
    conduit.deliver(&start("tf-b", "b.txt", 2));
    conduit.deliver(&chunk("tf-b", Some(0), b"bb"));
    conduit.deliver(&chunk("tf-a", Some(0), b"aa"));
    conduit.deliver(&end("tf-a"));
    conduit.deliver(&end("tf-b"));

    let a = record(h.wait_for(|n| finished(n, "tf-a")).await);
    let b = record(h.wait_for(|n| finished(n, "tf-b")).await);
    assert_eq!(std::fs::read(a.path.unwrap()).unwrap(), b"aa");
    assert_eq!(std::fs::read(b.path.unwrap()).unwrap(), b"bb");
}

/// Clipboard text flows both ways once authenticated.
#[tokio::test]
async fn test_clipboard_sync() {
    let h = Harness::start(test_config(), None);
    let (id, conduit) = h.authenticated_client("200000002").await;

    h.handle
        .send_clipboard(id, Some("from client".to_string()))
        .await
        .unwrap();
    assert!(conduit.sent().contains(&Message::Clipboard {
        text: "from client".to_string()
    }));

    conduit.deliver(&Message::Clipboard {
        text: "from host".to_string(),
    });
    h.settle().await;
    assert_eq!(h.clipboard.text().as_deref(), Some("from host"));

    // With no text given the local clipboard is read.
    h.handle.send_clipboard(id, None).await.unwrap();
    assert_eq!(
        conduit.sent().last(),
        Some(&Message::Clipboard {
            text: "from host".to_string()
        })
    );
}

fn sync_config() -> deskbridge_core::config::Config {
    let mut config = test_config();
    config.session.clipboard_sync = true;
    config.session.clipboard_poll_interval = Duration::from_secs(1);
    config
}

fn clipboard_messages(sent: &[Message], text: &str) -> usize {
    sent.iter()
        .filter(|m| matches!(m, Message::Clipboard { text: t } if t == text))
        .count()
}

/// A local clipboard change is pushed once, and text from the peer is not
/// echoed back.
#[tokio::test(start_paused = true)]
async fn test_clipboard_change_pushed_once() {
    let h = Harness::start(sync_config(), None);
    let (_, conduit) = h.authenticated_client("200000002").await;

    h.clipboard.copy("copied locally");
    tokio::time::sleep(Duration::from_secs(4)).await;
    h.settle().await;
    assert_eq!(clipboard_messages(&conduit.sent(), "copied locally"), 1);

    conduit.deliver(&Message::Clipboard {
        text: "from peer".to_string(),
    });
    h.settle().await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    h.settle().await;
    assert_eq!(h.clipboard.text().as_deref(), Some("from peer"));
    assert_eq!(clipboard_messages(&conduit.sent(), "from peer"), 0);
}

/// Copying the path of a local file sends the file instead of the text.
#[tokio::test(start_paused = true)]
async fn test_copied_file_path_is_sent_as_file() {
    let mut h = Harness::start(sync_config(), None);
    let (_, conduit) = h.authenticated_client("200000002").await;
    let path = h.source_file("copied.txt", b"abc");
    let text = path.to_string_lossy().to_string();

    h.clipboard.copy(&text);
    let done = record(
        h.wait_for(|n| matches!(n, SessionNotice::Transfer(r) if !r.is_active()))
            .await,
    );
    assert_eq!(done.name, "copied.txt");
    assert_eq!(done.status, TransferStatus::Completed);

    let sent = conduit.sent();
    assert!(sent
        .iter()
        .any(|m| matches!(m, Message::FileStart { name, size: 3, .. } if name == "copied.txt")));
    assert_eq!(clipboard_messages(&sent, &text), 0);
}

/// Nothing is read or sent without an authenticated session.
#[tokio::test(start_paused = true)]
async fn test_clipboard_sync_waits_for_authentication() {
    let h = Harness::start(sync_config(), None);
    let (_, endpoint) = h.dial("200000002", ConnectOptions::default()).await;
    let conduit = endpoint.conduit();
    conduit.open();
    h.settle().await;

    h.clipboard.copy("secret notes");
    tokio::time::sleep(Duration::from_secs(3)).await;
    h.settle().await;
    assert_eq!(clipboard_messages(&conduit.sent(), "secret notes"), 0);
}
