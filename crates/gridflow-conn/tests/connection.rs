//! End-to-end connection tests over real socketpairs and listeners.
//!
//! The single-flight guarantee (at most one flush batch in transit per
//! connection) holds structurally: one task owns the write half and issues
//! one transport write per batch. Its observational stand-in here is
//! `async_write_completions_fire_in_fifo_order`, which drives the queue
//! across several batches and verifies that completions and the wire bytes
//! both come back contiguous and in enqueue order — an overlapping or
//! interleaved batch would corrupt the framed stream it reads back.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use gridflow_conn::frame::FrameHeader;
use gridflow_conn::{
    connect_with_retry, scan_for_disconnects, ConnectOptions, Connection, ConnectionConfig,
    ConnectionError, Registration, StreamSocket, MAX_FRAME_SIZE,
};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const REGISTER: i64 = 0;
const TASK: i64 = 1;
const RESULT: i64 = 2;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pair(config: &ConnectionConfig) -> (Arc<Connection>, Arc<Connection>) {
    init_tracing();
    let (left, right) = UnixStream::pair().unwrap();
    (
        Connection::new(StreamSocket::Unix(left), config.clone()),
        Connection::new(StreamSocket::Unix(right), config.clone()),
    )
}

/// Encode a frame with an arbitrary cookie, bypassing the connection's own
/// framing. Used to impersonate a peer speaking a different protocol.
fn raw_frame(cookie: i64, message_type: i64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    FrameHeader::new(cookie, message_type, payload.len() as u64).encode(&mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

#[tokio::test]
async fn round_trip_framing_preserves_type_and_payload() {
    let config = ConnectionConfig::default();
    let (writer, reader) = pair(&config);

    for (message_type, payload) in [
        (TASK, &b"hello, scheduler"[..]),
        (-42, &b""[..]),
        (i64::MAX, &[0u8, 255, 7, 7][..]),
    ] {
        writer.write_message(message_type, payload).await.unwrap();
        let received = reader.read_message(message_type).await.unwrap();
        assert_eq!(&received[..], payload);
    }
}

#[tokio::test]
async fn sync_read_rejects_unexpected_type() {
    let (writer, reader) = pair(&ConnectionConfig::default());

    writer.write_message(TASK, b"work").await.unwrap();
    assert!(matches!(
        reader.read_message(RESULT).await,
        Err(ConnectionError::TypeMismatch {
            expected: RESULT,
            received: TASK,
        })
    ));
}

#[tokio::test]
async fn async_write_completions_fire_in_fifo_order() {
    // A batch max of 2 forces the queue to drain across several flushes.
    let config = ConnectionConfig::default().with_write_batch_max(2);
    let (writer, reader) = pair(&config);

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..7i64 {
        let order = Arc::clone(&order);
        writer.write_message_async(i, format!("message {i}").as_bytes(), move |outcome| {
            outcome.unwrap();
            order.lock().unwrap().push(i);
        });
    }
    // A trailing sync write completes only after everything queued before it.
    writer.write_message(7, b"fence").await.unwrap();

    assert_eq!(*order.lock().unwrap(), (0..7).collect::<Vec<_>>());
    assert_eq!(writer.async_writes(), 7);
    assert_eq!(writer.sync_writes(), 1);

    // Batching never reorders or interleaves frames on the wire.
    for i in 0..7i64 {
        let payload = reader.read_message(i).await.unwrap();
        assert_eq!(&payload[..], format!("message {i}").as_bytes());
    }
}

#[tokio::test]
async fn broken_pipe_fails_fast_without_transport_calls() {
    let (writer, reader) = pair(&ConnectionConfig::default());
    drop(reader);

    // Keep writing until the transport reports the break; the kernel may
    // accept an initial flush into its buffer.
    let chunk = vec![0u8; 64 * 1024];
    let mut saw_error = false;
    for _ in 0..32 {
        if writer.write_message(TASK, &chunk).await.is_err() {
            saw_error = true;
            break;
        }
    }
    assert!(saw_error, "write to a dropped peer never failed");
    assert!(writer.is_broken());

    // Later enqueues fail immediately, before any transport attempt.
    let (tx, mut rx) = mpsc::unbounded_channel();
    writer.write_message_async(TASK, b"late", move |outcome| {
        let _ = tx.send(outcome);
    });
    let outcome = rx.recv().await.unwrap();
    assert!(matches!(outcome, Err(ConnectionError::ConnectionClosed)));

    assert!(matches!(
        writer.write_message(TASK, b"later").await,
        Err(ConnectionError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn sync_read_failure_marks_connection_broken() {
    let (conn, peer) = pair(&ConnectionConfig::default());
    drop(peer);

    // EOF on the synchronous read path is a transport failure like any
    // other: the connection must go sticky-broken.
    assert!(matches!(
        conn.read_message(TASK).await,
        Err(ConnectionError::ConnectionClosed)
    ));
    assert!(conn.is_broken());

    // And subsequent writes fail fast without touching the transport.
    assert!(matches!(
        conn.write_message(TASK, b"after eof").await,
        Err(ConnectionError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn oversized_frame_terminates_read_loop() {
    let config = ConnectionConfig::default();
    let (receiver, sender) = pair(&config);

    receiver
        .register(REGISTER, &Registration::new("gridflow-scheduler/0.1.0"))
        .await
        .unwrap();

    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    receiver.process_messages(
        Arc::new(|_conn, _message_type, _payload| {
            panic!("no message should be dispatched for an oversized frame");
        }),
        Arc::new(move |_conn, err| {
            let _ = err_tx.send(err);
        }),
    );

    // A bare header announcing more payload than the frame limit allows;
    // the length check must fire before any body allocation.
    let mut header = BytesMut::new();
    FrameHeader::new(config.cookie, TASK, MAX_FRAME_SIZE + 1).encode(&mut header);
    sender.write_buffers(vec![header.freeze()]).await.unwrap();

    let err = timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, ConnectionError::FrameTooLarge { .. }));
    assert!(receiver.is_broken());

    // The loop stopped: the channel yields nothing further.
    assert!(timeout(Duration::from_millis(100), err_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn read_loop_dispatches_messages_in_order() {
    let (scheduler, worker) = pair(&ConnectionConfig::default());

    worker
        .register(REGISTER, &Registration::new("gridflow-worker/0.1.0"))
        .await
        .unwrap();

    // The scheduler sees the registration as an ordinary first frame.
    let payload = scheduler.read_message(REGISTER).await.unwrap();
    let registration = Registration::from_bytes(&payload).unwrap();
    assert_eq!(registration.peer_info, "gridflow-worker/0.1.0");

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let (err_tx, _err_rx) = mpsc::unbounded_channel::<ConnectionError>();
    worker.process_messages(
        Arc::new(move |_conn, message_type, payload| {
            let _ = msg_tx.send((message_type, payload));
        }),
        Arc::new(move |_conn, err| {
            let _ = err_tx.send(err);
        }),
    );

    for i in 0..3u8 {
        scheduler.write_message(TASK, &[i]).await.unwrap();
    }
    for i in 0..3u8 {
        let (message_type, payload) = timeout(Duration::from_secs(5), msg_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message_type, TASK);
        assert_eq!(&payload[..], &[i]);
    }
}

#[tokio::test]
async fn read_loop_reports_peer_drop_to_error_handler_once() {
    let (scheduler, worker) = pair(&ConnectionConfig::default());

    worker
        .register(REGISTER, &Registration::new("gridflow-worker/0.1.0"))
        .await
        .unwrap();

    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    worker.process_messages(
        Arc::new(|_conn, _message_type, _payload| {}),
        Arc::new(move |_conn, err| {
            let _ = err_tx.send(err);
        }),
    );

    drop(scheduler);
    let err = timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, ConnectionError::ConnectionClosed));
    assert!(worker.is_broken());

    // Exactly once: the channel yields nothing further.
    assert!(timeout(Duration::from_millis(100), err_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn mismatched_cookie_from_unaddressable_peer_is_dropped() {
    let config = ConnectionConfig::default().with_cookie(0x1111);
    let (receiver, sender) = pair(&config);

    receiver
        .register(REGISTER, &Registration::new("gridflow-scheduler/0.1.0"))
        .await
        .unwrap();

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<ConnectionError>();
    receiver.process_messages(
        Arc::new(move |_conn, message_type, payload| {
            let _ = msg_tx.send((message_type, payload));
        }),
        Arc::new(move |_conn, err| {
            let _ = err_tx.send(err);
        }),
    );

    // A foreign frame followed by a valid one: the foreign frame is dropped
    // and processing continues.
    sender
        .write_buffers(vec![raw_frame(0x2222, TASK, b"foreign")])
        .await
        .unwrap();
    sender
        .write_buffers(vec![raw_frame(0x1111, TASK, b"native")])
        .await
        .unwrap();

    let (message_type, payload) = timeout(Duration::from_secs(5), msg_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message_type, TASK);
    assert_eq!(&payload[..], b"native");
    assert!(err_rx.try_recv().is_err());
}

#[tokio::test]
async fn mismatched_cookie_from_addressable_peer_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = TcpStream::connect(addr).await.unwrap();
    let (accepted, _) = listener.accept().await.unwrap();

    let config = ConnectionConfig::default().with_cookie(0x1111);
    let server_conn = Connection::new(StreamSocket::Tcp(accepted), config.clone());
    let client_conn = Connection::new(StreamSocket::Tcp(client), config);

    assert!(!server_conn.remote_endpoint_info().is_empty());

    server_conn
        .register(REGISTER, &Registration::new("gridflow-scheduler/0.1.0"))
        .await
        .unwrap();

    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    server_conn.process_messages(
        Arc::new(|_conn, _message_type, _payload| {
            panic!("no message should be dispatched for a corrupt frame");
        }),
        Arc::new(move |_conn, err| {
            let _ = err_tx.send(err);
        }),
    );

    client_conn
        .write_buffers(vec![raw_frame(0x2222, TASK, b"foreign")])
        .await
        .unwrap();

    let err = timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(err.is_fatal(), "expected fatal escalation, got: {err}");
    assert!(matches!(
        err,
        ConnectionError::CookieMismatch {
            expected: 0x1111,
            received: 0x2222,
            ..
        }
    ));
}

#[tokio::test]
async fn connect_with_retry_attempts_at_most_retries_plus_one() {
    let options = ConnectOptions::default()
        .with_num_retries(2)
        .with_retry_interval(Duration::from_millis(5));

    let err = connect_with_retry("/nonexistent/gridflow/scheduler.sock", options)
        .await
        .unwrap_err();
    match err {
        ConnectionError::ConnectFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected ConnectFailed, got: {other}"),
    }
}

#[tokio::test]
async fn connect_with_retry_honors_timeout_budget() {
    let options = ConnectOptions::default()
        .with_timeout(Duration::from_millis(30))
        .with_retry_interval(Duration::from_millis(10));

    let err = connect_with_retry("/nonexistent/gridflow/scheduler.sock", options)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Timeout { .. }));
}

#[tokio::test]
async fn connect_with_retry_exhausted_budget_fails_before_connecting() {
    // A spent budget short-circuits the attempt itself, so even a target
    // that would hang cannot overrun the deadline.
    let options = ConnectOptions::default().with_timeout(Duration::ZERO);

    let err = connect_with_retry("/nonexistent/gridflow/scheduler.sock", options)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Timeout { .. }));
}

#[tokio::test]
async fn connect_with_retry_rejects_invalid_endpoint() {
    let err = connect_with_retry("", ConnectOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::InvalidEndpoint { .. }));
}

#[tokio::test]
async fn connect_with_retry_reaches_a_listener() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scheduler.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let options = ConnectOptions::default()
        .with_num_retries(3)
        .with_retry_interval(Duration::from_millis(5));
    let socket = connect_with_retry(path.to_str().unwrap(), options)
        .await
        .unwrap();
    assert!(matches!(socket, StreamSocket::Unix(_)));
    let worker = Connection::new(socket, ConnectionConfig::default().with_debug_label("worker"));

    let (accepted, _) = listener.accept().await.unwrap();
    let scheduler = Connection::new(
        StreamSocket::Unix(accepted),
        ConnectionConfig::default().with_debug_label("scheduler"),
    );

    worker.write_message(TASK, b"first contact").await.unwrap();
    let payload = scheduler.read_message(TASK).await.unwrap();
    assert_eq!(&payload[..], b"first contact");
}

#[tokio::test]
async fn raw_buffer_io_bypasses_framing() {
    let (writer, reader) = pair(&ConnectionConfig::default());

    writer
        .write_buffers(vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defg")])
        .await
        .unwrap();

    let mut first = [0u8; 3];
    let mut second = [0u8; 4];
    reader
        .read_buffers(&mut [&mut first, &mut second])
        .await
        .unwrap();
    assert_eq!(&first, b"abc");
    assert_eq!(&second, b"defg");
    assert_eq!(reader.bytes_read(), 7);
}

#[tokio::test]
async fn close_fails_outstanding_work_through_normal_paths() {
    let (conn, peer) = pair(&ConnectionConfig::default());

    conn.close();
    assert!(conn.is_closed());

    // A write issued after close still gets its completion, with a failure.
    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.write_message_async(TASK, b"too late", move |outcome| {
        let _ = tx.send(outcome);
    });
    assert!(matches!(
        rx.recv().await.unwrap(),
        Err(ConnectionError::ConnectionClosed)
    ));

    // The peer observes the shutdown as a disconnect.
    assert_eq!(scan_for_disconnects(&[peer]), vec![true]);
}
