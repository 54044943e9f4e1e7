// Wire-level tests for minirpc
//
// One side of each test is a plain std socket that reads and writes frames
// by hand, so replies can be reordered, withheld or corrupted.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use minirpc::{codec, Connection, ConnectionSet, DisconnectReason, MinirpcError, Protocol, SetConfig, Status};
use minirpc_common::{write_frame, FrameFlags, FrameHeader, HEADER_LEN};
use serde::{Deserialize, Serialize};

// ============================================================================
// Test Helpers
// ============================================================================

const COUNT: u32 = 3;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct CountReply {
    count: u32,
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn read_frame(stream: &mut TcpStream) -> (FrameHeader, Vec<u8>) {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).unwrap();
    let header = FrameHeader::parse(&header).unwrap();
    let mut payload = vec![0u8; header.payload_len as usize];
    stream.read_exact(&mut payload).unwrap();
    (header, payload)
}

fn send_count(stream: &mut TcpStream, sequence: u32, count: u32) {
    let payload = codec::encode(&CountReply { count }).unwrap();
    stream
        .write_all(&write_frame(FrameHeader::reply(COUNT, sequence), &payload))
        .unwrap();
}

/// A client set connected to a raw listener, plus the accepted raw stream
struct RawServer {
    set: ConnectionSet<()>,
    conn: Connection<()>,
    peer: TcpStream,
    reasons: Arc<Mutex<Vec<DisconnectReason>>>,
    ioerrs: Arc<Mutex<Vec<String>>>,
}

impl RawServer {
    fn new() -> Self {
        let protocol = Protocol::<()>::builder("colors")
            .sends::<String, CountReply>(COUNT)
            .build()
            .unwrap();
        let set = ConnectionSet::create(protocol, ());
        set.start_dispatch(1).unwrap();

        let reasons = Arc::new(Mutex::new(Vec::new()));
        let ioerrs = Arc::new(Mutex::new(Vec::new()));
        let sink = reasons.clone();
        set.set_disconnect_fn(move |_conn, reason| sink.lock().unwrap().push(reason));
        let sink = ioerrs.clone();
        set.set_ioerr_fn(move |_conn, msg| sink.lock().unwrap().push(msg.to_string()));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let conn = set.connect(listener.local_addr().unwrap(), ()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        Self {
            set,
            conn,
            peer,
            reasons,
            ioerrs,
        }
    }

    fn reasons(&self) -> Vec<DisconnectReason> {
        self.reasons.lock().unwrap().clone()
    }

    fn ioerr_count(&self) -> usize {
        self.ioerrs.lock().unwrap().len()
    }
}

impl Drop for RawServer {
    fn drop(&mut self) {
        self.set.shutdown();
    }
}

// ============================================================================
// Reply Matching
// ============================================================================

#[test]
fn test_request_frame_layout() {
    let mut raw = RawServer::new();
    let call = raw
        .conn
        .start_call::<String, CountReply>(COUNT, &"teal".to_string())
        .unwrap();

    let (header, payload) = read_frame(&mut raw.peer);
    assert_eq!(header.command, COUNT);
    assert_eq!(header.sequence, call.sequence());
    assert_eq!(header.flags, FrameFlags::empty());
    assert_eq!(payload, vec![0, 0, 0, 4, b't', b'e', b'a', b'l']);

    send_count(&mut raw.peer, header.sequence, 4);
    assert_eq!(call.wait().unwrap(), CountReply { count: 4 });
}

#[test]
fn test_out_of_order_replies() {
    let mut raw = RawServer::new();
    let first = raw
        .conn
        .start_call::<String, CountReply>(COUNT, &"a".to_string())
        .unwrap();
    let second = raw
        .conn
        .start_call::<String, CountReply>(COUNT, &"bb".to_string())
        .unwrap();

    let (h1, _) = read_frame(&mut raw.peer);
    let (h2, _) = read_frame(&mut raw.peer);
    assert_eq!(h1.sequence, first.sequence());
    assert_eq!(h2.sequence, second.sequence());

    send_count(&mut raw.peer, h2.sequence, 20);
    assert_eq!(second.wait().unwrap().count, 20);
    assert!(!first.is_resolved());

    send_count(&mut raw.peer, h1.sequence, 10);
    assert_eq!(first.wait().unwrap().count, 10);
    assert_eq!(raw.ioerr_count(), 0);
}

#[test]
fn test_error_reply_status() {
    let mut raw = RawServer::new();
    let call = raw
        .conn
        .start_call::<String, CountReply>(COUNT, &"teal".to_string())
        .unwrap();
    let (header, _) = read_frame(&mut raw.peer);

    let code = Status::APPLICATION_BASE + 7;
    raw.peer
        .write_all(&write_frame(
            FrameHeader::error_reply(COUNT, header.sequence),
            &code.to_be_bytes(),
        ))
        .unwrap();
    assert!(matches!(
        call.wait(),
        Err(MinirpcError::Remote(Status::Application(c))) if c == code
    ));
}

#[test]
fn test_unmatched_reply_reported() {
    let mut raw = RawServer::new();
    send_count(&mut raw.peer, 999, 1);
    assert!(wait_until(Duration::from_secs(5), || raw.ioerr_count() == 1));
    assert!(raw.conn.is_connected());

    // reply naming the wrong command resolves the call with an error
    let call = raw
        .conn
        .start_call::<String, CountReply>(COUNT, &"teal".to_string())
        .unwrap();
    let (header, _) = read_frame(&mut raw.peer);
    raw.peer
        .write_all(&write_frame(FrameHeader::reply(COUNT + 1, header.sequence), &[0, 0, 0, 1]))
        .unwrap();
    assert!(matches!(call.wait(), Err(MinirpcError::MalformedFrame(_))));
    assert!(wait_until(Duration::from_secs(5), || raw.ioerr_count() == 2));
    assert!(raw.conn.is_connected());
}

#[test]
fn test_malformed_reply_payload() {
    let mut raw = RawServer::new();
    let call = raw
        .conn
        .start_call::<String, CountReply>(COUNT, &"teal".to_string())
        .unwrap();
    let (header, _) = read_frame(&mut raw.peer);
    raw.peer
        .write_all(&write_frame(FrameHeader::reply(COUNT, header.sequence), &[0, 1]))
        .unwrap();
    assert!(matches!(call.wait(), Err(MinirpcError::Codec(_))));
    assert!(raw.conn.is_connected());
}

// ============================================================================
// Cancellation and Timeouts
// ============================================================================

#[test]
fn test_cancel_from_another_thread() {
    let mut raw = RawServer::new();
    let call = raw
        .conn
        .start_call::<String, CountReply>(COUNT, &"teal".to_string())
        .unwrap();
    let handle = call.cancel_handle();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.cancel()
    });

    assert!(matches!(call.wait(), Err(MinirpcError::Cancelled)));
    assert!(canceller.join().unwrap());

    // the late reply is dropped quietly
    let (header, _) = read_frame(&mut raw.peer);
    send_count(&mut raw.peer, header.sequence, 4);

    let next = raw
        .conn
        .start_call::<String, CountReply>(COUNT, &"red".to_string())
        .unwrap();
    let (header, _) = read_frame(&mut raw.peer);
    send_count(&mut raw.peer, header.sequence, 3);
    assert_eq!(next.wait().unwrap().count, 3);
    assert_eq!(raw.ioerr_count(), 0);
}

#[test]
fn test_call_timeout() {
    let raw = RawServer::new();
    let result: minirpc::Result<CountReply> =
        raw.conn
            .call_timeout(COUNT, &"teal".to_string(), Duration::from_millis(100));
    assert!(matches!(result, Err(MinirpcError::Timeout(100))));
    assert_eq!(raw.conn.pending_calls(), 0);
    assert!(raw.conn.is_connected());
}

#[test]
fn test_dropping_pending_call_cancels_it() {
    let raw = RawServer::new();
    let call = raw
        .conn
        .start_call::<String, CountReply>(COUNT, &"teal".to_string())
        .unwrap();
    assert_eq!(raw.conn.pending_calls(), 1);
    drop(call);
    assert_eq!(raw.conn.pending_calls(), 0);
}

// ============================================================================
// Disconnects
// ============================================================================

#[test]
fn test_close_fails_outstanding_calls() {
    let mut raw = RawServer::new();
    let calls: Vec<_> = (0..3)
        .map(|_| {
            raw.conn
                .start_call::<String, CountReply>(COUNT, &"teal".to_string())
                .unwrap()
        })
        .collect();
    assert_eq!(raw.conn.pending_calls(), 3);

    raw.conn.close().unwrap();
    for call in calls {
        assert!(matches!(call.wait(), Err(MinirpcError::Disconnected)));
    }

    // every queued request was flushed before the socket shut down
    for _ in 0..3 {
        let (header, _) = read_frame(&mut raw.peer);
        assert_eq!(header.command, COUNT);
    }
    let mut rest = Vec::new();
    raw.peer.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    assert!(wait_until(Duration::from_secs(5), || !raw.reasons().is_empty()));
    assert_eq!(raw.reasons(), vec![DisconnectReason::User]);
}

#[test]
fn test_peer_drop_fails_outstanding_calls() {
    let mut raw = RawServer::new();
    let call = raw
        .conn
        .start_call::<String, CountReply>(COUNT, &"teal".to_string())
        .unwrap();
    read_frame(&mut raw.peer);
    raw.peer.shutdown(std::net::Shutdown::Both).unwrap();

    assert!(matches!(call.wait(), Err(MinirpcError::Disconnected)));
    assert!(wait_until(Duration::from_secs(5), || !raw.reasons().is_empty()));
    assert_eq!(raw.reasons(), vec![DisconnectReason::Closed]);
    assert_eq!(raw.conn.disconnect_reason(), Some(DisconnectReason::Closed));
}

#[test]
fn test_oversized_frame_closes_connection() {
    let protocol = Protocol::<()>::builder("colors")
        .handles(COUNT, |_conn, name: String| Ok(CountReply { count: name.len() as u32 }))
        .build()
        .unwrap();
    let config = SetConfig::new().with_max_payload_len(1024);
    let server = ConnectionSet::with_config(protocol, (), config).unwrap();
    server.start_dispatch(1).unwrap();
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = reasons.clone();
    server.set_disconnect_fn(move |_conn, reason| sink.lock().unwrap().push(reason));
    let addr = server.listen_default("127.0.0.1:0").unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let header = FrameHeader {
        payload_len: 1025,
        ..FrameHeader::request(COUNT, 1)
    };
    client.write_all(&header.to_bytes()).unwrap();

    let mut buf = [0u8; 16];
    match client.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0, "expected the server to close the stream"),
        Err(e) => assert!(
            matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted),
            "unexpected error: {}",
            e
        ),
    }

    assert!(wait_until(Duration::from_secs(5), || !reasons.lock().unwrap().is_empty()));
    assert_eq!(*reasons.lock().unwrap(), vec![DisconnectReason::ProtocolError]);
    server.shutdown();
}

#[test]
fn test_request_with_error_flag_is_rejected() {
    let protocol = Protocol::<()>::builder("colors")
        .handles(COUNT, |_conn, name: String| Ok(CountReply { count: name.len() as u32 }))
        .build()
        .unwrap();
    let server = ConnectionSet::create(protocol, ());
    server.start_dispatch(1).unwrap();
    let ioerrs = Arc::new(AtomicUsize::new(0));
    let counter = ioerrs.clone();
    server.set_ioerr_fn(move |_conn, _msg| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let addr = server.listen_default("127.0.0.1:0").unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let payload = codec::encode("teal").unwrap();
    let header = FrameHeader {
        flags: FrameFlags::ERROR,
        ..FrameHeader::request(COUNT, 5)
    };
    client.write_all(&write_frame(header, &payload)).unwrap();

    let (reply, payload) = read_frame(&mut client);
    assert_eq!(reply.sequence, 5);
    assert_eq!(reply.flags, FrameFlags::REPLY | FrameFlags::ERROR);
    assert_eq!(payload, Status::MalformedPayload.code().to_be_bytes());
    assert_eq!(ioerrs.load(Ordering::SeqCst), 1);

    // a well-formed request on the same stream still works
    client
        .write_all(&write_frame(FrameHeader::request(COUNT, 6), &payload_for("teal")))
        .unwrap();
    let (reply, payload) = read_frame(&mut client);
    assert_eq!(reply.sequence, 6);
    assert_eq!(reply.flags, FrameFlags::REPLY);
    assert_eq!(codec::decode::<CountReply>(&payload).unwrap().count, 4);

    server.shutdown();
}

fn payload_for(name: &str) -> Vec<u8> {
    codec::encode(name).unwrap()
}
