//! Accept behavior when the process runs out of file descriptors.
//!
//! The test caps RLIMIT_NOFILE and claims every spare descriptor, which
//! is process-wide state, so it lives alone in its own binary instead of
//! beside the other engine tests.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use packline::{
    checksum, ConfigBuilder, Delivery, EngineHandle, EventHandler, OutboundMessage,
    PacklineBuilder, PKG_HEADER_SIZE,
};

/// Echoes every message back to its sender.
struct Echo;

impl EventHandler for Echo {
    fn on_message(&self, ctx: &EngineHandle, delivery: Delivery) {
        if let Ok(reply) =
            OutboundMessage::new(delivery.token, delivery.header.msg_code, &delivery.body)
        {
            ctx.send(reply);
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Find an available port by binding to :0.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_for_server(addr: &str) {
    for _ in 0..200 {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not start on {addr}");
}

fn encode_packet(msg_code: u16, body: &[u8]) -> Vec<u8> {
    let pkg_len = (PKG_HEADER_SIZE + body.len()) as u16;
    let mut raw = Vec::with_capacity(pkg_len as usize);
    raw.extend_from_slice(&pkg_len.to_be_bytes());
    raw.extend_from_slice(&msg_code.to_be_bytes());
    raw.extend_from_slice(&checksum(body).to_be_bytes());
    raw.extend_from_slice(body);
    raw
}

fn read_packet(stream: &mut TcpStream) -> io::Result<(u16, Vec<u8>)> {
    let mut header = [0u8; PKG_HEADER_SIZE];
    stream.read_exact(&mut header)?;
    let pkg_len = u16::from_be_bytes([header[0], header[1]]) as usize;
    let msg_code = u16::from_be_bytes([header[2], header[3]]);
    let mut body = vec![0u8; pkg_len - PKG_HEADER_SIZE];
    stream.read_exact(&mut body)?;
    Ok((msg_code, body))
}

/// One request/reply packet exchange, asserting the reply matches.
fn echo_once(stream: &mut TcpStream, msg_code: u16, body: &[u8]) {
    stream.write_all(&encode_packet(msg_code, body)).unwrap();
    let (code, echoed) = read_packet(stream).unwrap();
    assert_eq!(code, msg_code);
    assert_eq!(echoed, body);
}

fn nofile_limit() -> libc::rlimit {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    assert_eq!(rc, 0, "getrlimit failed");
    limit
}

fn set_nofile_limit(soft: libc::rlim_t, hard: libc::rlim_t) {
    let limit = libc::rlimit {
        rlim_cur: soft,
        rlim_max: hard,
    };
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) };
    assert_eq!(rc, 0, "setrlimit failed");
}

// ── Descriptor exhaustion ───────────────────────────────────────────

#[test]
fn fd_exhaustion_at_accept_leaves_established_connections_live() {
    let config = ConfigBuilder::new()
        .flood_detection(false)
        .idle_timeout(false)
        .max_connections(8)
        .worker_threads(1)
        .build()
        .unwrap();
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (_engine, shutdown, threads) = PacklineBuilder::new(config)
        .bind(addr.parse().unwrap())
        .launch(Echo)
        .expect("launch failed");
    wait_for_server(&addr);

    let mut established = TcpStream::connect(&addr).unwrap();
    established
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    echo_once(&mut established, 1, b"before");

    // Cap the limit, then claim every spare descriptor except one, so the
    // client side of the next connect still gets a socket while the
    // server-side accept cannot.
    let original = nofile_limit();
    set_nofile_limit(128.min(original.rlim_max), original.rlim_max);
    let mut hoard = Vec::new();
    while let Ok(f) = File::open("/dev/null") {
        hoard.push(f);
    }
    let _ = hoard.pop();

    // The handshake completes in the listen backlog; accepting it fails
    // with EMFILE on the server side.
    let starved = TcpStream::connect(&addr).expect("client connect failed");

    // The connection that is already in must keep being served. A reply
    // within the 2s read timeout proves the event loop is not stuck
    // retrying the failed accept.
    std::thread::sleep(Duration::from_millis(100));
    echo_once(&mut established, 2, b"during");
    echo_once(&mut established, 3, b"during again");

    drop(starved);
    drop(hoard);
    set_nofile_limit(original.rlim_cur, original.rlim_max);

    // Back under the limit, the same connection is still being served.
    echo_once(&mut established, 4, b"after");

    shutdown.shutdown();
    for h in threads {
        h.join().unwrap().unwrap();
    }
}
