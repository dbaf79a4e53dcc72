//! Wire-level integration tests: framing over real TCP connections.
//!
//! Each test launches an engine, connects via std TCP, writes raw packets
//! (including malformed ones), and checks what reaches the handler.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use packline::{
    checksum, Config, ConfigBuilder, Delivery, EngineHandle, Error, EventHandler,
    OutboundMessage, PacklineBuilder, ShutdownHandle, PKG_HEADER_SIZE,
};

// ── Recording handler ───────────────────────────────────────────────

/// Forwards every delivery to the test thread; echoes when asked to.
struct Recorder {
    deliveries: Sender<(u16, Vec<u8>)>,
    echo: bool,
}

impl EventHandler for Recorder {
    fn on_message(&self, ctx: &EngineHandle, delivery: Delivery) {
        let _ = self
            .deliveries
            .send((delivery.header.msg_code, delivery.body.to_vec()));
        if self.echo {
            if let Ok(reply) =
                OutboundMessage::new(delivery.token, delivery.header.msg_code, &delivery.body)
            {
                ctx.send(reply);
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn test_config() -> Config {
    // Flood detection and idle eviction off: these tests blast packets
    // and hold quiet sockets. One worker keeps delivery order exact.
    ConfigBuilder::new()
        .flood_detection(false)
        .idle_timeout(false)
        .max_connections(16)
        .worker_threads(1)
        .build()
        .unwrap()
}

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

type Engine = (
    String,
    Receiver<(u16, Vec<u8>)>,
    ShutdownHandle,
    Vec<JoinHandle<Result<(), Error>>>,
);

fn launch_recorder(config: Config, echo: bool) -> Engine {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (tx, rx) = unbounded();
    let (_engine, shutdown, threads) = PacklineBuilder::new(config)
        .bind(addr.parse().unwrap())
        .launch(Recorder {
            deliveries: tx,
            echo,
        })
        .expect("launch failed");
    wait_for_server(&addr);
    (addr, rx, shutdown, threads)
}

fn stop(shutdown: ShutdownHandle, threads: Vec<JoinHandle<Result<(), Error>>>) {
    shutdown.shutdown();
    for h in threads {
        h.join().unwrap().unwrap();
    }
}

/// Encode one packet in wire order: pkg_len, msg_code, crc32, then body.
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

fn recv_delivery(rx: &Receiver<(u16, Vec<u8>)>) -> (u16, Vec<u8>) {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("no delivery within 5s")
}

fn assert_no_more_deliveries(rx: &Receiver<(u16, Vec<u8>)>) {
    match rx.recv_timeout(Duration::from_millis(300)) {
        Err(RecvTimeoutError::Timeout) => {}
        Err(RecvTimeoutError::Disconnected) => panic!("handler channel closed"),
        Ok((code, body)) => panic!("unexpected delivery: code {code}, {} bytes", body.len()),
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn empty_body_packet_is_delivered() {
    let (addr, rx, shutdown, threads) = launch_recorder(test_config(), false);

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream.write_all(&encode_packet(7, b"")).unwrap();

    assert_eq!(recv_delivery(&rx), (7, Vec::new()));
    stop(shutdown, threads);
}

#[test]
fn packet_with_body_is_delivered_intact() {
    let (addr, rx, shutdown, threads) = launch_recorder(test_config(), false);

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream.write_all(&encode_packet(1, b"PING")).unwrap();

    assert_eq!(recv_delivery(&rx), (1, b"PING".to_vec()));
    stop(shutdown, threads);
}

#[test]
fn corrupted_crc_is_dropped_without_closing() {
    let (addr, rx, shutdown, threads) = launch_recorder(test_config(), false);

    let mut stream = TcpStream::connect(&addr).unwrap();
    let mut bad = encode_packet(2, b"corrupt-me");
    let last = bad.len() - 1;
    bad[last] ^= 0xff; // body no longer matches the declared crc
    stream.write_all(&bad).unwrap();
    // A valid packet on the same socket must still get through.
    stream.write_all(&encode_packet(3, b"after")).unwrap();

    assert_eq!(recv_delivery(&rx), (3, b"after".to_vec()));
    assert_no_more_deliveries(&rx);
    stop(shutdown, threads);
}

#[test]
fn undersized_declared_length_resyncs_without_closing() {
    let (addr, rx, shutdown, threads) = launch_recorder(test_config(), false);

    let mut stream = TcpStream::connect(&addr).unwrap();
    // pkg_len of 2 cannot even cover the header.
    let mut bogus = Vec::new();
    bogus.extend_from_slice(&2u16.to_be_bytes());
    bogus.extend_from_slice(&9u16.to_be_bytes());
    bogus.extend_from_slice(&0u32.to_be_bytes());
    stream.write_all(&bogus).unwrap();
    stream.write_all(&encode_packet(4, b"recovered")).unwrap();

    assert_eq!(recv_delivery(&rx), (4, b"recovered".to_vec()));
    assert_no_more_deliveries(&rx);
    stop(shutdown, threads);
}

#[test]
fn oversized_declared_length_resyncs_without_closing() {
    let (addr, rx, shutdown, threads) = launch_recorder(test_config(), false);

    let mut stream = TcpStream::connect(&addr).unwrap();
    // Default limit is 30000; declare twice that.
    let mut bogus = Vec::new();
    bogus.extend_from_slice(&60_000u16.to_be_bytes());
    bogus.extend_from_slice(&9u16.to_be_bytes());
    bogus.extend_from_slice(&0u32.to_be_bytes());
    stream.write_all(&bogus).unwrap();
    stream.write_all(&encode_packet(5, b"still here")).unwrap();

    assert_eq!(recv_delivery(&rx), (5, b"still here".to_vec()));
    assert_no_more_deliveries(&rx);
    stop(shutdown, threads);
}

#[test]
fn one_byte_at_a_time_arrives_whole() {
    let (addr, rx, shutdown, threads) = launch_recorder(test_config(), false);

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream.set_nodelay(true).unwrap();
    let raw = encode_packet(6, b"chunked-delivery");
    for byte in &raw {
        stream.write_all(std::slice::from_ref(byte)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(recv_delivery(&rx), (6, b"chunked-delivery".to_vec()));
    assert_no_more_deliveries(&rx);
    stop(shutdown, threads);
}

#[test]
fn several_packets_in_one_write_all_arrive_in_order() {
    let (addr, rx, shutdown, threads) = launch_recorder(test_config(), false);

    let mut stream = TcpStream::connect(&addr).unwrap();
    let mut raw = encode_packet(10, b"first");
    raw.extend_from_slice(&encode_packet(11, b"second"));
    raw.extend_from_slice(&encode_packet(12, b""));
    stream.write_all(&raw).unwrap();

    assert_eq!(recv_delivery(&rx), (10, b"first".to_vec()));
    assert_eq!(recv_delivery(&rx), (11, b"second".to_vec()));
    assert_eq!(recv_delivery(&rx), (12, Vec::new()));
    stop(shutdown, threads);
}

#[test]
fn echo_round_trip() {
    let (addr, _rx, shutdown, threads) = launch_recorder(test_config(), true);

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(&encode_packet(8, b"hello")).unwrap();

    let (code, body) = read_packet(&mut stream).unwrap();
    assert_eq!((code, body), (8, b"hello".to_vec()));
    stop(shutdown, threads);
}

#[test]
fn large_packet_round_trips() {
    let (addr, rx, shutdown, threads) = launch_recorder(test_config(), true);

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    // Comfortably larger than one TCP segment, under the 30000 limit.
    let body: Vec<u8> = (0..20_000).map(|i| (i % 251) as u8).collect();
    stream.write_all(&encode_packet(13, &body)).unwrap();

    assert_eq!(recv_delivery(&rx), (13, body.clone()));
    let (code, echoed) = read_packet(&mut stream).unwrap();
    assert_eq!(code, 13);
    assert_eq!(echoed, body);
    stop(shutdown, threads);
}
