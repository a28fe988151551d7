//! WebSocket upgrade and messaging over a real socket, including a
//! server-initiated broadcast through the open-socket registry.

mod common;

use pode::context::ServerContext;
use pode::endpoint::{Endpoint, Protocol};
use pode::listener;
use pode::protocol::websocket::WsFrame;
use pode::scheduler::WorkerPool;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

fn masked_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mask = [0xaau8, 0xbb, 0xcc, 0xdd];
    let mut raw = vec![0x80 | opcode];
    assert!(payload.len() < 126);
    raw.push(0x80 | payload.len() as u8);
    raw.extend_from_slice(&mask);
    raw.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    raw
}

fn read_server_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).unwrap();
    let opcode = head[0] & 0x0f;
    let len = (head[1] & 0x7f) as usize;
    assert!(len < 126, "test frames stay small");
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (opcode, payload)
}

fn upgrade(stream: &mut TcpStream) -> HashMap<String, String> {
    let request = "GET /chat HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
    stream.write_all(request.as_bytes()).unwrap();

    let mut reader = BufReader::new(stream);
    let mut status = String::new();
    reader.read_line(&mut status).unwrap();
    assert!(status.starts_with("HTTP/1.1 101"), "{status}");

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    headers
}

#[test]
fn upgrade_echo_and_broadcast() {
    common::init();

    let mut ctx = ServerContext::new();
    ctx.endpoints
        .add(Endpoint::new(Protocol::Ws, "127.0.0.1", 0).unwrap())
        .unwrap();
    ctx.add_ws_handler("/chat", |event| {
        if let WsFrame::Text(text) = &event.frame {
            event.reply(WsFrame::Text(format!("echo:{text}")));
        }
        Ok(())
    });

    let ctx = Arc::new(ctx);
    let registry = ctx.websockets.clone();
    let pool = WorkerPool::start(ctx.clone(), 2, 0x10000);
    let server = listener::start(ctx, pool.sender(), 0x10000).unwrap();
    let addr = server.bound_addrs()[0].1;

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let headers = upgrade(&mut stream);
    assert_eq!(
        headers.get("sec-websocket-accept").map(String::as_str),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );
    assert_eq!(headers.get("upgrade").map(String::as_str), Some("websocket"));
    assert!(headers.contains_key("x-pode-clientid"));

    // Echo round-trip.
    stream.write_all(&masked_frame(0x1, b"hello")).unwrap();
    let (opcode, payload) = read_server_frame(&mut stream);
    assert_eq!(opcode, 0x1);
    assert_eq!(payload, b"echo:hello");

    // The connection registered itself with the open-socket set.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while registry.is_empty() {
        assert!(std::time::Instant::now() < deadline, "never registered");
        std::thread::sleep(Duration::from_millis(20));
    }

    // Server-initiated broadcast reaches the client between reads.
    assert_eq!(registry.broadcast(WsFrame::Text("news".into())), 1);
    let (opcode, payload) = read_server_frame(&mut stream);
    assert_eq!(opcode, 0x1);
    assert_eq!(payload, b"news");

    // Ping gets a pong with the same payload.
    stream.write_all(&masked_frame(0x9, b"pp")).unwrap();
    let (opcode, payload) = read_server_frame(&mut stream);
    assert_eq!(opcode, 0xa);
    assert_eq!(payload, b"pp");

    // Close handshake completes and the registry drains.
    stream.write_all(&masked_frame(0x8, &[0x03, 0xe8])).unwrap();
    let (opcode, _) = read_server_frame(&mut stream);
    assert_eq!(opcode, 0x8);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !registry.is_empty() {
        assert!(std::time::Instant::now() < deadline, "never unregistered");
        std::thread::sleep(Duration::from_millis(20));
    }

    server.stop();
    pool.shutdown(Duration::from_secs(2));
}

#[test]
fn upgrade_without_handler_is_404() {
    common::init();

    let mut ctx = ServerContext::new();
    ctx.endpoints
        .add(Endpoint::new(Protocol::Ws, "127.0.0.1", 0).unwrap())
        .unwrap();
    let ctx = Arc::new(ctx);
    let pool = WorkerPool::start(ctx.clone(), 1, 0x10000);
    let server = listener::start(ctx, pool.sender(), 0x10000).unwrap();
    let addr = server.bound_addrs()[0].1;

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(
            b"GET /nowhere HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .unwrap();

    let mut reader = BufReader::new(&stream);
    let mut status = String::new();
    reader.read_line(&mut status).unwrap();
    assert!(status.starts_with("HTTP/1.1 404"), "{status}");

    server.stop();
    pool.shutdown(Duration::from_secs(2));
}
