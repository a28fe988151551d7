//! Raw TCP endpoint: handler echo and close semantics.

mod common;

use pode::context::ServerContext;
use pode::endpoint::{Endpoint, Protocol};
use pode::listener;
use pode::scheduler::WorkerPool;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn tcp_handler_echoes_and_closes() {
    common::init();

    let mut ctx = ServerContext::new();
    ctx.endpoints
        .add(Endpoint::new(Protocol::Tcp, "127.0.0.1", 0).unwrap())
        .unwrap();
    ctx.add_tcp_handler(|event| {
        event.response = event.data.iter().rev().copied().collect();
        if event.data.starts_with(b"bye") {
            event.close = true;
        }
        Ok(())
    });

    let ctx = Arc::new(ctx);
    let pool = WorkerPool::start(ctx.clone(), 1, 0x10000);
    let server = listener::start(ctx, pool.sender(), 0x10000).unwrap();
    let addr = server.bound_addrs()[0].1;

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    stream.write_all(b"abc").unwrap();
    let mut buf = [0u8; 3];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"cba");

    stream.write_all(b"bye").unwrap();
    let mut buf = [0u8; 3];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"eyb");

    // The handler asked for the connection to close.
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);

    server.stop();
    pool.shutdown(Duration::from_secs(2));
}

#[test]
fn tcp_and_http_endpoints_cannot_mix() {
    common::init();
    let mut ctx = ServerContext::new();
    ctx.endpoints
        .add(Endpoint::new(Protocol::Tcp, "127.0.0.1", 0).unwrap())
        .unwrap();
    let err = ctx
        .endpoints
        .add(Endpoint::new(Protocol::Http, "127.0.0.1", 0).unwrap())
        .unwrap_err();
    assert!(err.to_string().contains("cannot add HTTP endpoint"));
}
