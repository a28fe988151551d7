//! Per-connection state machine.
//!
//! A context is created on accept (`New`), opened (TLS handshake) by the
//! worker that takes it (`Open`), then loops `Receiving` → `Received` →
//! `Processing` → response for as long as keep-alive holds. Errored
//! connections move to `Error`/`SslError` and are closed. The keep-alive
//! loop is explicit, bounded by an idle timeout and a max-requests cap.

use crate::context::{ServerContext, SmtpEvent, TcpEvent, WsEvent};
use crate::endpoint::{Endpoint, ProtocolFamily};
use crate::error::Error;
use crate::ids::ConnectionId;
use crate::listener::tls::{self, ClientCertificate};
use crate::pipeline::{self, HttpEvent};
use crate::protocol::http::{self, HttpRequest, HttpResponse};
use crate::protocol::smtp::{SmtpAction, SmtpSession, GREETING};
use crate::protocol::websocket::{self, WsFrame};
use chrono::{DateTime, Utc};
use may::net::TcpStream;
use rustls::{ServerConnection, StreamOwned};
use serde_json::json;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Keep-alive idle timeout between requests on one connection.
const KEEP_ALIVE_IDLE: Duration = Duration::from_secs(30);
/// Requests served over one connection before it is closed.
const MAX_KEEP_ALIVE_REQUESTS: usize = 100;
/// Poll interval for WebSocket outbox delivery while the socket is idle.
const WS_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextType {
    Unknown,
    Http,
    WebSocket,
    Smtp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    New,
    Open,
    Receiving,
    Received,
    Processing,
    Error,
    SslError,
    Closed,
}

/// The socket, plain or wrapped in a TLS session.
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(s) => s,
            Stream::Tls(s) => &s.sock,
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

/// One accepted connection, owned by a single worker for its lifetime.
pub struct RequestContext {
    pub id: ConnectionId,
    pub endpoint: Arc<Endpoint>,
    pub remote_addr: SocketAddr,
    pub created: DateTime<Utc>,
    pub state: ContextState,
    pub ctype: ContextType,
    pub client_certificate: Option<ClientCertificate>,
    stream: Option<Stream>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
}

impl RequestContext {
    pub fn new(
        socket: TcpStream,
        remote_addr: SocketAddr,
        endpoint: Arc<Endpoint>,
        tls_config: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            endpoint,
            remote_addr,
            created: Utc::now(),
            state: ContextState::New,
            ctype: ContextType::Unknown,
            client_certificate: None,
            stream: Some(Stream::Plain(socket)),
            tls_config,
        }
    }

    /// Transition `New` → `Open`, performing the TLS handshake on secure
    /// endpoints. Handshake failure sets `SslError`.
    pub fn open(&mut self) -> crate::error::Result<()> {
        if let Some(config) = self.tls_config.take() {
            let Some(Stream::Plain(tcp)) = self.stream.take() else {
                self.state = ContextState::Error;
                return Err(Error::protocol("connection already opened"));
            };
            match tls::handshake(config, tcp) {
                Ok((tls_stream, peer)) => {
                    self.client_certificate = peer;
                    self.stream = Some(Stream::Tls(Box::new(tls_stream)));
                }
                Err(e) => {
                    self.state = ContextState::SslError;
                    return Err(e);
                }
            }
        }
        self.state = ContextState::Open;
        Ok(())
    }
}

/// Run one connection to completion. Called from a worker; errors are
/// logged here, never propagated past the request boundary.
pub fn handle_connection(ctx: &ServerContext, mut conn: RequestContext) {
    debug!(
        connection = %conn.id,
        endpoint = %conn.endpoint,
        remote = %conn.remote_addr,
        "connection accepted"
    );

    if let Err(e) = conn.open() {
        warn!(connection = %conn.id, error = %e, "connection open failed");
        return;
    }

    let Some(stream) = conn.stream.take() else {
        return;
    };

    let result = match conn.endpoint.protocol.family() {
        ProtocolFamily::Web => http_loop(ctx, &mut conn, stream),
        ProtocolFamily::Smtp => smtp_loop(ctx, &mut conn, stream),
        ProtocolFamily::Tcp => tcp_loop(ctx, &mut conn, stream),
    };

    match result {
        Ok(()) => {
            conn.state = ContextState::Closed;
            debug!(connection = %conn.id, "connection closed");
        }
        Err(e) => {
            conn.state = ContextState::Error;
            debug!(connection = %conn.id, error = %e, "connection errored");
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn http_loop(
    ctx: &ServerContext,
    conn: &mut RequestContext,
    stream: Stream,
) -> crate::error::Result<()> {
    conn.ctype = ContextType::Http;
    let request_timeout = ctx.config.server.request.timeout_duration();
    let body_size = ctx.config.server.request.body_size;

    let mut reader = BufReader::new(stream);
    let mut served = 0usize;

    loop {
        conn.state = ContextState::Receiving;
        reader
            .get_ref()
            .set_read_timeout(Some(request_timeout.unwrap_or(KEEP_ALIVE_IDLE)))?;

        let request = match http::parse_request(&mut reader, body_size) {
            Ok(None) => return Ok(()),
            Ok(Some(request)) => request,
            Err(Error::Io(e)) if is_timeout(&e) => {
                debug!(connection = %conn.id, "keep-alive idle timeout");
                return Ok(());
            }
            Err(Error::Io(e)) => return Err(Error::Io(e)),
            Err(Error::LimitExceeded(msg)) => {
                warn!(connection = %conn.id, %msg, "request over limit");
                write_error_response(&mut reader, 413, &msg)?;
                drain_briefly(&mut reader);
                return Ok(());
            }
            Err(e) => {
                warn!(connection = %conn.id, error = %e, "malformed request");
                write_error_response(&mut reader, 400, "Bad Request")?;
                return Ok(());
            }
        };
        conn.state = ContextState::Received;

        if !conn.endpoint.matches_hostname(request.host()) {
            write_error_response(&mut reader, 400, "invalid Host header")?;
            return Ok(());
        }

        // A valid upgrade request flips this connection to WebSocket.
        if let Some(key) = request.websocket_key() {
            if ctx.ws_handler_for(&request.path).is_some() {
                let key = key.to_string();
                return ws_loop(ctx, conn, reader, &request, &key);
            }
            write_error_response(&mut reader, 404, "no WebSocket handler for this path")?;
            return Ok(());
        }

        let keep_alive_requested = request.keep_alive();
        conn.state = ContextState::Processing;

        let mut event = HttpEvent::new(
            conn.id,
            conn.remote_addr,
            conn.endpoint.clone(),
            request,
            ctx.runtime(),
        );
        event.client_certificate = conn.client_certificate.clone();
        pipeline::process(ctx, &mut event);

        served += 1;
        let keep_alive = keep_alive_requested && served < MAX_KEEP_ALIVE_REQUESTS;

        info!(
            connection = %conn.id,
            request_id = %event.request_id,
            method = %event.request.method,
            path = %event.request.path,
            status = event.response.status,
            "request completed"
        );

        event.response.write_to(reader.get_mut(), keep_alive)?;
        if !keep_alive {
            return Ok(());
        }
    }
}

fn write_error_response(
    reader: &mut BufReader<Stream>,
    status: u16,
    message: &str,
) -> std::io::Result<()> {
    let mut response = HttpResponse::new();
    response.status(status).json(&json!({ "error": message }));
    response.write_to(reader.get_mut(), false)
}

/// Swallow whatever request bytes are still in flight so closing the socket
/// does not reset the connection before the error response lands.
fn drain_briefly(reader: &mut BufReader<Stream>) {
    let _ = reader.get_ref().set_read_timeout(Some(Duration::from_millis(100)));
    let mut sink = [0u8; 8 * 1024];
    for _ in 0..16 {
        match reader.read(&mut sink) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

fn ws_loop(
    ctx: &ServerContext,
    conn: &mut RequestContext,
    mut reader: BufReader<Stream>,
    request: &HttpRequest,
    key: &str,
) -> crate::error::Result<()> {
    conn.ctype = ContextType::WebSocket;
    let path = request.path.clone();

    websocket::upgrade_response(key, conn.id).write_to(reader.get_mut(), true)?;
    info!(connection = %conn.id, path = %path, "websocket upgraded");

    let (outbox_tx, outbox_rx) = may::sync::mpsc::channel::<WsFrame>();
    ctx.websockets.register(conn.id, outbox_tx);

    let result = (|| -> crate::error::Result<()> {
        reader.get_ref().set_read_timeout(Some(WS_POLL))?;
        loop {
            // Wait for inbound bytes, delivering queued outbound frames
            // whenever the socket is idle.
            match reader.fill_buf() {
                Ok([]) => return Ok(()),
                Ok(_) => {}
                Err(e) if is_timeout(&e) => {
                    while let Ok(frame) = outbox_rx.try_recv() {
                        websocket::write_frame(reader.get_mut(), &frame)?;
                    }
                    continue;
                }
                Err(e) => return Err(Error::Io(e)),
            }

            conn.state = ContextState::Receiving;
            let frame = websocket::read_message(&mut reader)?;
            conn.state = ContextState::Processing;

            match frame {
                WsFrame::Close(code) => {
                    websocket::write_frame(reader.get_mut(), &WsFrame::Close(code))?;
                    return Ok(());
                }
                WsFrame::Ping(payload) => {
                    websocket::write_frame(reader.get_mut(), &WsFrame::Pong(payload))?;
                }
                WsFrame::Pong(_) => {}
                message => {
                    let Some(handler) = ctx.ws_handler_for(&path) else {
                        continue;
                    };
                    let mut event = WsEvent {
                        client_id: conn.id,
                        path: path.clone(),
                        frame: message,
                        remote_addr: conn.remote_addr,
                        replies: Vec::new(),
                        runtime: ctx.runtime(),
                    };
                    if let Err(err) = handler(&mut event) {
                        error!(connection = %conn.id, error = %err, "websocket handler error");
                        continue;
                    }
                    for frame in event.replies {
                        websocket::write_frame(reader.get_mut(), &frame)?;
                    }
                }
            }
        }
    })();

    ctx.websockets.unregister(conn.id);
    result
}

fn smtp_loop(
    ctx: &ServerContext,
    conn: &mut RequestContext,
    stream: Stream,
) -> crate::error::Result<()> {
    conn.ctype = ContextType::Smtp;
    let mut reader = BufReader::new(stream);
    reader.get_ref().set_read_timeout(Some(KEEP_ALIVE_IDLE))?;

    write!(reader.get_mut(), "{GREETING}\r\n")?;
    reader.get_mut().flush()?;

    let mut session = SmtpSession::new();
    loop {
        conn.state = ContextState::Receiving;
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) if is_timeout(&e) => {
                debug!(connection = %conn.id, "smtp idle timeout");
                return Ok(());
            }
            Err(e) => return Err(Error::Io(e)),
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }

        conn.state = ContextState::Processing;
        match session.handle_line(&line) {
            SmtpAction::Continue => {}
            SmtpAction::Reply(reply) => {
                write!(reader.get_mut(), "{reply}\r\n")?;
                reader.get_mut().flush()?;
            }
            SmtpAction::Quit(reply) => {
                write!(reader.get_mut(), "{reply}\r\n")?;
                reader.get_mut().flush()?;
                return Ok(());
            }
            SmtpAction::Message(reply, message) => {
                info!(
                    connection = %conn.id,
                    from = %message.from,
                    recipients = message.to.len(),
                    "smtp message dispatched"
                );
                let mut event = SmtpEvent {
                    message,
                    remote_addr: conn.remote_addr,
                    runtime: ctx.runtime(),
                };
                for handler in &ctx.smtp_handlers {
                    if let Err(err) = handler(&mut event) {
                        error!(connection = %conn.id, error = %err, "smtp handler error");
                    }
                }
                write!(reader.get_mut(), "{reply}\r\n")?;
                reader.get_mut().flush()?;
            }
        }
    }
}

fn tcp_loop(
    ctx: &ServerContext,
    conn: &mut RequestContext,
    mut stream: Stream,
) -> crate::error::Result<()> {
    conn.ctype = ContextType::Tcp;
    stream.set_read_timeout(Some(KEEP_ALIVE_IDLE))?;

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        conn.state = ContextState::Receiving;
        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if is_timeout(&e) => {
                debug!(connection = %conn.id, "tcp idle timeout");
                return Ok(());
            }
            Err(e) => return Err(Error::Io(e)),
        };

        conn.state = ContextState::Processing;
        let mut event = TcpEvent {
            data: buf[..n].to_vec(),
            remote_addr: conn.remote_addr,
            response: Vec::new(),
            close: false,
            runtime: ctx.runtime(),
        };
        for handler in &ctx.tcp_handlers {
            if let Err(err) = handler(&mut event) {
                error!(connection = %conn.id, error = %err, "tcp handler error");
            }
        }
        if !event.response.is_empty() {
            stream.write_all(&event.response)?;
            stream.flush()?;
        }
        if event.close {
            return Ok(());
        }
    }
}
