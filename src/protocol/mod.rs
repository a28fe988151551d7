//! Wire-protocol parsers: HTTP/1.1, WebSocket framing and the SMTP dialog.

pub mod http;
pub mod smtp;
pub mod websocket;
