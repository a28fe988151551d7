//! SMTP command dialog (RFC 5321 minimal subset).
//!
//! The session is a line-driven state machine: the connection loop feeds it
//! one command line (or data line) at a time and writes back whatever reply
//! it returns. A completed `DATA` section surfaces as one [`SmtpMessage`]
//! event; the session then resets so the same connection can deliver
//! another message.

use std::collections::HashMap;

/// Greeting written as soon as the connection opens.
pub const GREETING: &str = "220 Pode SMTP Server ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialogState {
    /// Connected, nothing received yet.
    Connected,
    /// HELO/EHLO done; ready for MAIL FROM.
    Greeted,
    /// MAIL FROM accepted; collecting RCPT TO.
    Mail,
    /// Inside DATA, reading until `CRLF.CRLF`.
    Data,
}

/// A received mail message, dispatched as one event.
#[derive(Debug, Clone, PartialEq)]
pub struct SmtpMessage {
    pub from: String,
    pub to: Vec<String>,
    /// The raw DATA section, dot-unstuffed, without the terminating line.
    pub data: String,
}

impl SmtpMessage {
    /// RFC 5322 headers from the data section (first block, up to the blank
    /// line). Names are lowercased.
    pub fn headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        for line in self.data.lines() {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
        headers
    }

    pub fn subject(&self) -> Option<String> {
        self.headers().remove("subject")
    }

    /// Everything after the header block.
    pub fn body(&self) -> String {
        match self.data.split_once("\n\n") {
            Some((_, body)) => body.to_string(),
            None => String::new(),
        }
    }
}

/// What the connection loop should do after feeding a line in.
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpAction {
    /// Write the reply and keep reading.
    Reply(String),
    /// Data section in progress: no reply, keep reading.
    Continue,
    /// A full message arrived: write the reply, dispatch the message.
    Message(String, SmtpMessage),
    /// Write the reply and close the connection.
    Quit(String),
}

/// Per-connection SMTP dialog.
#[derive(Debug)]
pub struct SmtpSession {
    state: DialogState,
    helo: Option<String>,
    from: Option<String>,
    to: Vec<String>,
    data: String,
}

impl Default for SmtpSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SmtpSession {
    pub fn new() -> Self {
        Self {
            state: DialogState::Connected,
            helo: None,
            from: None,
            to: Vec::new(),
            data: String::new(),
        }
    }

    /// The HELO/EHLO identity the peer sent, once greeted.
    pub fn helo(&self) -> Option<&str> {
        self.helo.as_deref()
    }

    /// True when the session is at a point where a new message can start.
    pub fn can_process(&self) -> bool {
        matches!(self.state, DialogState::Greeted)
    }

    fn reset_envelope(&mut self) {
        self.from = None;
        self.to.clear();
        self.data.clear();
        if self.state != DialogState::Connected {
            self.state = DialogState::Greeted;
        }
    }

    /// Feed one received line (without its CRLF) into the dialog.
    pub fn handle_line(&mut self, line: &str) -> SmtpAction {
        if self.state == DialogState::Data {
            return self.handle_data_line(line);
        }

        let (verb, rest) = split_verb(line);
        match verb.as_str() {
            "HELO" | "EHLO" => {
                self.helo = Some(rest.trim().to_string());
                self.reset_envelope();
                self.state = DialogState::Greeted;
                SmtpAction::Reply(format!("250 Hello {}", rest.trim()))
            }
            "MAIL" => {
                if self.state == DialogState::Connected {
                    return SmtpAction::Reply("503 Bad sequence of commands".into());
                }
                match parse_path(rest, "FROM") {
                    Some(addr) => {
                        self.from = Some(addr);
                        self.to.clear();
                        self.state = DialogState::Mail;
                        SmtpAction::Reply("250 OK".into())
                    }
                    None => SmtpAction::Reply("501 Syntax: MAIL FROM:<address>".into()),
                }
            }
            "RCPT" => {
                if self.state != DialogState::Mail {
                    return SmtpAction::Reply("503 Bad sequence of commands".into());
                }
                match parse_path(rest, "TO") {
                    Some(addr) => {
                        self.to.push(addr);
                        SmtpAction::Reply("250 OK".into())
                    }
                    None => SmtpAction::Reply("501 Syntax: RCPT TO:<address>".into()),
                }
            }
            "DATA" => {
                if self.state != DialogState::Mail || self.to.is_empty() {
                    return SmtpAction::Reply("503 Bad sequence of commands".into());
                }
                self.state = DialogState::Data;
                SmtpAction::Reply("354 Start mail input; end with <CRLF>.<CRLF>".into())
            }
            "RSET" => {
                self.reset_envelope();
                SmtpAction::Reply("250 OK".into())
            }
            "QUIT" => SmtpAction::Quit("221 Bye".into()),
            "" => SmtpAction::Reply("500 Command unrecognized".into()),
            other => SmtpAction::Reply(format!("502 Command not implemented: {other}")),
        }
    }

    fn handle_data_line(&mut self, line: &str) -> SmtpAction {
        if line == "." {
            let message = SmtpMessage {
                from: self.from.take().unwrap_or_default(),
                to: std::mem::take(&mut self.to),
                data: std::mem::take(&mut self.data),
            };
            self.state = DialogState::Greeted;
            tracing::debug!(from = %message.from, rcpts = message.to.len(), "smtp message received");
            return SmtpAction::Message("250 OK".into(), message);
        }
        // Dot-unstuffing per RFC 5321 §4.5.2.
        let line = if line.starts_with("..") { &line[1..] } else { line };
        if !self.data.is_empty() {
            self.data.push('\n');
        }
        self.data.push_str(line);
        SmtpAction::Continue
    }
}

fn split_verb(line: &str) -> (String, &str) {
    let trimmed = line.trim_start();
    match trimmed.find(' ') {
        Some(idx) => (
            trimmed[..idx].to_ascii_uppercase(),
            &trimmed[idx + 1..],
        ),
        None => (trimmed.trim_end().to_ascii_uppercase(), ""),
    }
}

/// Extract the address from `FROM:<a@b>` / `TO:<a@b>` (angle brackets
/// optional, keyword case-insensitive).
fn parse_path(rest: &str, keyword: &str) -> Option<String> {
    let rest = rest.trim();
    let lower = rest.to_ascii_lowercase();
    let prefix = format!("{}:", keyword.to_ascii_lowercase());
    if !lower.starts_with(&prefix) {
        return None;
    }
    let addr = rest[prefix.len()..]
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim();
    if addr.is_empty() {
        None
    } else {
        Some(addr.to_string())
    }
}
