//! HTTP/1.1 request parsing and response serialization.
//!
//! The parser reads one request at a time from a buffered socket stream.
//! Body handling follows `Content-Length` or `Transfer-Encoding: chunked`,
//! and the `Content-Type` header drives automatic decoding into the typed
//! [`Body`] fields.

use crate::error::{Error, Result};
use http::Method;
use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::{BufRead, Read, Write};

/// Upper bound on a single request-line or header line.
const MAX_LINE_LEN: usize = 8 * 1024;
/// Upper bound on the number of request headers.
const MAX_HEADERS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

/// A request body, raw plus whatever the content type decoded it into.
#[derive(Debug, Clone, Default)]
pub struct Body {
    pub raw: Vec<u8>,
    /// `application/json` or `application/xml` document.
    pub json: Option<Value>,
    /// `application/x-www-form-urlencoded` or multipart text fields.
    pub form: HashMap<String, String>,
    /// `multipart/form-data` file parts.
    pub files: Vec<MultipartFile>,
}

impl Body {
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.raw).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MultipartFile {
    pub name: String,
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A parsed HTTP/1.1 request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Percent-decoded path, query stripped.
    pub path: String,
    /// The request target exactly as received.
    pub raw_target: String,
    pub version: HttpVersion,
    pub query: HashMap<String, String>,
    /// Header names are lowercased; last value wins.
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub body: Body,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// Keep-alive is on for HTTP/1.1 unless the client said `close`, and for
    /// HTTP/1.0 only when the client asked for it.
    pub fn keep_alive(&self) -> bool {
        let conn = self.header("connection").unwrap_or("");
        match self.version {
            HttpVersion::Http11 => !conn.eq_ignore_ascii_case("close"),
            HttpVersion::Http10 => conn.eq_ignore_ascii_case("keep-alive"),
        }
    }

    /// When this is a WebSocket upgrade request, the client's key.
    ///
    /// Requires `Upgrade: websocket`, a `Connection` header listing
    /// `Upgrade`, and a `Sec-WebSocket-Key` that decodes to 16 bytes.
    pub fn websocket_key(&self) -> Option<&str> {
        let upgrade = self.header("upgrade")?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return None;
        }
        let conn = self.header("connection")?;
        if !conn
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        {
            return None;
        }
        let key = self.header("sec-websocket-key")?;
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        match STANDARD.decode(key.trim()) {
            Ok(bytes) if bytes.len() == 16 => Some(key),
            _ => None,
        }
    }
}

fn read_line_limited<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed",
        )));
    }
    if line.len() > MAX_LINE_LEN {
        return Err(Error::LimitExceeded("header line too long".into()));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// Read and parse one request from the stream.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before
/// sending a request line (the idle half of a keep-alive loop).
pub fn parse_request<R: BufRead>(reader: &mut R, max_body_size: u64) -> Result<Option<HttpRequest>> {
    let request_line = match read_line_limited(reader) {
        Ok(line) => line,
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if request_line.is_empty() {
        return Err(Error::protocol("empty request line"));
    }

    let mut parts = request_line.split_whitespace();
    let method: Method = parts
        .next()
        .ok_or_else(|| Error::protocol("missing method"))?
        .parse()
        .map_err(|_| Error::protocol("invalid method"))?;
    let raw_target = parts
        .next()
        .ok_or_else(|| Error::protocol("missing request target"))?
        .to_string();
    let version = match parts.next() {
        Some("HTTP/1.1") => HttpVersion::Http11,
        Some("HTTP/1.0") => HttpVersion::Http10,
        Some(other) => return Err(Error::protocol(format!("unsupported version {other}"))),
        None => return Err(Error::protocol("missing HTTP version")),
    };

    let mut headers = HashMap::new();
    loop {
        let line = read_line_limited(reader)?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(Error::LimitExceeded("too many headers".into()));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::protocol(format!("malformed header: {line}")))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    let raw_body = read_body(reader, &headers, max_body_size)?;

    let (path, query) = split_target(&raw_target);
    let cookies = parse_cookies(&headers);
    let content_type = headers
        .get("content-type")
        .map(String::as_str)
        .unwrap_or("");
    let body = decode_body(raw_body, content_type);

    Ok(Some(HttpRequest {
        method,
        path,
        raw_target,
        version,
        query,
        headers,
        cookies,
        body,
    }))
}

fn read_body<R: BufRead>(
    reader: &mut R,
    headers: &HashMap<String, String>,
    max_body_size: u64,
) -> Result<Vec<u8>> {
    if headers
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        return read_chunked_body(reader, max_body_size);
    }

    let length: u64 = match headers.get("content-length") {
        None => return Ok(Vec::new()),
        Some(v) => v
            .parse()
            .map_err(|_| Error::protocol("invalid Content-Length"))?,
    };
    if length > max_body_size {
        return Err(Error::LimitExceeded(format!(
            "body of {length} bytes exceeds the {max_body_size} byte limit"
        )));
    }
    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body).map_err(Error::Io)?;
    Ok(body)
}

fn read_chunked_body<R: BufRead>(reader: &mut R, max_body_size: u64) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line_limited(reader)?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| Error::protocol(format!("invalid chunk size: {size_str}")))?;
        if size == 0 {
            // Consume optional trailers up to the final blank line.
            loop {
                if read_line_limited(reader)?.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }
        if (body.len() + size) as u64 > max_body_size {
            return Err(Error::LimitExceeded(format!(
                "chunked body exceeds the {max_body_size} byte limit"
            )));
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).map_err(Error::Io)?;
        let crlf = read_line_limited(reader)?;
        if !crlf.is_empty() {
            return Err(Error::protocol("missing CRLF after chunk"));
        }
    }
}

fn split_target(raw: &str) -> (String, HashMap<String, String>) {
    let (path_part, query_part) = match raw.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (raw, None),
    };
    let path = percent_decode_str(path_part)
        .decode_utf8_lossy()
        .into_owned();
    let query = query_part
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();
    (path, query)
}

pub fn parse_cookies(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .get("cookie")
        .map(|c| {
            c.split(';')
                .filter_map(|pair| {
                    let mut parts = pair.trim().splitn(2, '=');
                    let name = parts.next()?.trim().to_string();
                    let value = parts.next().unwrap_or("").trim().to_string();
                    Some((name, value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn decode_body(raw: Vec<u8>, content_type: &str) -> Body {
    let mut body = Body {
        raw,
        ..Body::default()
    };
    if body.raw.is_empty() {
        return body;
    }
    let (mime, params) = match content_type.split_once(';') {
        Some((m, p)) => (m.trim(), p.trim()),
        None => (content_type.trim(), ""),
    };
    match mime {
        "application/json" => {
            body.json = serde_json::from_slice(&body.raw).ok();
        }
        "application/xml" | "text/xml" => {
            if let Ok(text) = std::str::from_utf8(&body.raw) {
                body.json = xml_to_value(text).ok();
            }
        }
        "application/x-www-form-urlencoded" => {
            body.form = url::form_urlencoded::parse(&body.raw)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
        }
        "multipart/form-data" => {
            if let Some(boundary) = params
                .split(';')
                .filter_map(|p| p.trim().strip_prefix("boundary="))
                .next()
            {
                let boundary = boundary.trim_matches('"').to_string();
                let raw = std::mem::take(&mut body.raw);
                let (form, files) = parse_multipart(&raw, &boundary);
                body.raw = raw;
                body.form = form;
                body.files = files;
            }
        }
        _ => {}
    }
    body
}

/// Decode an XML document into a JSON value: elements become objects keyed
/// by child name (repeated children become arrays), attributes are kept
/// under `@name` keys, and text content under `#text`.
pub fn xml_to_value(text: &str) -> Result<Value> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    fn insert(map: &mut Map<String, Value>, key: String, value: Value) {
        match map.get_mut(&key) {
            None => {
                map.insert(key, value);
            }
            Some(Value::Array(arr)) => arr.push(value),
            Some(existing) => {
                let prior = existing.take();
                *existing = Value::Array(vec![prior, value]);
            }
        }
    }

    let mut reader = Reader::from_str(text);
    let mut buf = Vec::new();
    // Stack of (element name, accumulated children).
    let mut stack: Vec<(String, Map<String, Value>)> = vec![(String::new(), Map::new())];

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let mut map = Map::new();
                for attr in e.attributes().flatten() {
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    map.insert(key, Value::String(String::from_utf8_lossy(&attr.value).into_owned()));
                }
                stack.push((name, map));
            }
            Ok(Event::Empty(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let mut map = Map::new();
                for attr in e.attributes().flatten() {
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    map.insert(key, Value::String(String::from_utf8_lossy(&attr.value).into_owned()));
                }
                if let Some((_, parent)) = stack.last_mut() {
                    insert(parent, name, collapse_element(map));
                }
            }
            Ok(Event::End(_)) => {
                let (name, map) = match stack.pop() {
                    Some(frame) => frame,
                    None => return Err(Error::protocol("unbalanced XML")),
                };
                let value = collapse_element(map);
                match stack.last_mut() {
                    Some((_, parent)) => insert(parent, name, value),
                    None => return Err(Error::protocol("unbalanced XML")),
                }
            }
            Ok(Event::Text(ref t)) => {
                let text = t.unescape().map_err(|e| Error::protocol(e.to_string()))?;
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if let Some((_, map)) = stack.last_mut() {
                        insert(map, "#text".to_string(), Value::String(trimmed.to_string()));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::protocol(format!("invalid XML: {e}"))),
        }
        buf.clear();
    }

    let (_, root) = stack
        .pop()
        .ok_or_else(|| Error::protocol("unbalanced XML"))?;
    Ok(Value::Object(root))
}

fn collapse_element(map: Map<String, Value>) -> Value {
    // An element with only text collapses to the string itself.
    if map.len() == 1 {
        if let Some(Value::String(s)) = map.get("#text") {
            return Value::String(s.clone());
        }
    }
    Value::Object(map)
}

fn parse_multipart(raw: &[u8], boundary: &str) -> (HashMap<String, String>, Vec<MultipartFile>) {
    let mut form = HashMap::new();
    let mut files = Vec::new();
    let delim = format!("--{boundary}");

    for part in split_bytes(raw, delim.as_bytes()) {
        let part = trim_crlf(part);
        if part.is_empty() || part == b"--" {
            continue;
        }
        let Some(header_end) = find_bytes(part, b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&part[..header_end]);
        let data = trim_crlf(&part[header_end + 4..]).to_vec();

        let mut name = String::new();
        let mut filename = None;
        let mut content_type = "text/plain".to_string();
        for line in headers.lines() {
            let lower = line.to_ascii_lowercase();
            if lower.starts_with("content-disposition:") {
                for attr in line.split(';').skip(1) {
                    let attr = attr.trim();
                    if let Some(v) = attr.strip_prefix("name=") {
                        name = v.trim_matches('"').to_string();
                    } else if let Some(v) = attr.strip_prefix("filename=") {
                        filename = Some(v.trim_matches('"').to_string());
                    }
                }
            } else if let Some(v) = lower.strip_prefix("content-type:") {
                content_type = v.trim().to_string();
            }
        }

        match filename {
            Some(filename) => files.push(MultipartFile {
                name,
                filename,
                content_type,
                data,
            }),
            None => {
                form.insert(name, String::from_utf8_lossy(&data).into_owned());
            }
        }
    }
    (form, files)
}

fn split_bytes<'a>(haystack: &'a [u8], delim: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut start = 0;
    while let Some(idx) = find_bytes(&haystack[start..], delim) {
        parts.push(&haystack[start..start + idx]);
        start += idx + delim.len();
    }
    parts.push(&haystack[start..]);
    parts
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn trim_crlf(mut bytes: &[u8]) -> &[u8] {
    while bytes.first() == Some(&b'\r') || bytes.first() == Some(&b'\n') {
        bytes = &bytes[1..];
    }
    while bytes.last() == Some(&b'\r') || bytes.last() == Some(&b'\n') {
        bytes = &bytes[..bytes.len() - 1];
    }
    bytes
}

pub fn status_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Response builder, serialized with [`HttpResponse::write_to`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    headers: Vec<(String, String)>,
    cookies: Vec<String>,
    pub body: Vec<u8>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            cookies: Vec::new(),
            body: Vec::new(),
        }
    }
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self
    }

    /// Append a header. Repeated names produce repeated header lines.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a header, replacing any existing values of the same name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Queue a `Set-Cookie` line.
    pub fn cookie(&mut self, value: impl Into<String>) -> &mut Self {
        self.cookies.push(value.into());
        self
    }

    pub fn text(&mut self, body: impl Into<String>) -> &mut Self {
        let body = body.into();
        self.set_header("Content-Type", "text/plain");
        self.body = body.into_bytes();
        self
    }

    pub fn html(&mut self, body: impl Into<String>) -> &mut Self {
        let body = body.into();
        self.set_header("Content-Type", "text/html");
        self.body = body.into_bytes();
        self
    }

    pub fn json(&mut self, value: &Value) -> &mut Self {
        self.set_header("Content-Type", "application/json");
        self.body = serde_json::to_vec(value).unwrap_or_default();
        self
    }

    pub fn bytes(&mut self, content_type: &str, body: Vec<u8>) -> &mut Self {
        self.set_header("Content-Type", content_type);
        self.body = body;
        self
    }

    /// Serialize status line, headers, cookies and body to the wire.
    pub fn write_to<W: Write>(&self, w: &mut W, keep_alive: bool) -> std::io::Result<()> {
        write!(
            w,
            "HTTP/1.1 {} {}\r\n",
            self.status,
            status_reason(self.status)
        )?;
        write!(w, "Server: Pode\r\n")?;
        for (name, value) in &self.headers {
            write!(w, "{name}: {value}\r\n")?;
        }
        for cookie in &self.cookies {
            write!(w, "Set-Cookie: {cookie}\r\n")?;
        }
        if !self.has_header("content-length") {
            write!(w, "Content-Length: {}\r\n", self.body.len())?;
        }
        write!(
            w,
            "Connection: {}\r\n",
            if keep_alive { "keep-alive" } else { "close" }
        )?;
        write!(w, "\r\n")?;
        w.write_all(&self.body)?;
        w.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn parse(raw: &str) -> HttpRequest {
        let mut reader = BufReader::new(raw.as_bytes());
        parse_request(&mut reader, 1024 * 1024).unwrap().unwrap()
    }

    #[test]
    fn parses_request_line_and_headers() {
        let req = parse("GET /pets?limit=5 HTTP/1.1\r\nHost: localhost\r\nX-Test: a\r\n\r\n");
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.path, "/pets");
        assert_eq!(req.query.get("limit"), Some(&"5".to_string()));
        assert_eq!(req.header("host"), Some("localhost"));
        assert_eq!(req.header("x-test"), Some("a"));
        assert_eq!(req.version, HttpVersion::Http11);
    }

    #[test]
    fn percent_decodes_path() {
        let req = parse("GET /items/a%20b HTTP/1.1\r\n\r\n");
        assert_eq!(req.path, "/items/a b");
    }

    #[test]
    fn content_length_body_as_json() {
        let body = r#"{"name":"Max"}"#;
        let raw = format!(
            "POST /pets HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let req = parse(&raw);
        assert_eq!(req.body.json.as_ref().unwrap()["name"], "Max");
    }

    #[test]
    fn chunked_body() {
        let raw =
            "POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let req = parse(raw);
        assert_eq!(req.body.text(), Some("hello world"));
    }

    #[test]
    fn body_over_limit_rejected() {
        let raw = "POST /x HTTP/1.1\r\nContent-Length: 2048\r\n\r\n";
        let mut reader = BufReader::new(raw.as_bytes());
        let err = parse_request(&mut reader, 16).unwrap_err();
        assert!(matches!(err, Error::LimitExceeded(_)));
    }

    #[test]
    fn form_urlencoded_body() {
        let body = "username=morty&password=pickle";
        let raw = format!(
            "POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let req = parse(&raw);
        assert_eq!(req.body.form.get("username"), Some(&"morty".to_string()));
        assert_eq!(req.body.form.get("password"), Some(&"pickle".to_string()));
    }

    #[test]
    fn multipart_body() {
        let boundary = "XBOUND";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhello\r\n--{b}\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\nContent-Type: text/plain\r\n\r\nfile-bytes\r\n--{b}--\r\n",
            b = boundary
        );
        let raw = format!(
            "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary={}\r\nContent-Length: {}\r\n\r\n{}",
            boundary,
            body.len(),
            body
        );
        let req = parse(&raw);
        assert_eq!(req.body.form.get("title"), Some(&"hello".to_string()));
        assert_eq!(req.body.files.len(), 1);
        assert_eq!(req.body.files[0].filename, "a.txt");
        assert_eq!(req.body.files[0].data, b"file-bytes");
    }

    #[test]
    fn xml_body_decodes_to_json() {
        let body = r#"<pet id="1"><name>Max</name><tag>a</tag><tag>b</tag></pet>"#;
        let raw = format!(
            "POST /pets HTTP/1.1\r\nContent-Type: application/xml\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let req = parse(&raw);
        let json = req.body.json.unwrap();
        assert_eq!(json["pet"]["@id"], "1");
        assert_eq!(json["pet"]["name"], "Max");
        assert_eq!(json["pet"]["tag"][0], "a");
        assert_eq!(json["pet"]["tag"][1], "b");
    }

    #[test]
    fn cookie_header_parsed() {
        let req = parse("GET / HTTP/1.1\r\nCookie: a=1; pode.sid=xyz\r\n\r\n");
        assert_eq!(req.cookies.get("a"), Some(&"1".to_string()));
        assert_eq!(req.cookies.get("pode.sid"), Some(&"xyz".to_string()));
    }

    #[test]
    fn keep_alive_rules() {
        assert!(parse("GET / HTTP/1.1\r\n\r\n").keep_alive());
        assert!(!parse("GET / HTTP/1.1\r\nConnection: close\r\n\r\n").keep_alive());
        assert!(!parse("GET / HTTP/1.0\r\n\r\n").keep_alive());
        assert!(parse("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").keep_alive());
    }

    #[test]
    fn websocket_upgrade_detection() {
        let req = parse(
            "GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        );
        assert_eq!(req.websocket_key(), Some("dGhlIHNhbXBsZSBub25jZQ=="));

        let bad = parse("GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: short\r\n\r\n");
        assert!(bad.websocket_key().is_none());
    }

    #[test]
    fn eof_before_request_is_none() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(parse_request(&mut reader, 1024).unwrap().is_none());
    }

    #[test]
    fn response_serialization() {
        let mut res = HttpResponse::new();
        res.status(404)
            .json(&serde_json::json!({"error": "Not Found"}))
            .cookie("pode.sid=abc; Path=/; HttpOnly");
        let mut out = Vec::new();
        res.write_to(&mut out, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Server: Pode\r\n"));
        assert!(text.contains("Set-Cookie: pode.sid=abc; Path=/; HttpOnly\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("{\"error\":\"Not Found\"}"));
    }
}
