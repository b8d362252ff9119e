//! HTTP/1.1 messages as the simulator sees them, plus the minimal wire
//! reader and writer shared by the listener, the origin transport and ESI.

use std::io::{Read, Write};

use crate::header::Header;

/// Headers larger than this are rejected before parsing.
const MAX_WIRE_HEAD: usize = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct Request {
    pub method: String,
    /// Path plus query, exactly as received.
    pub url: String,
    pub proto: String,
    pub header: Header,
    pub body: Vec<u8>,
    /// `ip:port` of the peer.
    pub remote_addr: String,
}

impl Request {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            proto: "HTTP/1.1".to_string(),
            header: Header::new(),
            body: Vec::new(),
            remote_addr: "127.0.0.1:0".to_string(),
        }
    }

    pub fn path(&self) -> &str {
        self.url.split(['?', '#']).next().unwrap_or("/")
    }

    pub fn query(&self) -> &str {
        self.url
            .split_once('?')
            .map(|(_, qs)| qs.split('#').next().unwrap_or(qs))
            .unwrap_or("")
    }

    pub fn host(&self) -> String {
        self.header.get("Host").strict()
    }

    /// Peer address without the port.
    pub fn remote_ip(&self) -> &str {
        match self.remote_addr.rsplit_once(':') {
            Some((ip, _)) => ip.trim_start_matches('[').trim_end_matches(']'),
            None => &self.remote_addr,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub proto: String,
    pub header: Header,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            proto: "HTTP/1.1".to_string(),
            header: Header::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        let mut resp = Response::new(status);
        resp.header
            .set("Content-Type", crate::value::Value::string(content_type));
        resp.body = body.into();
        resp
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        410 => "Gone",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

struct Head {
    start_line: String,
    header: Header,
    rest: Vec<u8>,
}

fn read_head(stream: &mut impl Read, what: &str) -> Result<Head, String> {
    let mut buffer = Vec::new();
    let mut temp = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        let read = stream
            .read(&mut temp)
            .map_err(|err| format!("failed to read {what}: {err}"))?;
        if read == 0 {
            return Err(format!("invalid HTTP {what}: missing headers"));
        }
        buffer.extend_from_slice(&temp[..read]);
        if buffer.len() > MAX_WIRE_HEAD {
            return Err(format!("{what} header too large"));
        }
    };
    let head_text = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head_text.split("\r\n");
    let start_line = lines.next().unwrap_or_default().to_string();
    let mut header = Header::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            header.append_raw(key.trim(), value.trim());
        }
    }
    Ok(Head {
        start_line,
        header,
        rest: buffer[header_end + 4..].to_vec(),
    })
}

fn read_body(
    stream: &mut impl Read,
    header: &Header,
    mut body: Vec<u8>,
    until_eof: bool,
) -> Result<Vec<u8>, String> {
    let mut temp = [0u8; 4096];
    let chunked = header
        .get_raw("Transfer-Encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
    if chunked {
        loop {
            if let Some(decoded) = decode_chunked(&body)? {
                return Ok(decoded);
            }
            let read = stream
                .read(&mut temp)
                .map_err(|err| format!("failed to read body: {err}"))?;
            if read == 0 {
                return Err("unexpected end of chunked body".to_string());
            }
            body.extend_from_slice(&temp[..read]);
        }
    }
    match header.get_raw("Content-Length").and_then(|v| v.trim().parse::<usize>().ok()) {
        Some(length) => {
            while body.len() < length {
                let read = stream
                    .read(&mut temp)
                    .map_err(|err| format!("failed to read body: {err}"))?;
                if read == 0 {
                    break;
                }
                body.extend_from_slice(&temp[..read]);
            }
            body.truncate(length);
        }
        None if until_eof => {
            stream
                .read_to_end(&mut body)
                .map_err(|err| format!("failed to read body: {err}"))?;
        }
        None => body.clear(),
    }
    Ok(body)
}

/// Decodes a complete chunked body; `None` while more bytes are needed.
fn decode_chunked(raw: &[u8]) -> Result<Option<Vec<u8>>, String> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let Some(line_end) = raw[pos..].windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let size_line = String::from_utf8_lossy(&raw[pos..pos + line_end]).to_string();
        let size_text = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| format!("invalid chunk size '{size_text}'"))?;
        pos += line_end + 2;
        if size == 0 {
            return Ok(Some(out));
        }
        if raw.len() < pos + size + 2 {
            return Ok(None);
        }
        out.extend_from_slice(&raw[pos..pos + size]);
        pos += size + 2;
    }
}

pub fn read_request(stream: &mut impl Read, remote_addr: &str) -> Result<Request, String> {
    let head = read_head(stream, "request")?;
    let mut parts = head.start_line.split_whitespace();
    let (Some(method), Some(url)) = (parts.next(), parts.next()) else {
        return Err("invalid HTTP request line".to_string());
    };
    let proto = parts.next().unwrap_or("HTTP/1.1").to_string();
    let body = read_body(stream, &head.header, head.rest, false)?;
    Ok(Request {
        method: method.to_string(),
        url: url.to_string(),
        proto,
        header: head.header,
        body,
        remote_addr: remote_addr.to_string(),
    })
}

pub fn read_response(stream: &mut impl Read, method: &str) -> Result<Response, String> {
    let head = read_head(stream, "response")?;
    let mut parts = head.start_line.splitn(3, ' ');
    let proto = parts.next().unwrap_or("HTTP/1.1").to_string();
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| format!("invalid HTTP status line '{}'", head.start_line))?;
    let reason = parts.next().unwrap_or_else(|| reason_phrase(status)).to_string();
    let body = if method.eq_ignore_ascii_case("HEAD") || status == 204 || status == 304 {
        Vec::new()
    } else {
        read_body(stream, &head.header, head.rest, true)?
    };
    Ok(Response {
        status,
        reason,
        proto,
        header: head.header,
        body,
    })
}

/// Writes a request for origin fetches. Body framing always uses
/// `Content-Length`, and the connection is closed after one exchange.
pub fn write_request(stream: &mut impl Write, req: &Request) -> Result<(), String> {
    let mut head = format!("{} {} HTTP/1.1\r\n", req.method, req.url);
    for (name, value) in req.header.to_pairs() {
        if is_framing_header(&name) {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if !req.body.is_empty() {
        head.push_str(&format!("Content-Length: {}\r\n", req.body.len()));
    }
    head.push_str("Connection: close\r\n\r\n");
    stream
        .write_all(head.as_bytes())
        .and_then(|_| stream.write_all(&req.body))
        .and_then(|_| stream.flush())
        .map_err(|err| format!("failed to write request: {err}"))
}

pub fn write_response(stream: &mut impl Write, resp: &Response) -> Result<(), String> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", resp.status, resp.reason);
    for (name, value) in resp.header.to_pairs() {
        if is_framing_header(&name) {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n", resp.body.len()));
    head.push_str("Connection: close\r\n\r\n");
    stream
        .write_all(head.as_bytes())
        .and_then(|_| stream.write_all(&resp.body))
        .and_then(|_| stream.flush())
        .map_err(|err| format!("failed to write response: {err}"))
}

fn is_framing_header(name: &str) -> bool {
    ["Content-Length", "Transfer-Encoding", "Connection"]
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{Request, read_request, read_response, write_response, Response};
    use crate::value::Value;

    #[test]
    fn parses_request_with_body() {
        let raw = b"POST /submit?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello";
        let req = read_request(&mut Cursor::new(raw.to_vec()), "192.0.2.10:5555").expect("request");
        assert_eq!(req.method, "POST");
        assert_eq!(req.path(), "/submit");
        assert_eq!(req.query(), "x=1");
        assert_eq!(req.host(), "example.com");
        assert_eq!(req.body, b"hello");
        assert_eq!(req.remote_ip(), "192.0.2.10");
    }

    #[test]
    fn decodes_chunked_responses() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n";
        let resp = read_response(&mut Cursor::new(raw.to_vec()), "GET").expect("response");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"abcde");
    }

    #[test]
    fn reads_until_eof_without_length() {
        let raw = b"HTTP/1.0 404 Not Found\r\nX-A: 1\r\n\r\nmissing";
        let resp = read_response(&mut Cursor::new(raw.to_vec()), "GET").expect("response");
        assert_eq!(resp.status, 404);
        assert_eq!(resp.reason, "Not Found");
        assert_eq!(resp.body, b"missing");
    }

    #[test]
    fn writes_length_framed_response() {
        let mut resp = Response::new(200);
        resp.header.set("X-Cache", Value::string("MISS"));
        resp.body = b"ok".to_vec();
        let mut out = Vec::new();
        write_response(&mut out, &resp).expect("write");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("X-Cache: MISS\r\n"));
        assert!(text.ends_with("Content-Length: 2\r\nConnection: close\r\n\r\nok"));
    }

    #[test]
    fn remote_ip_strips_ipv6_brackets() {
        let mut req = Request::new("GET", "/");
        req.remote_addr = "[::1]:8080".to_string();
        assert_eq!(req.remote_ip(), "::1");
    }
}
