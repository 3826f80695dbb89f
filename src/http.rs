//! Incremental HTTP message engine for relayed sessions. One descriptor
//! per direction consumes bytes from its stream buffer and emits parse
//! events; header blocks are materialised as kv trees for the rule
//! engine and re-serialised with mutations applied. Body and chunk
//! framing is forwarded verbatim.

use thiserror::Error;

use crate::config::Direction;
use crate::kv::KvTree;

const MAX_LINE: usize = 8192;
const MAX_HEADERS: usize = 256;

#[derive(Debug, Error, PartialEq)]
pub enum HttpError {
    #[error("bad request line")]
    BadRequestLine,
    #[error("bad status line")]
    BadStatusLine,
    #[error("bad header line")]
    BadHeader,
    #[error("header line too long")]
    LineTooLong,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("bad content-length")]
    BadContentLength,
    #[error("bad chunk framing")]
    BadChunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    FirstLine,
    Headers,
    Body { remaining: u64 },
    BodyEof,
    ChunkHeader,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailers,
    Done,
}

/// Parse events, in stream order. `Heads` is the rule-evaluation point;
/// the caller serialises the (possibly rewritten) head before any
/// following `Data`.
#[derive(Debug, PartialEq)]
pub enum HttpOut {
    Heads,
    Data(Vec<u8>),
    Done,
}

#[derive(Debug)]
pub struct HttpDesc {
    pub dir: Direction,
    phase: Phase,
    header_count: usize,

    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub url: String,

    pub headers: KvTree,
    pub cookies: KvTree,
    pub query_kv: KvTree,
    cookies_dirty: bool,
    query_dirty: bool,

    pub keepalive: bool,
    /// Completed messages on this direction.
    pub messages: u64,
}

impl HttpDesc {
    pub fn new(dir: Direction) -> HttpDesc {
        HttpDesc {
            dir,
            phase: Phase::FirstLine,
            header_count: 0,
            method: String::new(),
            path: String::new(),
            query: None,
            version: String::new(),
            status: 0,
            reason: String::new(),
            url: String::new(),
            headers: KvTree::new(),
            cookies: KvTree::new(),
            query_kv: KvTree::new(),
            cookies_dirty: false,
            query_dirty: false,
            keepalive: false,
            messages: 0,
        }
    }

    fn reset(&mut self) {
        self.phase = Phase::FirstLine;
        self.header_count = 0;
        self.method.clear();
        self.path.clear();
        self.query = None;
        self.version.clear();
        self.status = 0;
        self.reason.clear();
        self.url.clear();
        self.headers.clear();
        self.cookies.clear();
        self.query_kv.clear();
        self.cookies_dirty = false;
        self.query_dirty = false;
    }

    /// True between end-of-headers and end-of-message.
    pub fn in_message(&self) -> bool {
        !matches!(self.phase, Phase::FirstLine | Phase::Headers)
    }

    /// Consume as much of `input` as possible, appending events. The
    /// parser pauses right after `Heads`; callers loop until no further
    /// events appear.
    pub fn parse(&mut self, input: &mut Vec<u8>, out: &mut Vec<HttpOut>) -> Result<(), HttpError> {
        loop {
            match self.phase {
                Phase::FirstLine => {
                    let Some(line) = take_line(input)? else { return Ok(()) };
                    if line.is_empty() {
                        // stray CRLF between pipelined messages
                        continue;
                    }
                    let text = String::from_utf8_lossy(&line).into_owned();
                    match self.dir {
                        Direction::Request => self.parse_request_line(&text)?,
                        Direction::Response => self.parse_status_line(&text)?,
                    }
                    self.phase = Phase::Headers;
                }
                Phase::Headers => {
                    let Some(line) = take_line(input)? else { return Ok(()) };
                    if line.is_empty() {
                        self.finalize_head()?;
                        out.push(HttpOut::Heads);
                        // pause so the caller can run rules and
                        // serialise the head before body data follows;
                        // the next parse call resumes
                        return Ok(());
                    }
                    self.header_count += 1;
                    if self.header_count > MAX_HEADERS {
                        return Err(HttpError::TooManyHeaders);
                    }
                    let text = String::from_utf8_lossy(&line).into_owned();
                    let (key, value) = text.split_once(':').ok_or(HttpError::BadHeader)?;
                    if key.is_empty() || key.ends_with(' ') || key.ends_with('\t') {
                        return Err(HttpError::BadHeader);
                    }
                    self.headers.insert(key, Some(value.trim()));
                }
                Phase::Body { remaining } => {
                    if input.is_empty() {
                        return Ok(());
                    }
                    let n = (input.len() as u64).min(remaining) as usize;
                    out.push(HttpOut::Data(input.drain(..n).collect()));
                    let remaining = remaining - n as u64;
                    if remaining == 0 {
                        self.finish(out);
                    } else {
                        self.phase = Phase::Body { remaining };
                    }
                }
                Phase::BodyEof => {
                    if input.is_empty() {
                        return Ok(());
                    }
                    out.push(HttpOut::Data(std::mem::take(input)));
                }
                Phase::ChunkHeader => {
                    let Some(line) = take_line(input)? else { return Ok(()) };
                    let text = String::from_utf8_lossy(&line).into_owned();
                    let size_part = text.split(';').next().unwrap_or("").trim();
                    let size =
                        u64::from_str_radix(size_part, 16).map_err(|_| HttpError::BadChunk)?;
                    out.push(HttpOut::Data(reframe(&line)));
                    self.phase = if size == 0 {
                        Phase::Trailers
                    } else {
                        Phase::ChunkData { remaining: size }
                    };
                }
                Phase::ChunkData { remaining } => {
                    if input.is_empty() {
                        return Ok(());
                    }
                    let n = (input.len() as u64).min(remaining) as usize;
                    out.push(HttpOut::Data(input.drain(..n).collect()));
                    let remaining = remaining - n as u64;
                    self.phase = if remaining == 0 {
                        Phase::ChunkEnd
                    } else {
                        Phase::ChunkData { remaining }
                    };
                }
                Phase::ChunkEnd => {
                    let Some(line) = take_line(input)? else { return Ok(()) };
                    if !line.is_empty() {
                        return Err(HttpError::BadChunk);
                    }
                    out.push(HttpOut::Data(b"\r\n".to_vec()));
                    self.phase = Phase::ChunkHeader;
                }
                Phase::Trailers => {
                    let Some(line) = take_line(input)? else { return Ok(()) };
                    out.push(HttpOut::Data(reframe(&line)));
                    if line.is_empty() {
                        self.finish(out);
                    }
                }
                Phase::Done => {
                    self.finish(out);
                }
            }
        }
    }

    /// Peer closed its side; an EOF-delimited body is now complete.
    pub fn stream_eof(&mut self, out: &mut Vec<HttpOut>) {
        if self.phase == Phase::BodyEof {
            self.finish(out);
        }
    }

    fn finish(&mut self, out: &mut Vec<HttpOut>) {
        out.push(HttpOut::Done);
        self.messages += 1;
        self.reset();
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), HttpError> {
        let mut parts = line.split_ascii_whitespace();
        let method = parts.next().ok_or(HttpError::BadRequestLine)?;
        let uri = parts.next().ok_or(HttpError::BadRequestLine)?;
        let version = parts.next().ok_or(HttpError::BadRequestLine)?;
        if parts.next().is_some() || !version.starts_with("HTTP/") {
            return Err(HttpError::BadRequestLine);
        }
        self.method = method.to_string();
        match uri.split_once('?') {
            Some((path, query)) => {
                self.path = path.to_string();
                self.query = Some(query.to_string());
            }
            None => {
                self.path = uri.to_string();
                self.query = None;
            }
        }
        self.version = version.to_string();
        Ok(())
    }

    fn parse_status_line(&mut self, line: &str) -> Result<(), HttpError> {
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().ok_or(HttpError::BadStatusLine)?;
        let code = parts.next().ok_or(HttpError::BadStatusLine)?;
        if !version.starts_with("HTTP/") {
            return Err(HttpError::BadStatusLine);
        }
        self.version = version.to_string();
        self.status = code.parse().map_err(|_| HttpError::BadStatusLine)?;
        self.reason = parts.next().unwrap_or("").to_string();
        Ok(())
    }

    fn finalize_head(&mut self) -> Result<(), HttpError> {
        // cookies
        match self.dir {
            Direction::Request => {
                if let Some((idx, _)) = self.headers.find("Cookie") {
                    let lines: Vec<String> = self
                        .headers
                        .values(idx)
                        .filter_map(|kv| kv.value.clone())
                        .collect();
                    for line in lines {
                        for pair in line.split(';') {
                            match pair.trim().split_once('=') {
                                Some((k, v)) => self.cookies.insert(k, Some(v)),
                                None if pair.trim().is_empty() => continue,
                                None => self.cookies.insert(pair.trim(), None),
                            };
                        }
                    }
                }
            }
            Direction::Response => {
                if let Some((idx, _)) = self.headers.find("Set-Cookie") {
                    let lines: Vec<String> = self
                        .headers
                        .values(idx)
                        .filter_map(|kv| kv.value.clone())
                        .collect();
                    for line in lines {
                        match line.split_once('=') {
                            Some((k, rest)) => self.cookies.insert(k.trim(), Some(rest)),
                            None => self.cookies.insert(line.trim(), None),
                        };
                    }
                }
            }
        }

        // query parameters
        if let Some(query) = self.query.clone() {
            for pair in query.split('&') {
                if pair.is_empty() {
                    continue;
                }
                match pair.split_once('=') {
                    Some((k, v)) => self.query_kv.insert(k, Some(v)),
                    None => self.query_kv.insert(pair, None),
                };
            }
        }

        // url = host + path
        if self.dir == Direction::Request {
            let host = self
                .headers
                .find("Host")
                .and_then(|(_, kv)| kv.value.clone())
                .unwrap_or_default();
            self.url = format!("{}{}", host.to_ascii_lowercase(), self.path);
        }

        // keep-alive
        let connection = self
            .headers
            .find("Connection")
            .and_then(|(_, kv)| kv.value.clone())
            .map(|v| v.to_ascii_lowercase());
        self.keepalive = match self.version.as_str() {
            "HTTP/1.1" => connection.as_deref() != Some("close"),
            _ => connection.as_deref() == Some("keep-alive"),
        };

        // body framing
        let chunked = self
            .headers
            .find("Transfer-Encoding")
            .and_then(|(_, kv)| kv.value.clone())
            .map_or(false, |v| v.to_ascii_lowercase().contains("chunked"));
        let content_length = match self.headers.find("Content-Length") {
            Some((idx, _)) => {
                let mut lens = self.headers.values(idx).filter_map(|kv| kv.value.clone());
                let first = lens.next().ok_or(HttpError::BadContentLength)?;
                if lens.next().is_some() {
                    return Err(HttpError::BadContentLength);
                }
                Some(
                    first
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| HttpError::BadContentLength)?,
                )
            }
            None => None,
        };

        self.phase = match self.dir {
            Direction::Request => {
                if chunked {
                    Phase::ChunkHeader
                } else {
                    match content_length {
                        Some(0) | None => Phase::Done,
                        Some(n) => Phase::Body { remaining: n },
                    }
                }
            }
            Direction::Response => {
                if self.status / 100 == 1 || self.status == 204 || self.status == 304 {
                    Phase::Done
                } else if chunked {
                    Phase::ChunkHeader
                } else {
                    match content_length {
                        Some(0) => Phase::Done,
                        Some(n) => Phase::Body { remaining: n },
                        None => Phase::BodyEof,
                    }
                }
            }
        };
        Ok(())
    }

    pub fn mark_cookies_dirty(&mut self) {
        self.cookies_dirty = true;
    }

    pub fn mark_query_dirty(&mut self) {
        self.query_dirty = true;
    }

    /// Serialise the head with all rule mutations applied, in arrival
    /// order with appended headers last.
    pub fn serialize_head(&mut self) -> Vec<u8> {
        if self.cookies_dirty {
            match self.dir {
                Direction::Request => {
                    let joined = self
                        .cookies
                        .iter()
                        .map(|kv| match &kv.value {
                            Some(v) => format!("{}={}", kv.key, v),
                            None => kv.key.clone(),
                        })
                        .collect::<Vec<_>>()
                        .join("; ");
                    if joined.is_empty() {
                        self.headers.remove("Cookie");
                    } else {
                        self.headers.set("Cookie", Some(&joined));
                    }
                }
                Direction::Response => {
                    self.headers.remove("Set-Cookie");
                    let lines: Vec<String> = self
                        .cookies
                        .iter()
                        .map(|kv| match &kv.value {
                            Some(v) => format!("{}={}", kv.key, v),
                            None => kv.key.clone(),
                        })
                        .collect();
                    for line in lines {
                        self.headers.insert("Set-Cookie", Some(&line));
                    }
                }
            }
            self.cookies_dirty = false;
        }
        if self.query_dirty {
            let joined = self
                .query_kv
                .iter()
                .map(|kv| match &kv.value {
                    Some(v) => format!("{}={}", kv.key, v),
                    None => kv.key.clone(),
                })
                .collect::<Vec<_>>()
                .join("&");
            self.query = if joined.is_empty() { None } else { Some(joined) };
            self.query_dirty = false;
        }

        let mut head = String::new();
        match self.dir {
            Direction::Request => {
                let uri = match &self.query {
                    Some(q) => format!("{}?{}", self.path, q),
                    None => self.path.clone(),
                };
                head.push_str(&format!("{} {} {}\r\n", self.method, uri, self.version));
            }
            Direction::Response => {
                head.push_str(&format!(
                    "{} {} {}\r\n",
                    self.version, self.status, self.reason
                ));
            }
        }
        for kv in self.headers.iter() {
            match &kv.value {
                Some(v) => head.push_str(&format!("{}: {}\r\n", kv.key, v)),
                None => head.push_str(&format!("{}:\r\n", kv.key)),
            }
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

/// Canned response for a relay with no usable backend.
pub fn canned_response(status: u16, reason: &str) -> Vec<u8> {
    let body = format!("<html><body><h1>{status} {reason}</h1></body></html>\n");
    format!(
        "HTTP/1.0 {status} {reason}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

fn reframe(line: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(line.len() + 2);
    buf.extend_from_slice(line);
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Remove one line (terminated by LF, optional preceding CR) from the
/// front of `input`. Ok(None) when no full line has arrived yet.
fn take_line(input: &mut Vec<u8>) -> Result<Option<Vec<u8>>, HttpError> {
    match input.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            let mut line: Vec<u8> = input.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            Ok(Some(line))
        }
        None if input.len() > MAX_LINE => Err(HttpError::LineTooLong),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(desc: &mut HttpDesc, bytes: &[u8]) -> Vec<HttpOut> {
        let mut input = bytes.to_vec();
        let mut out = Vec::new();
        loop {
            let before = out.len();
            desc.parse(&mut input, &mut out).unwrap();
            if out.len() == before {
                break;
            }
        }
        assert!(input.is_empty(), "parser left {} bytes", input.len());
        out
    }

    fn data_bytes(out: &[HttpOut]) -> Vec<u8> {
        out.iter()
            .filter_map(|e| match e {
                HttpOut::Data(d) => Some(d.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn parses_simple_get() {
        let mut desc = HttpDesc::new(Direction::Request);
        let out = feed(
            &mut desc,
            b"GET /index.html?a=1&b=2 HTTP/1.1\r\nHost: www.Example.com\r\nAccept: */*\r\n\r\n",
        );
        assert_eq!(out, vec![HttpOut::Heads, HttpOut::Done]);
        assert_eq!(desc.messages, 1);
    }

    #[test]
    fn builds_kv_state_at_headers() {
        let mut desc = HttpDesc::new(Direction::Request);
        let mut input =
            b"GET /x?a=1&flag HTTP/1.1\r\nHost: API.example.com\r\nCookie: sid=abc; theme=dark\r\nContent-Length: 4\r\n\r\nbody"
                .to_vec();
        let mut out = Vec::new();
        // stop after headers to inspect state before Done resets it
        let mut head_only = input.split_off(input.len() - 4);
        desc.parse(&mut input, &mut out).unwrap();
        assert_eq!(out, vec![HttpOut::Heads]);
        assert_eq!(desc.method, "GET");
        assert_eq!(desc.path, "/x");
        assert_eq!(desc.url, "api.example.com/x");
        assert_eq!(
            desc.query_kv.find("a").unwrap().1.value.as_deref(),
            Some("1")
        );
        assert!(desc.query_kv.find("flag").unwrap().1.value.is_none());
        assert_eq!(
            desc.cookies.find("sid").unwrap().1.value.as_deref(),
            Some("abc")
        );
        desc.parse(&mut head_only, &mut out).unwrap();
        assert_eq!(
            out[1..],
            vec![HttpOut::Data(b"body".to_vec()), HttpOut::Done]
        );
    }

    #[test]
    fn body_split_across_reads() {
        let mut desc = HttpDesc::new(Direction::Request);
        let wire = b"POST /up HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789";
        let mut total = Vec::new();
        for chunk in wire.chunks(3) {
            total.extend(data_bytes(&feed(&mut desc, chunk)));
        }
        assert_eq!(total, b"0123456789");
        assert_eq!(desc.messages, 1);
    }

    #[test]
    fn chunked_framing_forwarded_verbatim() {
        let mut desc = HttpDesc::new(Direction::Response);
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let body = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: done\r\n\r\n";
        let mut out = feed(&mut desc, head);
        out.extend(feed(&mut desc, body));
        assert_eq!(out[0], HttpOut::Heads);
        assert_eq!(*out.last().unwrap(), HttpOut::Done);
        assert_eq!(data_bytes(&out), body);
    }

    #[test]
    fn pipelined_requests() {
        let mut desc = HttpDesc::new(Direction::Request);
        let out = feed(
            &mut desc,
            b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n",
        );
        let dones = out.iter().filter(|e| **e == HttpOut::Done).count();
        assert_eq!(dones, 2);
        assert_eq!(desc.messages, 2);
    }

    #[test]
    fn response_without_length_ends_at_eof() {
        let mut desc = HttpDesc::new(Direction::Response);
        let out = feed(&mut desc, b"HTTP/1.0 200 OK\r\n\r\nstream until close");
        assert_eq!(out[0], HttpOut::Heads);
        assert_eq!(data_bytes(&out), b"stream until close");
        let mut rest = Vec::new();
        desc.stream_eof(&mut rest);
        assert_eq!(rest, vec![HttpOut::Done]);
    }

    #[test]
    fn no_body_statuses() {
        let mut desc = HttpDesc::new(Direction::Response);
        let out = feed(&mut desc, b"HTTP/1.1 304 Not Modified\r\nETag: x\r\n\r\n");
        assert_eq!(out, vec![HttpOut::Heads, HttpOut::Done]);
    }

    #[test]
    fn rejects_conflicting_content_length() {
        let mut desc = HttpDesc::new(Direction::Request);
        let mut input =
            b"GET / HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\n".to_vec();
        let mut out = Vec::new();
        assert_eq!(
            desc.parse(&mut input, &mut out),
            Err(HttpError::BadContentLength)
        );
    }

    #[test]
    fn serialize_preserves_header_order() {
        let mut desc = HttpDesc::new(Direction::Request);
        let mut input = b"GET /p?x=1 HTTP/1.1\r\nHost: a\r\nB: 1\r\nC: 2\r\n\r\n".to_vec();
        let mut out = Vec::new();
        desc.parse(&mut input, &mut out).unwrap();
        assert_eq!(out, vec![HttpOut::Heads]);
        // the parser pauses at the head, so mutations land before
        // anything reaches the wire
        desc.headers.insert("X-New", Some("v"));
        let text = String::from_utf8(desc.serialize_head()).unwrap();
        assert_eq!(
            text,
            "GET /p?x=1 HTTP/1.1\r\nHost: a\r\nB: 1\r\nC: 2\r\nX-New: v\r\n\r\n"
        );
    }

    #[test]
    fn cookie_rewrite_rebuilds_header() {
        let mut desc = HttpDesc::new(Direction::Request);
        feed(
            &mut desc,
            b"GET / HTTP/1.1\r\nHost: h\r\nCookie: sid=abc; theme=dark\r\nContent-Length: 1\r\n",
        );
        let mut input = b"\r\n".to_vec();
        let mut out = Vec::new();
        desc.parse(&mut input, &mut out).unwrap();
        assert_eq!(out, vec![HttpOut::Heads]);
        desc.cookies.remove("sid");
        desc.mark_cookies_dirty();
        let text = String::from_utf8(desc.serialize_head()).unwrap();
        assert!(text.contains("Cookie: theme=dark\r\n"));
        assert!(!text.contains("sid"));
    }
}
