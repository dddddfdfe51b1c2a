// src/parser.rs
use crate::buffer::Buffer;
use crate::http::{Method, Request, Version};
use memchr::memchr2;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes are needed; nothing parsed so far is lost.
    Incomplete,
    /// The request line or a header value is unusable.
    Malformed,
    /// A whole request, body included, is available through [`RequestParser::request`].
    Complete,
}

/// Incremental HTTP/1.x request parser driven over a connection's read buffer.
///
/// Lines are consumed from the buffer as they are parsed, so a request
/// arriving in arbitrary fragments is handled by calling `parse` again after
/// each read. The body is never consumed here: once complete it sits at the
/// front of the buffer until [`RequestParser::finish`].
#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    method: Method,
    target: String,
    version: Version,
    headers: HashMap<String, String>,
    content_length: usize,
    keep_alive: bool,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: Method::Get,
            target: String::new(),
            version: Version::Http11,
            headers: HashMap::new(),
            content_length: 0,
            keep_alive: false,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Only an explicit `Connection: keep-alive` keeps the connection open.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn parse(&mut self, buf: &mut Buffer) -> ParseStatus {
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some(end) = buf.find_crlf() else {
                        return ParseStatus::Incomplete;
                    };
                    let ok = self.parse_request_line(&buf.peek()[..end]);
                    buf.retrieve(end + 2);
                    if !ok {
                        return ParseStatus::Malformed;
                    }
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(end) = buf.find_crlf() else {
                        return ParseStatus::Incomplete;
                    };
                    if end == 0 {
                        buf.retrieve(2);
                        if self.content_length == 0 {
                            self.state = ParseState::Ready;
                            return ParseStatus::Complete;
                        }
                        self.state = ParseState::Body;
                        continue;
                    }
                    let ok = self.parse_header(&buf.peek()[..end]);
                    buf.retrieve(end + 2);
                    if !ok {
                        return ParseStatus::Malformed;
                    }
                }
                ParseState::Body => {
                    if buf.readable_bytes() < self.content_length {
                        return ParseStatus::Incomplete;
                    }
                    self.state = ParseState::Ready;
                    return ParseStatus::Complete;
                }
                ParseState::Ready => return ParseStatus::Complete,
            }
        }
    }

    /// `METHOD SP target SP version`, split on the first two spaces or tabs.
    fn parse_request_line(&mut self, line: &[u8]) -> bool {
        let Some(sp) = memchr2(b' ', b'\t', line) else {
            return false;
        };
        let Some(method) = Method::from_bytes(&line[..sp]) else {
            return false;
        };
        let rest = &line[sp + 1..];
        let Some(sp) = memchr2(b' ', b'\t', rest) else {
            return false;
        };
        let Some(version) = Version::from_bytes(&rest[sp + 1..]) else {
            return false;
        };

        let mut target = &rest[..sp];
        if target.len() >= 7 && target[..7].eq_ignore_ascii_case(b"http://") {
            target = &target[7..];
            match target.iter().position(|&b| b == b'/') {
                Some(slash) => target = &target[slash..],
                None => return false,
            }
        }
        if target.first() != Some(&b'/') {
            return false;
        }
        let Ok(target) = std::str::from_utf8(target) else {
            return false;
        };

        self.method = method;
        self.version = version;
        self.target = target.to_string();
        true
    }

    /// `Name: value`. Lines without a colon are ignored; an unparsable
    /// Content-Length is the only header that fails the request.
    fn parse_header(&mut self, line: &[u8]) -> bool {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return true;
        };
        let name = String::from_utf8_lossy(&line[..colon])
            .trim()
            .to_ascii_lowercase();
        let value = String::from_utf8_lossy(&line[colon + 1..])
            .trim_matches(|c| c == ' ' || c == '\t')
            .to_string();

        match name.as_str() {
            "connection" => self.keep_alive = value.eq_ignore_ascii_case("keep-alive"),
            "content-length" => match value.parse::<usize>() {
                Ok(n) => self.content_length = n,
                Err(_) => return false,
            },
            _ => {}
        }
        self.headers.insert(name, value);
        true
    }

    /// View of the completed request; `buf` must be the buffer passed to `parse`.
    pub fn request<'a>(&'a self, buf: &'a Buffer) -> Option<Request<'a>> {
        if self.state != ParseState::Ready {
            return None;
        }
        let (path, query) = match self.target.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (self.target.as_str(), None),
        };
        Some(Request {
            method: self.method,
            path,
            query,
            version: self.version,
            headers: &self.headers,
            body: &buf.peek()[..self.content_length],
            keep_alive: self.keep_alive,
        })
    }

    /// Consume the body of a completed request and get ready for the next one.
    pub fn finish(&mut self, buf: &mut Buffer) {
        if self.state == ParseState::Ready {
            buf.retrieve(self.content_length);
        }
        self.reset();
    }

    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.method = Method::Get;
        self.target.clear();
        self.version = Version::Http11;
        self.headers.clear();
        self.content_length = 0;
        self.keep_alive = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    const POST: &[u8] = b"POST /login HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\
Content-Type: application/x-www-form-urlencoded\r\nContent-Length: 20\r\n\r\n\
user=ann&password=pw";

    #[derive(Debug, PartialEq)]
    struct Parsed {
        method: Method,
        path: String,
        version: Version,
        keep_alive: bool,
        content_type: Option<String>,
        body: Vec<u8>,
    }

    fn snapshot(parser: &RequestParser, buf: &Buffer) -> Parsed {
        let req = parser.request(buf).unwrap();
        Parsed {
            method: req.method,
            path: req.path.to_string(),
            version: req.version,
            keep_alive: req.keep_alive,
            content_type: req.content_type().map(str::to_string),
            body: req.body.to_vec(),
        }
    }

    fn parse_whole(raw: &[u8]) -> (ParseStatus, RequestParser, Buffer) {
        let mut parser = RequestParser::new();
        let mut buf = Buffer::new();
        buf.append(raw);
        let status = parser.parse(&mut buf);
        (status, parser, buf)
    }

    #[test]
    fn get_without_body_completes() {
        let (status, parser, buf) =
            parse_whole(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(status, ParseStatus::Complete);
        let req = parser.request(&buf).unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/index.html");
        assert!(req.keep_alive);
        assert!(req.body.is_empty());
    }

    #[test]
    fn request_line_without_space_is_malformed() {
        let (status, _, _) = parse_whole(b"BADLINE\r\n\r\n");
        assert_eq!(status, ParseStatus::Malformed);
    }

    #[test]
    fn unsupported_method_and_version_are_malformed() {
        assert_eq!(parse_whole(b"PUT / HTTP/1.1\r\n\r\n").0, ParseStatus::Malformed);
        assert_eq!(parse_whole(b"GET / HTTP/2.0\r\n\r\n").0, ParseStatus::Malformed);
        assert_eq!(parse_whole(b"GET index HTTP/1.1\r\n\r\n").0, ParseStatus::Malformed);
        assert_eq!(
            parse_whole(b"GET / HTTP/1.1\r\nContent-Length: lots\r\n\r\n").0,
            ParseStatus::Malformed
        );
    }

    #[test]
    fn absolute_form_target_is_stripped() {
        let (status, parser, buf) = parse_whole(b"get http://10.0.0.1:80/a/b.html?x=1 http/1.0\r\n\r\n");
        assert_eq!(status, ParseStatus::Complete);
        let req = parser.request(&buf).unwrap();
        assert_eq!(req.path, "/a/b.html");
        assert_eq!(req.query, Some("x=1"));
        assert_eq!(req.version, Version::Http10);
        assert!(!req.keep_alive);
    }

    #[test]
    fn body_waits_for_declared_length() {
        let head = b"POST /upload HTTP/1.1\r\nContent-Length: 20\r\n\r\n";
        let mut parser = RequestParser::new();
        let mut buf = Buffer::new();

        buf.append(head);
        buf.append(b"0123456789");
        assert_eq!(parser.parse(&mut buf), ParseStatus::Incomplete);
        assert_eq!(parser.state(), ParseState::Body);

        buf.append(b"abcdefghij");
        assert_eq!(parser.parse(&mut buf), ParseStatus::Complete);
        assert_eq!(parser.request(&buf).unwrap().body, b"0123456789abcdefghij");
    }

    #[test]
    fn finish_keeps_pipelined_bytes() {
        let mut raw = POST.to_vec();
        raw.extend_from_slice(b"GET /next HTTP/1.1\r\n\r\n");
        let (status, mut parser, mut buf) = parse_whole(&raw);
        assert_eq!(status, ParseStatus::Complete);

        parser.finish(&mut buf);
        assert_eq!(parser.state(), ParseState::RequestLine);
        assert_eq!(parser.parse(&mut buf), ParseStatus::Complete);
        assert_eq!(parser.request(&buf).unwrap().path, "/next");
    }

    #[quickcheck]
    fn split_delivery_matches_single_delivery(cuts: Vec<u8>) -> bool {
        let (status, whole_parser, whole_buf) = parse_whole(POST);
        if status != ParseStatus::Complete {
            return false;
        }
        let expected = snapshot(&whole_parser, &whole_buf);

        let mut points: Vec<usize> = cuts.iter().map(|c| *c as usize % POST.len()).collect();
        points.push(POST.len());
        points.sort_unstable();
        points.dedup();

        let mut parser = RequestParser::new();
        let mut buf = Buffer::with_capacity(16);
        let mut from = 0;
        for to in points {
            if to <= from {
                continue;
            }
            buf.append(&POST[from..to]);
            from = to;
            match parser.parse(&mut buf) {
                ParseStatus::Complete => {
                    return to == POST.len() && snapshot(&parser, &buf) == expected;
                }
                ParseStatus::Incomplete => {}
                ParseStatus::Malformed => return false,
            }
        }
        false
    }
}
