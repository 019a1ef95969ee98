//! Incremental HTTP/1.1 request-line + header parser.
//!
//! Grounded on `original_source/main/request-parser.cc`'s `AddData`/
//! `ProcessLine`, adapted to spec: only `GET` is a recognised method (every
//! other verb — and anything unparsable — is `Method::Invalid`, since
//! non-GET requests are rejection-only, out of scope).

use std::collections::HashMap;
use std::fmt;

const LINE_END: &[u8] = b"\r\n";
const VERSION_PREFIX: &str = "HTTP/1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Invalid,
}

impl Default for Method {
    fn default() -> Self {
        Method::Invalid
    }
}

impl Method {
    fn parse(token: &str) -> Method {
        if token == "GET" {
            Method::Get
        } else {
            Method::Invalid
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Invalid => write!(f, "Invalid"),
        }
    }
}

/// The request as accumulated so far / once fully parsed.
///
/// Invariant: `method` is `Invalid` until the request line has been fully
/// parsed; once it is not `Invalid`, `target` and `version` are non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub target: String,
    pub version: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsingState {
    Pending,
    Ready,
    Invalid,
}

/// Incremental parser over a growable byte buffer. Feed it bytes as they
/// arrive over the wire; it consumes complete CRLF-terminated lines and
/// retains only the unconsumed tail across calls.
#[derive(Debug, Default)]
pub struct RequestParser {
    buf: Vec<u8>,
    current: HttpRequest,
    has_request_line: bool,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data`, then consumes as many complete lines as are
    /// available. Returns the resulting state; `Invalid` resets the parser.
    pub fn add_data(&mut self, data: &[u8]) -> ParsingState {
        self.buf.extend_from_slice(data);

        let mut state = ParsingState::Pending;
        let mut consumed = 0usize;

        loop {
            let Some(rel) = find_subsequence(&self.buf[consumed..], LINE_END) else {
                break;
            };
            let line_end = consumed + rel;
            let line = self.buf[consumed..line_end].to_vec();
            consumed = line_end + LINE_END.len();

            state = self.process_line(&line);
            if state == ParsingState::Invalid {
                self.reset();
                return ParsingState::Invalid;
            }
            if state != ParsingState::Pending {
                break;
            }
        }

        self.buf.drain(..consumed);
        state
    }

    /// Valid only after `add_data` returns `Ready`. Returns the parsed
    /// request and resets the parser so it is ready for the next request
    /// (supporting keep-alive pipelining).
    pub fn take_request(&mut self) -> HttpRequest {
        let request = std::mem::take(&mut self.current);
        self.has_request_line = false;
        request
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.current = HttpRequest::default();
        self.has_request_line = false;
    }

    fn process_line(&mut self, line: &[u8]) -> ParsingState {
        if line.is_empty() {
            return if self.has_request_line {
                ParsingState::Ready
            } else {
                ParsingState::Invalid
            };
        }

        if !self.has_request_line {
            return self.process_request_line(line);
        }

        self.process_header_line(line)
    }

    fn process_request_line(&mut self, line: &[u8]) -> ParsingState {
        let Ok(line) = std::str::from_utf8(line) else {
            return ParsingState::Invalid;
        };

        let parts: Vec<&str> = line.split(' ').filter(|t| !t.is_empty()).collect();
        if parts.len() != 3 {
            return ParsingState::Invalid;
        }

        let method = Method::parse(parts[0]);
        if method == Method::Invalid {
            return ParsingState::Invalid;
        }

        if !parts[1].starts_with('/') {
            return ParsingState::Invalid;
        }

        if !parts[2].starts_with(VERSION_PREFIX) {
            return ParsingState::Invalid;
        }

        self.current.method = method;
        self.current.target = parts[1].to_string();
        self.current.version = parts[2].to_string();
        self.has_request_line = true;

        ParsingState::Pending
    }

    fn process_header_line(&mut self, line: &[u8]) -> ParsingState {
        let Ok(line) = std::str::from_utf8(line) else {
            return ParsingState::Invalid;
        };

        let mut colon_idx = None;
        for (idx, c) in line.char_indices() {
            if !c.is_ascii_graphic() {
                return ParsingState::Invalid;
            }
            if c == ':' {
                colon_idx = Some(idx);
                break;
            }
        }

        let Some(colon_idx) = colon_idx else {
            return ParsingState::Invalid;
        };

        let name = line[..colon_idx].to_ascii_lowercase();
        let value = line[colon_idx + 1..].trim_start();

        self.current
            .headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());

        ParsingState::Pending
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_get_is_ready_with_header() {
        let mut parser = RequestParser::new();
        let state = parser.add_data(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(state, ParsingState::Ready);

        let req = parser.take_request();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target, "/index.html");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.headers.get("host").unwrap(), "localhost");
    }

    #[test]
    fn byte_by_byte_feed_still_parses() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut parser = RequestParser::new();
        let mut last_state = ParsingState::Pending;
        for byte in raw {
            last_state = parser.add_data(&[*byte]);
        }
        assert_eq!(last_state, ParsingState::Ready);
        let req = parser.take_request();
        assert_eq!(req.target, "/");
    }

    #[test]
    fn split_across_calls_matches_single_shot() {
        let mut parser_a = RequestParser::new();
        parser_a.add_data(b"GE");
        let state = parser_a.add_data(b"T / HTTP/1.1\r\n\r\n");
        assert_eq!(state, ParsingState::Ready);
        let req_a = parser_a.take_request();

        let mut parser_b = RequestParser::new();
        let state_b = parser_b.add_data(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(state_b, ParsingState::Ready);
        let req_b = parser_b.take_request();

        assert_eq!(req_a, req_b);
    }

    #[test]
    fn repeated_headers_are_joined_with_comma_space() {
        let mut parser = RequestParser::new();
        let raw = b"GET /foo.txt HTTP/1.1\r\nHost: x\r\nUser-Agent: a\r\nUser-Agent: b\r\n\r\n";
        let state = parser.add_data(raw);
        assert_eq!(state, ParsingState::Ready);
        let req = parser.take_request();
        assert_eq!(req.headers.get("user-agent").unwrap(), "a, b");
    }

    #[test]
    fn non_get_method_is_invalid() {
        let mut parser = RequestParser::new();
        let state = parser.add_data(b"POST / HTTP/1.1\r\n\r\n");
        assert_eq!(state, ParsingState::Invalid);
    }

    #[test]
    fn target_not_starting_with_slash_is_invalid() {
        let mut parser = RequestParser::new();
        let state = parser.add_data(b"GET http://x/ HTTP/1.1\r\n\r\n");
        assert_eq!(state, ParsingState::Invalid);
    }

    #[test]
    fn blank_line_without_request_line_is_invalid() {
        let mut parser = RequestParser::new();
        let state = parser.add_data(b"\r\n");
        assert_eq!(state, ParsingState::Invalid);
    }

    #[test]
    fn whitespace_before_colon_is_invalid() {
        let mut parser = RequestParser::new();
        let state = parser.add_data(b"GET / HTTP/1.1\r\nHost : x\r\n\r\n");
        assert_eq!(state, ParsingState::Invalid);
    }

    #[test]
    fn invalid_then_pending_never_spuriously_ready() {
        let mut parser = RequestParser::new();
        let state = parser.add_data(b"BOGUS REQUEST LINE HERE\r\n");
        assert_eq!(state, ParsingState::Invalid);
        // Parser resets; feeding a bare CRLF now must not yield a spurious Ready
        // (there is still no request line).
        let state2 = parser.add_data(b"\r\n");
        assert_eq!(state2, ParsingState::Invalid);
    }

    #[test]
    fn partial_final_line_is_retained_across_calls() {
        let mut parser = RequestParser::new();
        let state = parser.add_data(b"GET / HTTP/1.1\r\nHost: partial");
        assert_eq!(state, ParsingState::Pending);
        let state2 = parser.add_data(b"-value\r\n\r\n");
        assert_eq!(state2, ParsingState::Ready);
        let req = parser.take_request();
        assert_eq!(req.headers.get("host").unwrap(), "partial-value");
    }
}
