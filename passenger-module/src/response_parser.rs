// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parses the response head sent by the core.
//!
//! The status line is parsed by a byte-driven state machine which can be resumed when more data
//! arrives. A response not starting with a valid status line is passed on as-is: status 200 and
//! everything received is body. Header lines are parsed once the status line is complete.

use http::{header, HeaderName, HeaderValue, StatusCode};
use log::{debug, error};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusState {
    Start,
    H,
    Ht,
    Htt,
    Http,
    FirstMajorDigit,
    MajorDigit,
    FirstMinorDigit,
    MinorDigit,
    Status,
    SpaceAfterStatus,
    StatusText,
    AlmostDone,
}

/// Errors making the response unusable
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParseError {
    /// A header line couldn’t be parsed
    InvalidHeader,
    /// The `Status` header doesn’t start with a status code
    InvalidStatus(String),
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidHeader => f.write_str("upstream sent invalid header"),
            Self::InvalidStatus(status) => write!(f, "upstream sent invalid status \"{status}\""),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parsed response head
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResponseHead {
    /// Response status
    pub(crate) status: u16,
    /// Status line without the protocol, e.g. `404 Not Found`
    pub(crate) status_line: String,
    /// Response headers in the order received, names as sent by the core
    pub(crate) headers: Vec<(String, HeaderValue)>,
    /// Whether the connection switches protocols
    pub(crate) upgrade: bool,
}

impl ResponseHead {
    fn new(status: u16, status_line: String) -> Self {
        Self {
            status,
            status_line,
            headers: Vec::new(),
            upgrade: false,
        }
    }

    /// Looks up the first header with the given name.
    pub(crate) fn get(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name.as_str()))
            .map(|(_, value)| value)
    }

    fn contains(&self, name: &HeaderName) -> bool {
        self.get(name).is_some()
    }
}

/// Outcome of feeding data into the parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParseStatus {
    /// More data is required
    Incomplete,
    /// The response head is complete, body starts at the given offset
    Complete(ResponseHead, usize),
}

/// Settings for completing the response head
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeadDefaults<'a> {
    /// Value of the `Server` header added if the core didn’t send one
    pub(crate) server: &'a str,
    /// Whether the client asked to upgrade the connection
    pub(crate) client_upgrade: bool,
}

/// Produces the `Server` header value for responses without one.
pub(crate) fn server_header(
    software: &str,
    version: &str,
    program: &str,
    program_version: &str,
    server_tokens: bool,
    show_version: bool,
) -> String {
    let mut result = if server_tokens {
        format!("{software}/{version} + {program}")
    } else {
        format!("{software} + {program}")
    };
    if show_version {
        result.push(' ');
        result.push_str(program_version);
    }
    result
}

/// Incremental parser for a response head
///
/// [`ResponseParser::parse`] is called with all data received so far, every call continues where
/// the previous one stopped.
#[derive(Debug)]
pub(crate) struct ResponseParser {
    state: StatusState,
    pos: usize,
    status: u16,
    status_count: u8,
    status_start: usize,
    status_end: Option<usize>,
    head: Option<ResponseHead>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub(crate) fn new() -> Self {
        Self {
            state: StatusState::Start,
            pos: 0,
            status: 0,
            status_count: 0,
            status_start: 0,
            status_end: None,
            head: None,
        }
    }

    /// Continues parsing `buf`, which has to start with the data passed in previous calls.
    pub(crate) fn parse(
        &mut self,
        buf: &[u8],
        defaults: &HeadDefaults<'_>,
    ) -> Result<ParseStatus, ParseError> {
        if self.head.is_none() {
            match self.parse_status_line(buf) {
                StatusLine::Incomplete => return Ok(ParseStatus::Incomplete),
                StatusLine::Invalid => {
                    error!("upstream sent no valid HTTP/1.0 header");
                    let head = ResponseHead::new(200, "200 OK".to_owned());
                    self.pos = 0;
                    return Ok(ParseStatus::Complete(head, 0));
                }
                StatusLine::Done => {
                    let end = self.status_end.unwrap_or(self.pos - 1);
                    let status_line =
                        String::from_utf8_lossy(&buf[self.status_start..end]).into_owned();
                    debug!("core response status {} \"{status_line}\"", self.status);
                    self.head = Some(ResponseHead::new(self.status, status_line));
                }
            }
        }

        loop {
            let rest = &buf[self.pos..];
            let Some(line_end) = rest.iter().position(|c| *c == b'\n') else {
                return Ok(ParseStatus::Incomplete);
            };
            let line = &rest[..line_end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            self.pos += line_end + 1;

            if line.is_empty() {
                let mut head = self.head.take().ok_or(ParseError::InvalidHeader)?;
                finish_head(&mut head, defaults)?;
                return Ok(ParseStatus::Complete(head, self.pos));
            }

            let (name, value) = parse_header_line(line).ok_or_else(|| {
                error!("{}", ParseError::InvalidHeader);
                ParseError::InvalidHeader
            })?;
            debug!("core response header: \"{name}: {value:?}\"");
            if let Some(head) = &mut self.head {
                head.headers.push((name, value));
            }
        }
    }

    fn parse_status_line(&mut self, buf: &[u8]) -> StatusLine {
        while self.pos < buf.len() {
            let pos = self.pos;
            let ch = buf[pos];
            self.pos += 1;

            self.state = match (self.state, ch) {
                (StatusState::Start, b'H') => StatusState::H,
                (StatusState::H, b'T') => StatusState::Ht,
                (StatusState::Ht, b'T') => StatusState::Htt,
                (StatusState::Htt, b'P') => StatusState::Http,
                (StatusState::Http, b'/') => StatusState::FirstMajorDigit,
                (StatusState::FirstMajorDigit, b'1'..=b'9') => StatusState::MajorDigit,
                (StatusState::MajorDigit, b'.') => StatusState::FirstMinorDigit,
                (StatusState::MajorDigit, b'0'..=b'9') => StatusState::MajorDigit,
                (StatusState::FirstMinorDigit, b'0'..=b'9') => StatusState::MinorDigit,
                (StatusState::MinorDigit, b' ') => StatusState::Status,
                (StatusState::MinorDigit, b'0'..=b'9') => StatusState::MinorDigit,
                (StatusState::Status, b' ') => StatusState::Status,
                (StatusState::Status, b'0'..=b'9') => {
                    self.status = self.status * 10 + u16::from(ch - b'0');
                    self.status_count += 1;
                    if self.status_count == 3 {
                        self.status_start = pos - 2;
                        StatusState::SpaceAfterStatus
                    } else {
                        StatusState::Status
                    }
                }
                // IIS may send 403.1, 403.2 etc.
                (StatusState::SpaceAfterStatus, b' ' | b'.') => StatusState::StatusText,
                (StatusState::SpaceAfterStatus | StatusState::StatusText, b'\r') => {
                    StatusState::AlmostDone
                }
                (StatusState::SpaceAfterStatus | StatusState::StatusText, b'\n') => {
                    return self.status_line_done(pos)
                }
                (StatusState::StatusText, _) => StatusState::StatusText,
                (StatusState::AlmostDone, b'\n') => {
                    self.status_end = Some(pos - 1);
                    return self.status_line_done(pos);
                }
                _ => return StatusLine::Invalid,
            };
        }
        StatusLine::Incomplete
    }

    fn status_line_done(&mut self, pos: usize) -> StatusLine {
        if self.status_end.is_none() {
            self.status_end = Some(pos);
        }
        self.state = StatusState::Start;
        StatusLine::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusLine {
    Incomplete,
    Invalid,
    Done,
}

fn trim_whitespace(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn parse_header_line(line: &[u8]) -> Option<(String, HeaderValue)> {
    let colon = line.iter().position(|c| *c == b':')?;
    let name = &line[..colon];
    HeaderName::from_bytes(name).ok()?;
    let value = trim_whitespace(&line[colon + 1..]);
    let value = HeaderValue::from_bytes(value).ok()?;
    Some((String::from_utf8(name.to_vec()).ok()?, value))
}

fn finish_head(head: &mut ResponseHead, defaults: &HeadDefaults<'_>) -> Result<(), ParseError> {
    if !head.contains(&header::SERVER) {
        let server = HeaderValue::from_str(defaults.server)
            .unwrap_or_else(|_| HeaderValue::from_static("Phusion Passenger"));
        head.headers.push(("Server".to_owned(), server));
    }
    if !head.contains(&header::DATE) {
        head.headers
            .push(("Date".to_owned(), HeaderValue::from_static("")));
    }

    if head.status == 0 {
        let status_header = HeaderName::from_static("status");
        if let Some(status) = head.get(&status_header) {
            let code = status
                .as_bytes()
                .get(..3)
                .and_then(|digits| std::str::from_utf8(digits).ok())
                .filter(|digits| digits.bytes().all(|c| c.is_ascii_digit()))
                .and_then(|digits| digits.parse::<u16>().ok());
            let Some(code) = code else {
                let err =
                    ParseError::InvalidStatus(String::from_utf8_lossy(status.as_bytes()).into());
                error!("{err}");
                return Err(err);
            };
            head.status_line = String::from_utf8_lossy(status.as_bytes()).into_owned();
            head.status = code;
        } else if head.contains(&header::LOCATION) {
            head.status = 302;
            head.status_line = "302 Moved Temporarily".to_owned();
        } else {
            head.status = 200;
            head.status_line = "200 OK".to_owned();
        }
    }

    head.upgrade =
        head.status == StatusCode::SWITCHING_PROTOCOLS.as_u16() && defaults.client_upgrade;
    Ok(())
}
