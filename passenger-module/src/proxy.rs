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

//! Passes a classified request to the core and delivers the core's response to the client.
//!
//! The request body is read completely before the core is contacted, so that the request can be
//! sent again if the first attempt fails. The response is streamed by default. With response
//! buffering enabled it is collected in memory first, spilling over into a temporary file.

use bytes::{Bytes, BytesMut};
use http::{header, HeaderName, HeaderValue, Method, StatusCode};
use log::{debug, error, info, warn};
use passenger_module_utils::pingora::{Error, ErrorType, ResponseHeader, SessionWrapper};
use passenger_module_utils::standard_response::error_response;
use std::fmt::{Display, Formatter};
use std::io::{self, SeekFrom};
use std::time::{Duration, Instant, SystemTime};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::classifier::ProxyTarget;
use crate::configuration::NextUpstream;
use crate::core_context::CoreEndpoint;
use crate::location::{Location, ProxySettings};
use crate::request_builder::RequestHead;
use crate::response_parser::{HeadDefaults, ParseStatus, ResponseHead, ResponseParser};

/// There is only one core, so a failed request is attempted once more at most.
const MAX_TRIES: u32 = 2;

/// Hop-by-hop headers of the core connection, never passed on
const CONNECTION_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding"];

/// Data collected in memory up to a limit, then in an anonymous temporary file
#[derive(Debug)]
pub(crate) struct SpillBuffer {
    memory: Vec<Bytes>,
    memory_len: usize,
    memory_limit: usize,
    file: Option<File>,
    file_len: u64,
    file_limit: u64,
}

impl SpillBuffer {
    /// Creates an empty buffer. A `file_limit` of zero disables the temporary file.
    pub(crate) fn new(memory_limit: usize, file_limit: u64) -> Self {
        Self {
            memory: Vec::new(),
            memory_len: 0,
            memory_limit,
            file: None,
            file_len: 0,
            file_limit,
        }
    }

    /// Total number of bytes stored
    pub(crate) fn len(&self) -> u64 {
        self.memory_len as u64 + self.file_len
    }

    /// Checks whether part of the data went into the temporary file.
    pub(crate) fn spilled(&self) -> bool {
        self.file.is_some()
    }

    /// Stores a chunk of data. Returns `false` without storing anything if the chunk would exceed
    /// the limits.
    pub(crate) async fn push(&mut self, data: Bytes) -> io::Result<bool> {
        if self.file.is_none() && self.memory_len + data.len() <= self.memory_limit {
            self.memory_len += data.len();
            self.memory.push(data);
            return Ok(true);
        }

        if self.file_len + data.len() as u64 > self.file_limit {
            return Ok(false);
        }

        let file = match &mut self.file {
            Some(file) => file,
            None => {
                debug!(
                    "buffered data exceeds {} bytes, using a temporary file",
                    self.memory_limit
                );
                self.file.insert(File::from_std(tempfile::tempfile()?))
            }
        };
        file.write_all(&data).await?;
        self.file_len += data.len() as u64;
        Ok(true)
    }

    /// Starts reading the stored data from the beginning. This can be repeated.
    pub(crate) async fn reader(&mut self) -> io::Result<SpillReader<'_>> {
        if let Some(file) = &mut self.file {
            file.flush().await?;
            file.seek(SeekFrom::Start(0)).await?;
        }
        Ok(SpillReader {
            memory: self.memory.iter(),
            file: self.file.as_mut(),
            remaining: self.file_len,
        })
    }
}

/// Reads the contents of a [`SpillBuffer`] chunk by chunk
#[derive(Debug)]
pub(crate) struct SpillReader<'a> {
    memory: std::slice::Iter<'a, Bytes>,
    file: Option<&'a mut File>,
    remaining: u64,
}

impl SpillReader<'_> {
    /// Produces the next chunk, file data is read in chunks of up to `chunk_size` bytes.
    pub(crate) async fn next_chunk(&mut self, chunk_size: usize) -> io::Result<Option<Bytes>> {
        if let Some(chunk) = self.memory.next() {
            return Ok(Some(chunk.clone()));
        }

        let Some(file) = &mut self.file else {
            return Ok(None);
        };
        if self.remaining == 0 {
            return Ok(None);
        }

        let size = usize::try_from(self.remaining)
            .unwrap_or(usize::MAX)
            .min(chunk_size.max(1));
        let mut buf = BytesMut::zeroed(size);
        file.read_exact(&mut buf).await?;
        self.remaining -= size as u64;
        Ok(Some(buf.freeze()))
    }
}

/// Reasons for an attempt to get a response head from the core to fail
#[derive(Debug)]
enum UpstreamError {
    Connect(String),
    ConnectTimeout,
    Error(String),
    Timeout(&'static str),
    InvalidHeader(String),
}

impl UpstreamError {
    fn condition(&self) -> NextUpstream {
        match self {
            Self::Connect(_) | Self::Error(_) => NextUpstream::Error,
            Self::ConnectTimeout | Self::Timeout(_) => NextUpstream::Timeout,
            Self::InvalidHeader(_) => NextUpstream::InvalidHeader,
        }
    }

    /// Status code of the error page sent if this error isn't retried
    fn status(&self) -> StatusCode {
        match self {
            Self::ConnectTimeout | Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Checks whether the core might have received the request already.
    fn request_sent(&self) -> bool {
        !matches!(self, Self::Connect(_) | Self::ConnectTimeout)
    }
}

impl Display for UpstreamError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(message) | Self::Error(message) | Self::InvalidHeader(message) => {
                f.write_str(message)
            }
            Self::ConnectTimeout => f.write_str("upstream timed out while connecting to upstream"),
            Self::Timeout(phase) => write!(f, "upstream timed out while {phase}"),
        }
    }
}

/// A core connection with the response head already received
#[derive(Debug)]
struct CoreResponse {
    stream: UnixStream,
    head: ResponseHead,
    /// Body data received along with the head
    body: Bytes,
}

async fn send(stream: &mut UnixStream, data: &[u8], limit: Duration) -> Result<(), UpstreamError> {
    match timeout(limit, stream.write_all(data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(UpstreamError::Error(format!(
            "writev() failed ({err}) while sending request to upstream"
        ))),
        Err(_) => Err(UpstreamError::Timeout("sending request to upstream")),
    }
}

async fn attempt(
    endpoint: &CoreEndpoint,
    settings: &ProxySettings,
    request: &[u8],
    body: &mut SpillBuffer,
    defaults: &HeadDefaults<'_>,
) -> Result<CoreResponse, UpstreamError> {
    let mut stream =
        match timeout(settings.connect_timeout, UnixStream::connect(&endpoint.socket)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(UpstreamError::Connect(format!(
                    "connect() to unix:{} failed ({err}) while connecting to upstream",
                    endpoint.socket.display()
                )))
            }
            Err(_) => return Err(UpstreamError::ConnectTimeout),
        };

    send(&mut stream, request, settings.send_timeout).await?;
    let mut reader = body.reader().await.map_err(|err| {
        UpstreamError::Error(format!("failed reading buffered request body: {err}"))
    })?;
    while let Some(chunk) = reader
        .next_chunk(settings.buffer_size)
        .await
        .map_err(|err| {
            UpstreamError::Error(format!("failed reading buffered request body: {err}"))
        })?
    {
        send(&mut stream, &chunk, settings.send_timeout).await?;
    }

    let mut parser = ResponseParser::new();
    let mut buf = BytesMut::with_capacity(settings.buffer_size);
    loop {
        let read = match timeout(settings.read_timeout, stream.read_buf(&mut buf)).await {
            Ok(Ok(read)) => read,
            Ok(Err(err)) => {
                return Err(UpstreamError::Error(format!(
                    "recv() failed ({err}) while reading response header from upstream"
                )))
            }
            Err(_) => return Err(UpstreamError::Timeout("reading response header from upstream")),
        };
        if read == 0 {
            return Err(UpstreamError::Error(
                "upstream prematurely closed connection while reading response header from upstream"
                    .to_owned(),
            ));
        }

        match parser.parse(&buf, defaults) {
            Ok(ParseStatus::Complete(head, offset)) => {
                let body = buf.split_off(offset).freeze();
                return Ok(CoreResponse { stream, head, body });
            }
            Ok(ParseStatus::Incomplete) => {
                if buf.len() >= settings.buffer_size {
                    return Err(UpstreamError::InvalidHeader(
                        "upstream sent too big header while reading response header from upstream"
                            .to_owned(),
                    ));
                }
            }
            Err(err) => {
                return Err(UpstreamError::InvalidHeader(format!(
                    "{err} while reading response header from upstream"
                )))
            }
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    *method != Method::POST && *method != Method::PATCH && method.as_str() != "LOCK"
}

/// Sends the request to the core, repeating it if the outcome matches a `next_upstream`
/// condition and there are tries left.
async fn request_core(
    endpoint: &CoreEndpoint,
    settings: &ProxySettings,
    request: &[u8],
    body: &mut SpillBuffer,
    defaults: &HeadDefaults<'_>,
    idempotent: bool,
) -> Result<CoreResponse, UpstreamError> {
    let started = Instant::now();
    let max_tries = match settings.next_upstream_tries {
        0 => MAX_TRIES,
        tries => tries.min(MAX_TRIES),
    };

    let mut tries = 0;
    loop {
        tries += 1;
        let result = attempt(endpoint, settings, request, body, defaults).await;

        let (condition, request_sent) = match &result {
            Ok(response) => {
                let status = response.head.status;
                match settings
                    .next_upstream
                    .iter()
                    .find(|condition| condition.status() == Some(status))
                {
                    Some(condition) => (*condition, true),
                    None => return result,
                }
            }
            Err(err) => {
                error!("{err}");
                (err.condition(), err.request_sent())
            }
        };

        let retry = settings.next_upstream.contains(&condition)
            && tries < max_tries
            && (idempotent || !request_sent)
            && settings
                .next_upstream_timeout
                .map_or(true, |limit| started.elapsed() < limit);
        if !retry {
            return result;
        }
        warn!("retrying request to the core after {condition:?}");
    }
}

/// Value of a response header which can be disabled via `ignore_headers`
fn special_header<'a>(
    head: &'a ResponseHead,
    settings: &ProxySettings,
    name: &'static str,
) -> Option<&'a HeaderValue> {
    if settings.ignores(name) {
        None
    } else {
        head.get(&HeaderName::from_static(name))
    }
}

/// Whether to collect the complete response before sending it
fn buffering(head: &ResponseHead, settings: &ProxySettings) -> bool {
    match special_header(head, settings, "x-accel-buffering") {
        Some(value) if value.as_bytes().eq_ignore_ascii_case(b"yes") => true,
        Some(value) if value.as_bytes().eq_ignore_ascii_case(b"no") => false,
        _ => settings.buffer_response,
    }
}

/// Builds the response header for the client from the core's response head. `content_length` is
/// added if the core didn't send a `Content-Length` header.
fn client_response_header(
    head: &ResponseHead,
    settings: &ProxySettings,
    content_length: Option<u64>,
) -> Result<Box<ResponseHeader>, Box<Error>> {
    let status = StatusCode::from_u16(head.status).map_err(|err| {
        Error::because(
            ErrorType::InvalidHTTPHeader,
            "core responded with invalid status",
            err,
        )
    })?;
    let charset = special_header(head, settings, "x-accel-charset")
        .and_then(|value| value.to_str().ok())
        .filter(|charset| !charset.is_empty());

    let mut header = ResponseHeader::build(status, Some(head.headers.len() + 1))?;
    let mut has_content_length = false;
    for (name, value) in &head.headers {
        let lower = name.to_ascii_lowercase();
        if CONNECTION_HEADERS.contains(&lower.as_str())
            || settings.hide_headers.iter().any(|hidden| hidden == lower.as_str())
        {
            continue;
        }

        if lower == "date" && value.is_empty() {
            header.append_header(name.clone(), httpdate::fmt_http_date(SystemTime::now()))?;
        } else if lower == "content-type" && charset.is_some() {
            let value = value.to_str().unwrap_or_default();
            match charset {
                Some(charset) if !value.to_ascii_lowercase().contains("charset=") => {
                    header.append_header(name.clone(), format!("{value}; charset={charset}"))?;
                }
                _ => {
                    header.append_header(name.clone(), value.to_owned())?;
                }
            }
        } else {
            has_content_length |= lower == "content-length";
            header.append_header(name.clone(), value.clone())?;
        }
    }

    if let Some(content_length) = content_length.filter(|_| !has_content_length) {
        header.insert_header(header::CONTENT_LENGTH, content_length.to_string())?;
    }
    Ok(Box::new(header))
}

fn read_error(err: io::Error) -> Box<Error> {
    Error::because(ErrorType::ReadError, "failed reading response from core", err)
}

fn buffer_error(err: io::Error) -> Box<Error> {
    Error::because(ErrorType::FileReadError, "failed buffering response", err)
}

/// Reads the next piece of the response body from the core, `None` at the end.
async fn read_body(
    stream: &mut UnixStream,
    settings: &ProxySettings,
) -> Result<Option<Bytes>, Box<Error>> {
    let mut buf = BytesMut::with_capacity(settings.buffer_size);
    match timeout(settings.read_timeout, stream.read_buf(&mut buf)).await {
        Ok(Ok(0)) => Ok(None),
        Ok(Ok(_)) => Ok(Some(buf.freeze())),
        Ok(Err(err)) => Err(read_error(err)),
        Err(_) => {
            error!("upstream timed out while reading upstream");
            Err(Error::explain(
                ErrorType::ReadTimedout,
                "upstream timed out while reading upstream",
            ))
        }
    }
}

/// Passes body data to the client, keeping track of whether the client is still there
#[derive(Debug)]
struct ClientWriter {
    ignore_client_abort: bool,
    client_gone: bool,
}

impl ClientWriter {
    async fn send(
        &mut self,
        session: &mut impl SessionWrapper,
        data: Bytes,
    ) -> Result<(), Box<Error>> {
        if self.client_gone || data.is_empty() {
            return Ok(());
        }
        if let Err(err) = session.write_response_body(Some(data), false).await {
            if !self.ignore_client_abort {
                return Err(err);
            }
            info!("client closed connection, reading the rest of the response anyway: {err}");
            self.client_gone = true;
        }
        Ok(())
    }

    async fn finish(self, session: &mut impl SessionWrapper) -> Result<(), Box<Error>> {
        if self.client_gone {
            Ok(())
        } else {
            session.write_response_body(None, true).await
        }
    }
}

async fn stream_rest(
    session: &mut impl SessionWrapper,
    stream: &mut UnixStream,
    settings: &ProxySettings,
    writer: &mut ClientWriter,
) -> Result<(), Box<Error>> {
    while let Some(data) = read_body(stream, settings).await? {
        writer.send(session, data).await?;
    }
    Ok(())
}

/// Relays data in both directions after the core switched protocols.
async fn tunnel(
    session: &mut impl SessionWrapper,
    mut stream: UnixStream,
    settings: &ProxySettings,
) -> Result<(), Box<Error>> {
    let mut client_done = false;
    let mut buf = BytesMut::with_capacity(settings.buffer_size);
    loop {
        tokio::select! {
            data = session.read_request_body(), if !client_done => {
                match data? {
                    Some(data) => {
                        timeout(settings.send_timeout, stream.write_all(&data))
                            .await
                            .map_err(|_| {
                                Error::explain(
                                    ErrorType::WriteTimedout,
                                    "upstream timed out while proxying upgraded connection",
                                )
                            })?
                            .map_err(|err| {
                                Error::because(
                                    ErrorType::WriteError,
                                    "failed writing to upgraded core connection",
                                    err,
                                )
                            })?;
                    }
                    None => {
                        client_done = true;
                        if let Err(err) = stream.shutdown().await {
                            debug!("failed shutting down core connection: {err}");
                        }
                    }
                }
            }
            read = timeout(settings.read_timeout, stream.read_buf(&mut buf)) => {
                match read {
                    Ok(Ok(0)) => break,
                    Ok(Ok(_)) => {
                        let data = buf.split().freeze();
                        session.write_response_body(Some(data), false).await?;
                    }
                    Ok(Err(err)) => return Err(read_error(err)),
                    Err(_) => {
                        return Err(Error::explain(
                            ErrorType::ReadTimedout,
                            "upstream timed out while proxying upgraded connection",
                        ))
                    }
                }
            }
        }
    }
    session.write_response_body(None, true).await
}

async fn deliver(
    session: &mut impl SessionWrapper,
    response: CoreResponse,
    settings: &ProxySettings,
) -> Result<(), Box<Error>> {
    let CoreResponse {
        mut stream,
        head,
        body,
    } = response;

    if settings.intercept_errors && head.status >= 400 {
        if let Ok(status) = StatusCode::from_u16(head.status) {
            debug!("intercepting error response {status} from the core");
            return error_response(session, status).await;
        }
    }

    if head.upgrade {
        debug!("core switched protocols, tunneling the connection");
        let header = client_response_header(&head, settings, None)?;
        session.write_response_header(header, false).await?;
        if !body.is_empty() {
            session.write_response_body(Some(body), false).await?;
        }
        return tunnel(session, stream, settings).await;
    }

    if session.req_header().method == Method::HEAD
        || head.status == 204
        || head.status == 304
        || head.status < 200
    {
        let header = client_response_header(&head, settings, None)?;
        return session.write_response_header(header, true).await;
    }

    let mut writer = ClientWriter {
        ignore_client_abort: settings.ignore_client_abort,
        client_gone: false,
    };

    if !buffering(&head, settings) {
        let header = client_response_header(&head, settings, None)?;
        session.write_response_header(header, false).await?;
        writer.send(session, body).await?;
        stream_rest(session, &mut stream, settings, &mut writer).await?;
        return writer.finish(session).await;
    }

    let memory_limit = if settings.store {
        0
    } else {
        settings.memory_buffers_size
    };
    let mut buffer = SpillBuffer::new(memory_limit, settings.max_temp_file_size);
    let mut overflow = None;
    let mut data = Some(body);
    while let Some(chunk) = data {
        if !buffer.push(chunk.clone()).await.map_err(buffer_error)? {
            overflow = Some(chunk);
            break;
        }
        data = read_body(&mut stream, settings).await?;
    }

    let content_length = overflow.is_none().then(|| buffer.len());
    if overflow.is_some() {
        debug!(
            "response exceeds buffer limits after {} bytes, streaming the rest",
            buffer.len()
        );
    } else if buffer.spilled() {
        debug!("buffered response of {} bytes", buffer.len());
    }

    let header = client_response_header(&head, settings, content_length)?;
    session.write_response_header(header, false).await?;

    let mut reader = buffer.reader().await.map_err(buffer_error)?;
    while let Some(chunk) = reader
        .next_chunk(settings.buffer_size)
        .await
        .map_err(buffer_error)?
    {
        writer.send(session, chunk).await?;
    }

    if let Some(chunk) = overflow {
        writer.send(session, chunk).await?;
        stream_rest(session, &mut stream, settings, &mut writer).await?;
    }
    writer.finish(session).await
}

async fn read_request_body(
    session: &mut impl SessionWrapper,
    settings: &ProxySettings,
) -> Result<SpillBuffer, Box<Error>> {
    let mut body = SpillBuffer::new(settings.buffer_size, u64::MAX);
    while let Some(data) = session.read_request_body().await? {
        body.push(data).await.map_err(|err| {
            Error::because(
                ErrorType::WriteError,
                "failed buffering request body",
                err,
            )
        })?;
    }
    Ok(body)
}

/// Passes the request to the core and sends its response to the client. Errors occurring before
/// the core responded are reported to the client with a 502 or 504 error page.
pub(crate) async fn proxy_request(
    session: &mut impl SessionWrapper,
    location: &Location,
    target: &ProxyTarget,
    endpoint: &CoreEndpoint,
    server: &str,
) -> Result<(), Box<Error>> {
    let settings = &location.proxy;
    let client_upgrade = session.req_header().headers.contains_key(header::UPGRADE);

    // Data following an upgrade request is tunneled once the core switches protocols
    let mut body = if client_upgrade {
        SpillBuffer::new(0, 0)
    } else {
        read_request_body(session, settings).await?
    };
    let body_len = usize::try_from(body.len()).unwrap_or(usize::MAX);

    let request = RequestHead::prepare(&*session, location, target, &endpoint.password, body_len)
        .build();
    let defaults = HeadDefaults {
        server,
        client_upgrade,
    };
    let idempotent = is_idempotent(&session.req_header().method);

    match request_core(endpoint, settings, &request, &mut body, &defaults, idempotent).await {
        Ok(response) => {
            debug!(
                "core responded with status {} \"{}\"",
                response.head.status, response.head.status_line
            );
            deliver(session, response, settings).await
        }
        Err(err) => error_response(session, err.status()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passenger_module_utils::FromYaml;
    use test_log::test;

    use crate::configuration::PassengerConf;
    use crate::location::Locations;

    fn settings(yaml: &str) -> ProxySettings {
        let locations = Locations::new(&PassengerConf::from_yaml(yaml).unwrap()).unwrap();
        locations.find("/").unwrap().proxy.clone()
    }

    fn head(status: u16, headers: &[(&str, &str)]) -> ResponseHead {
        ResponseHead {
            status,
            status_line: format!("{status}"),
            headers: headers
                .iter()
                .map(|(name, value)| ((*name).to_owned(), HeaderValue::from_str(value).unwrap()))
                .collect(),
            upgrade: false,
        }
    }

    async fn contents(buffer: &mut SpillBuffer, chunk_size: usize) -> Vec<u8> {
        let mut result = Vec::new();
        let mut reader = buffer.reader().await.unwrap();
        while let Some(chunk) = reader.next_chunk(chunk_size).await.unwrap() {
            result.extend_from_slice(&chunk);
        }
        result
    }

    #[test(tokio::test)]
    async fn spill_buffer() {
        let mut buffer = SpillBuffer::new(8, 1024);
        assert_eq!(buffer.len(), 0);
        assert!(buffer.push(Bytes::from_static(b"hello ")).await.unwrap());
        assert!(!buffer.spilled());
        assert!(buffer.push(Bytes::from_static(b"world")).await.unwrap());
        assert!(buffer.spilled());
        assert!(buffer.push(Bytes::from_static(b"!")).await.unwrap());
        assert_eq!(buffer.len(), 12);

        assert_eq!(contents(&mut buffer, 2).await, b"hello world!");
        // Reading again starts over
        assert_eq!(contents(&mut buffer, 100).await, b"hello world!");
    }

    #[test(tokio::test)]
    async fn spill_buffer_limits() {
        let mut buffer = SpillBuffer::new(4, 0);
        assert!(buffer.push(Bytes::from_static(b"abcd")).await.unwrap());
        assert!(!buffer.push(Bytes::from_static(b"e")).await.unwrap());
        assert!(!buffer.spilled());
        assert_eq!(contents(&mut buffer, 16).await, b"abcd");

        let mut buffer = SpillBuffer::new(0, 6);
        assert!(buffer.push(Bytes::from_static(b"abcd")).await.unwrap());
        assert!(buffer.spilled());
        assert!(!buffer.push(Bytes::from_static(b"efg")).await.unwrap());
        assert!(buffer.push(Bytes::from_static(b"ef")).await.unwrap());
        assert_eq!(contents(&mut buffer, 3).await, b"abcdef");
    }

    #[test]
    fn upstream_errors() {
        let err = UpstreamError::Connect("connect() failed".to_owned());
        assert_eq!(err.condition(), NextUpstream::Error);
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(!err.request_sent());

        let err = UpstreamError::Timeout("reading response header from upstream");
        assert_eq!(err.condition(), NextUpstream::Timeout);
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(err.request_sent());
        assert_eq!(
            err.to_string(),
            "upstream timed out while reading response header from upstream"
        );

        let err = UpstreamError::InvalidHeader("upstream sent invalid header".to_owned());
        assert_eq!(err.condition(), NextUpstream::InvalidHeader);
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        assert!(is_idempotent(&Method::GET));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::from_bytes(b"LOCK").unwrap()));
    }

    #[test]
    fn response_headers() {
        let settings = settings("pass_headers: [X-Accel-Expires]");
        let head = head(
            200,
            &[
                ("Content-Type", "text/plain"),
                ("Connection", "keep-alive"),
                ("Transfer-Encoding", "chunked"),
                ("X-Accel-Redirect", "/internal"),
                ("X-Accel-Expires", "60"),
                ("X-Accel-Charset", "koi8-r"),
                ("Status", "200 OK"),
                ("Server", "test"),
                ("Date", ""),
            ],
        );
        let header = client_response_header(&head, &settings, Some(5)).unwrap();
        assert_eq!(header.status, StatusCode::OK);
        assert_eq!(
            header.headers.get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=koi8-r"
        );
        assert!(header.headers.get(header::CONNECTION).is_none());
        assert!(header.headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(header.headers.get("x-accel-redirect").is_none());
        assert!(header.headers.get("x-accel-charset").is_none());
        assert_eq!(header.headers.get("x-accel-expires").unwrap(), "60");
        assert_eq!(header.headers.get("status").unwrap(), "200 OK");
        assert_eq!(header.headers.get(header::SERVER).unwrap(), "test");
        assert!(!header.headers.get(header::DATE).unwrap().is_empty());
        assert_eq!(header.headers.get(header::CONTENT_LENGTH).unwrap(), "5");

        let head = self::head(404, &[("Content-Length", "3")]);
        let header = client_response_header(&head, &settings, Some(5)).unwrap();
        assert_eq!(header.status, StatusCode::NOT_FOUND);
        assert_eq!(header.headers.get(header::CONTENT_LENGTH).unwrap(), "3");
    }

    #[test]
    fn ignored_headers() {
        let settings = self::settings("ignore_headers: [X-Accel-Charset, X-Accel-Buffering]");
        let head = head(
            200,
            &[
                ("Content-Type", "text/html"),
                ("X-Accel-Charset", "utf-8"),
                ("X-Accel-Buffering", "yes"),
            ],
        );
        let header = client_response_header(&head, &settings, None).unwrap();
        assert_eq!(header.headers.get(header::CONTENT_TYPE).unwrap(), "text/html");
        assert!(!buffering(&head, &settings));

        let settings = self::settings("buffer_response: true");
        assert!(buffering(&head, &settings));
        let head = self::head(200, &[("X-Accel-Buffering", "no")]);
        assert!(!buffering(&head, &settings));
        let head = self::head(200, &[]);
        assert!(buffering(&head, &settings));
    }
}
