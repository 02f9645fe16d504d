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

//! Serves files below a location's root. This takes care of requests the Passenger handler
//! declined as well as of page cache hits.

use async_trait::async_trait;
use bytes::BytesMut;
use http::{header, Method, StatusCode};
use httpdate::fmt_http_date;
use log::{debug, info, warn};
use mime_guess::MimeGuess;
use passenger_module_utils::pingora::{Error, ErrorType, ResponseHeader, SessionWrapper};
use passenger_module_utils::standard_response::{error_response, redirect_response};
use passenger_module_utils::{RequestFilter, RequestFilterResult};
use percent_encoding::percent_decode_str;
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::configuration::PassengerConf;
use crate::location::Locations;

const BUFFER_SIZE: usize = 64 * 1024;

const INDEX_FILE: &str = "index.html";

/// Resolves a URI path against a root directory. Resolved paths outside the root directory
/// produce an [`ErrorKind::InvalidData`] error.
fn resolve_uri(uri_path: &str, root: &Path) -> Result<PathBuf, std::io::Error> {
    let uri_path = uri_path.strip_prefix('/').ok_or(ErrorKind::InvalidInput)?;
    let uri_path = uri_path.strip_suffix('/').unwrap_or(uri_path);

    let root = root.canonicalize()?;
    let mut path = root.clone();
    for component in uri_path.split('/').filter(|component| !component.is_empty()) {
        let decoded = percent_decode_str(component).collect::<Vec<_>>();
        path.push(OsStr::from_bytes(&decoded));
    }

    let path = path.canonicalize()?;
    if path.starts_with(&root) {
        Ok(path)
    } else {
        Err(ErrorKind::InvalidData.into())
    }
}

/// Metadata of a file about to be served
#[derive(Debug)]
struct FileMeta {
    mime: MimeGuess,
    size: u64,
    modified: Option<String>,
    etag: String,
}

impl FileMeta {
    fn from_path(path: &Path) -> Result<Self, std::io::Error> {
        let meta = path.metadata()?;
        if !meta.is_file() {
            return Err(ErrorKind::InvalidInput.into());
        }

        let modified = meta.modified().ok();
        let etag = format!(
            "\"{:x}-{:x}\"",
            modified
                .and_then(|modified| modified.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map_or(0, |duration| duration.as_secs()),
            meta.len()
        );
        Ok(Self {
            mime: mime_guess::from_path(path),
            size: meta.len(),
            modified: modified.map(fmt_http_date),
            etag,
        })
    }

    /// Checks `If-None-Match` and `If-Modified-Since` request headers.
    fn is_not_modified(&self, session: &impl SessionWrapper) -> bool {
        let headers = &session.req_header().headers;
        if let Some(value) = headers
            .get(header::IF_NONE_MATCH)
            .and_then(|value| value.to_str().ok())
        {
            value == "*"
                || value
                    .split(',')
                    .map(str::trim)
                    .any(|value| value == self.etag)
        } else if let Some(value) = headers
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|value| value.to_str().ok())
        {
            self.modified
                .as_ref()
                .is_some_and(|modified| modified == value)
        } else {
            false
        }
    }

    fn response_header(&self, status: StatusCode) -> Result<Box<ResponseHeader>, Box<Error>> {
        let mut header = ResponseHeader::build(status, Some(4))?;
        if status == StatusCode::OK {
            header.append_header(header::CONTENT_LENGTH, self.size.to_string())?;
        }
        header.append_header(
            header::CONTENT_TYPE,
            self.mime.first_or_octet_stream().as_ref(),
        )?;
        if let Some(modified) = &self.modified {
            header.append_header(header::LAST_MODIFIED, modified)?;
        }
        header.append_header(header::ETAG, &self.etag)?;
        Ok(Box::new(header))
    }
}

/// Sends a file as response, only the header for `HEAD` requests.
pub(crate) async fn serve_file(
    session: &mut impl SessionWrapper,
    path: &Path,
) -> Result<(), Box<Error>> {
    let meta = match FileMeta::from_path(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::InvalidInput => {
            warn!("path {path:?} is not a regular file, denying access");
            return error_response(session, StatusCode::FORBIDDEN).await;
        }
        Err(err) => {
            warn!("failed retrieving metadata for path {path:?}: {err}");
            return error_response(session, StatusCode::INTERNAL_SERVER_ERROR).await;
        }
    };

    if meta.is_not_modified(session) {
        debug!("If-None-Match/If-Modified-Since check resulted in Not Modified");
        let header = meta.response_header(StatusCode::NOT_MODIFIED)?;
        return session.write_response_header(header, true).await;
    }

    let header = meta.response_header(StatusCode::OK)?;
    if session.req_header().method == Method::HEAD || meta.size == 0 {
        return session.write_response_header(header, true).await;
    }

    let mut file = File::open(path).await.map_err(|err| {
        Error::because(
            ErrorType::FileOpenError,
            format!("failed opening file {path:?}"),
            err,
        )
    })?;
    session.write_response_header(header, false).await?;

    let mut remaining = meta.size;
    while remaining > 0 {
        let chunk_size =
            usize::try_from(remaining).map_or(BUFFER_SIZE, |remaining| remaining.min(BUFFER_SIZE));
        let mut buf = BytesMut::zeroed(chunk_size);
        let len = file.read(buf.as_mut()).await.map_err(|err| {
            Error::because(
                ErrorType::FileReadError,
                format!("failed reading data from {path:?}"),
                err,
            )
        })?;
        if len == 0 {
            return Err(Error::explain(
                ErrorType::FileReadError,
                format!("file ended with {remaining} bytes left to be written"),
            ));
        }

        buf.truncate(len);
        session.write_response_body(Some(buf.freeze()), false).await?;
        remaining -= len as u64;
    }
    session.write_response_body(None, true).await
}

/// Handler serving static files for requests which don't go to an application
///
/// It only handles requests for locations with a root directory, everything else is left
/// unhandled.
#[derive(Debug)]
pub struct StaticFilesHandler {
    locations: Arc<Locations>,
}

impl StaticFilesHandler {
    pub(crate) fn new(locations: Arc<Locations>) -> Self {
        Self { locations }
    }
}

#[async_trait]
impl RequestFilter for StaticFilesHandler {
    type Conf = PassengerConf;
    type CTX = ();

    fn new_ctx() -> Self::CTX {}

    async fn request_filter(
        &self,
        session: &mut impl SessionWrapper,
        _ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>> {
        let uri_path = session.uri().path().to_owned();
        let decoded = percent_decode_str(&uri_path).decode_utf8_lossy();
        let Some(root) = self
            .locations
            .find(&decoded)
            .and_then(|location| location.root.as_deref())
        else {
            return Ok(RequestFilterResult::Unhandled);
        };

        let method = &session.req_header().method;
        if *method != Method::GET && *method != Method::HEAD {
            warn!("denying method {method} for static file {uri_path}");
            error_response(session, StatusCode::METHOD_NOT_ALLOWED).await?;
            return Ok(RequestFilterResult::ResponseSent);
        }

        let mut path = match resolve_uri(&uri_path, Path::new(root)) {
            Ok(path) => path,
            Err(err) => {
                let status = match err.kind() {
                    ErrorKind::InvalidInput | ErrorKind::InvalidData => {
                        warn!("rejecting invalid path {uri_path}");
                        StatusCode::BAD_REQUEST
                    }
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
                    _ => {
                        warn!("failed resolving the path {uri_path}: {err}");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                error_response(session, status).await?;
                return Ok(RequestFilterResult::ResponseSent);
            }
        };

        if path.is_dir() {
            if !uri_path.ends_with('/') {
                let mut location = format!("{uri_path}/");
                if let Some(query) = session.uri().query() {
                    location.push('?');
                    location.push_str(query);
                }
                info!("redirecting directory request to {location}");
                redirect_response(session, StatusCode::MOVED_PERMANENTLY, &location).await?;
                return Ok(RequestFilterResult::ResponseSent);
            }

            path.push(INDEX_FILE);
            if !path.is_file() {
                debug!("directory {uri_path} has no index file");
                error_response(session, StatusCode::FORBIDDEN).await?;
                return Ok(RequestFilterResult::ResponseSent);
            }
        }

        debug!("serving static file {path:?}");
        serve_file(session, &path).await?;
        Ok(RequestFilterResult::ResponseSent)
    }
}
