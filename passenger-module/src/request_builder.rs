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

//! Produces the request head sent to the core: the client's request line and headers followed by
//! the private `!~` headers.

use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, Method};
use log::error;
use passenger_module_utils::pingora::SessionWrapper;
use passenger_support::header_table::HeaderTable;
use passenger_support::path::{extract_dir_name_static, resolve_symlink};
use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, CONTROLS};
use std::borrow::Cow;

use crate::classifier::ProxyTarget;
use crate::location::Location;
use crate::variables::RequestVars;

/// Characters escaped in rewritten URIs, non-ASCII bytes are always escaped
const URI_ESCAPE: &AsciiSet = &CONTROLS.add(b' ').add(b'#').add(b'%').add(b'?');

const KNOWN_METHODS: &[Method] = &[
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
    Method::PATCH,
    Method::TRACE,
];

const WEBDAV_METHODS: &[&str] = &["MKCOL", "COPY", "MOVE", "PROPFIND", "PROPPATCH", "LOCK", "UNLOCK"];

fn method_name(method: &Method) -> &str {
    if KNOWN_METHODS.contains(method) || WEBDAV_METHODS.contains(&method.as_str()) {
        method.as_str()
    } else {
        "UNKNOWN"
    }
}

/// Converts a lower-case header name to the usual capitalization, e.g. `X-Forwarded-For`.
pub(crate) fn title_case(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    let mut capitalize = true;
    for c in name.chars() {
        if capitalize {
            result.push(c.to_ascii_uppercase());
        } else {
            result.push(c);
        }
        capitalize = c == '-';
    }
    result
}

/// Determines the application group name if none has been configured.
fn default_app_group_name(location: &Location, target: &ProxyTarget) -> String {
    let mut name = if let Some(app_root) = &location.conf.app_root {
        app_root.clone()
    } else if target.base_uri.is_none() {
        extract_dir_name_static(&target.public_dir).to_owned()
    } else {
        match resolve_symlink(&target.public_dir) {
            Ok(resolved) => extract_dir_name_static(&resolved).to_owned(),
            Err(err) => {
                error!("error resolving symlink {}: {err}", target.public_dir);
                extract_dir_name_static(&target.public_dir).to_owned()
            }
        }
    };

    if let Some(environment) = &location.conf.environment {
        name.push_str(" (");
        name.push_str(environment);
        name.push(')');
    }
    name
}

/// Collects the request head, optionally writing it into a buffer.
#[derive(Debug, Default)]
struct Output {
    buf: Option<BytesMut>,
    len: usize,
}

impl Output {
    fn push(&mut self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        self.len += data.len();
        if let Some(buf) = &mut self.buf {
            buf.extend_from_slice(data);
        }
    }

    fn line(&mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.push(name);
        self.push(": ");
        self.push(value);
        self.push("\r\n");
    }
}

/// Everything the request head consists of, resolved for a particular request
#[derive(Debug)]
pub(crate) struct RequestHead<'a> {
    method: &'a str,
    uri: Cow<'a, str>,
    args: Option<&'a str>,
    headers: Vec<(String, Bytes)>,
    content_length: Option<usize>,
    set_headers: Vec<(&'a str, String)>,
    password: &'a str,
    public_dir: &'a str,
    base_uri: Option<&'a str>,
    remote_addr: String,
    remote_port: String,
    remote_user: Option<&'a str>,
    app_group_name: Option<String>,
    app_type: &'static str,
    options_cache: &'a [u8],
    env_vars_cache: Option<&'a str>,
    tls: bool,
}

impl<'a> RequestHead<'a> {
    /// Gathers the data for the request head. `body_len` is the size of the buffered request
    /// body.
    pub(crate) fn prepare(
        session: &'a impl SessionWrapper,
        location: &'a Location,
        target: &'a ProxyTarget,
        password: &'a str,
        body_len: usize,
    ) -> Self {
        let request = session.req_header();
        let current_uri = session.uri();

        let uri = if session.uri_rewritten() {
            let decoded: Vec<u8> = percent_decode_str(current_uri.path()).collect();
            Cow::Owned(percent_encode(&decoded, URI_ESCAPE).to_string())
        } else {
            Cow::Borrowed(session.original_uri().path())
        };
        let args = current_uri.query().filter(|args| !args.is_empty());

        let (remote_addr, remote_port) = match session.client_addr() {
            Some(addr) => match addr.as_inet() {
                Some(addr) => (addr.ip().to_string(), addr.port().to_string()),
                None => ("unix:".to_owned(), String::new()),
            },
            None => (String::new(), String::new()),
        };

        let chunked = request
            .headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .any(|value| {
                String::from_utf8_lossy(value.as_bytes())
                    .to_ascii_lowercase()
                    .contains("chunked")
            });

        let tls = session.is_tls();
        let headers = forwarded_headers(&request.headers, location);

        let set_headers = if location.set_headers.is_empty() {
            Vec::new()
        } else {
            let host = session.host().unwrap_or_default();
            let decoded_uri = percent_decode_str(current_uri.path()).decode_utf8_lossy();
            let request_uri = session
                .original_uri()
                .path_and_query()
                .map(|path| path.as_str())
                .unwrap_or("/");
            let protocol = format!("{:?}", request.version);
            let vars = RequestVars {
                host: &host,
                remote_addr: &remote_addr,
                remote_port: &remote_port,
                scheme: if tls { "https" } else { "http" },
                request_uri,
                uri: &decoded_uri,
                args: args.unwrap_or_default(),
                method: request.method.as_str(),
                protocol: &protocol,
                document_root: location.root.as_deref().unwrap_or_default(),
                headers: &request.headers,
            };
            location
                .set_headers
                .iter()
                .map(|header| (header.display_name.as_str(), header.template.evaluate(&vars)))
                .filter(|(_, value)| !value.is_empty())
                .collect()
        };

        Self {
            method: method_name(&request.method),
            uri,
            args,
            headers,
            content_length: chunked.then_some(body_len),
            set_headers,
            password,
            public_dir: &target.public_dir,
            base_uri: target.base_uri.as_deref(),
            remote_addr,
            remote_port,
            remote_user: session.remote_user(),
            app_group_name: location
                .conf
                .app_group_name
                .is_none()
                .then(|| default_app_group_name(location, target)),
            app_type: target.wrapper.language,
            options_cache: &location.options_cache,
            env_vars_cache: location.env_vars_cache.as_deref(),
            tls,
        }
    }

    fn write(&self, out: &mut Output) {
        out.push(self.method);
        out.push(" ");
        out.push(self.uri.as_bytes());
        if let Some(args) = self.args {
            out.push("?");
            out.push(args);
        }
        out.push(" HTTP/1.1\r\nConnection: close\r\n");

        for (name, value) in &self.headers {
            out.line(name, value);
        }
        if let Some(content_length) = self.content_length {
            out.line("Content-Length", content_length.to_string());
        }
        for (name, value) in &self.set_headers {
            out.line(name, value);
        }

        out.line("!~", self.password);
        out.line("!~DOCUMENT_ROOT", self.public_dir);
        if let Some(base_uri) = self.base_uri {
            out.line("!~SCRIPT_NAME", base_uri);
        }
        out.line("!~REMOTE_ADDR", &self.remote_addr);
        out.line("!~REMOTE_PORT", &self.remote_port);
        if let Some(remote_user) = self.remote_user.filter(|user| !user.is_empty()) {
            out.line("!~REMOTE_USER", remote_user);
        }
        if let Some(app_group_name) = &self.app_group_name {
            out.line("!~PASSENGER_APP_GROUP_NAME", app_group_name);
        }
        out.line("!~PASSENGER_APP_TYPE", self.app_type);
        out.push(self.options_cache);
        if let Some(env_vars) = self.env_vars_cache {
            out.line("!~PASSENGER_ENV_VARS", env_vars);
        }
        out.line("!~FLAGS", if self.tls { "DCS" } else { "DC" });
        out.push("\r\n");
    }

    /// Serializes the request head into a single buffer of the exact size.
    pub(crate) fn build(&self) -> Bytes {
        let mut measure = Output::default();
        self.write(&mut measure);

        let mut out = Output {
            buf: Some(BytesMut::with_capacity(measure.len)),
            len: 0,
        };
        self.write(&mut out);
        out.buf.unwrap_or_default().freeze()
    }
}

/// Client headers passed on to the core, repeated headers merged into one line
fn forwarded_headers(headers: &HeaderMap, location: &Location) -> Vec<(String, Bytes)> {
    let mut table = HeaderTable::with_capacity(headers.keys_len());
    let mut names = Vec::new();
    for (name, value) in headers.iter().filter(|(name, _)| {
        *name != header::TRANSFER_ENCODING
            && !location.set_headers.iter().any(|set| set.name == *name)
    }) {
        if !table.contains(name.as_str()) {
            names.push(name);
        }
        table.insert(
            name.as_str().to_owned(),
            Bytes::copy_from_slice(value.as_bytes()),
        );
    }

    names
        .into_iter()
        .filter_map(|name| {
            table
                .lookup(name.as_str())
                .map(|value| (title_case(name.as_str()), value.to_bytes()))
        })
        .collect()
}
