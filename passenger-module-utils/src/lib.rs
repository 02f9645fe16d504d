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

//! # Module helpers
//!
//! This crate contains the pieces shared by the Passenger web server crates: the
//! [`RequestFilter`] trait implemented by request handlers, loading configuration from YAML files
//! and the standard error pages.

mod deserialize;
pub mod pingora;
pub mod standard_response;

use async_trait::async_trait;
pub use deserialize::OneOrMany;
use log::trace;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::fmt::Debug;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::pingora::{Error, ErrorType, HttpPeer, ResponseHeader, SessionWrapper};

/// Request filter result indicating how the current request should be processed further
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RequestFilterResult {
    /// Response has been sent, no further processing should happen. Other Pingora phases should
    /// not be triggered.
    ResponseSent,

    /// Request has been handled and further request filters should not run. Response hasn’t been
    /// sent however, next Pingora phase should deal with that.
    Handled,

    /// Request filter could not handle this request, next request filter should run if it exists.
    #[default]
    Unhandled,
}

/// Trait to be implemented by request filters.
///
/// All phases have a default implementation doing nothing, a handler only needs to implement the
/// phases it is interested in.
#[async_trait]
pub trait RequestFilter: Sized {
    /// Configuration type of this handler.
    type Conf;

    /// Per-request state of this handler, see [`ProxyHttp::CTX`](crate::pingora::ProxyHttp::CTX)
    type CTX: Send;

    /// Creates a new state object, see [`ProxyHttp::new_ctx`](crate::pingora::ProxyHttp::new_ctx)
    fn new_ctx() -> Self::CTX;

    /// Handler to run during Pingora’s `early_request_filter` phase.
    async fn early_request_filter(
        &self,
        _session: &mut impl SessionWrapper,
        _ctx: &mut Self::CTX,
    ) -> Result<(), Box<Error>> {
        Ok(())
    }

    /// Handler to run during Pingora’s `request_filter` phase. This uses a different return type
    /// to account for the existence of multiple request filters.
    async fn request_filter(
        &self,
        _session: &mut impl SessionWrapper,
        _ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>> {
        Ok(RequestFilterResult::Unhandled)
    }

    /// Handler to run during Pingora’s `upstream_peer` phase. Returning `None` means that this
    /// handler has no peer for the request.
    async fn upstream_peer(
        &self,
        _session: &mut impl SessionWrapper,
        _ctx: &mut Self::CTX,
    ) -> Result<Option<Box<HttpPeer>>, Box<Error>> {
        Ok(None)
    }

    /// Called for every response header before it is sent to the client, both for upstream
    /// responses and for responses produced by the handlers themselves. `ctx` is `None` in the
    /// latter case.
    fn response_filter(
        &self,
        _session: &mut impl SessionWrapper,
        _response: &mut ResponseHeader,
        _ctx: Option<&mut Self::CTX>,
    ) {
    }

    /// Handler to run during Pingora’s `logging` phase.
    async fn logging(
        &self,
        _session: &mut impl SessionWrapper,
        _e: Option<&Error>,
        _ctx: &mut Self::CTX,
    ) {
    }
}

/// Two request filters running one after another.
///
/// The second handler only gets to process a request if the first one left it unhandled. Response
/// filters and logging run for both handlers.
#[derive(Debug)]
pub struct HandlerChain<A, B> {
    /// First handler in the chain
    pub first: A,
    /// Handler processing requests left unhandled by the first one
    pub second: B,
}

impl<A, B> HandlerChain<A, B> {
    /// Creates a chain out of two handlers.
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

#[async_trait]
impl<A, B> RequestFilter for HandlerChain<A, B>
where
    A: RequestFilter + Send + Sync,
    B: RequestFilter + Send + Sync,
    A::CTX: Send,
    B::CTX: Send,
{
    type Conf = (A::Conf, B::Conf);
    type CTX = (A::CTX, B::CTX);

    fn new_ctx() -> Self::CTX {
        (A::new_ctx(), B::new_ctx())
    }

    async fn early_request_filter(
        &self,
        session: &mut impl SessionWrapper,
        ctx: &mut Self::CTX,
    ) -> Result<(), Box<Error>> {
        self.first.early_request_filter(session, &mut ctx.0).await?;
        self.second.early_request_filter(session, &mut ctx.1).await
    }

    async fn request_filter(
        &self,
        session: &mut impl SessionWrapper,
        ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>> {
        let result = self.first.request_filter(session, &mut ctx.0).await?;
        if result != RequestFilterResult::Unhandled {
            return Ok(result);
        }
        self.second.request_filter(session, &mut ctx.1).await
    }

    async fn upstream_peer(
        &self,
        session: &mut impl SessionWrapper,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Box<HttpPeer>>, Box<Error>> {
        if let Some(peer) = self.first.upstream_peer(session, &mut ctx.0).await? {
            return Ok(Some(peer));
        }
        self.second.upstream_peer(session, &mut ctx.1).await
    }

    fn response_filter(
        &self,
        session: &mut impl SessionWrapper,
        response: &mut ResponseHeader,
        mut ctx: Option<&mut Self::CTX>,
    ) {
        self.first
            .response_filter(session, response, ctx.as_mut().map(|ctx| &mut ctx.0));
        self.second
            .response_filter(session, response, ctx.map(|ctx| &mut ctx.1));
    }

    async fn logging(
        &self,
        session: &mut impl SessionWrapper,
        e: Option<&Error>,
        ctx: &mut Self::CTX,
    ) {
        self.first.logging(session, e, &mut ctx.0).await;
        self.second.logging(session, e, &mut ctx.1).await;
    }
}

/// Trait for configuration structures that can be loaded from YAML files. This trait has a blanket
/// implementation for any structure implementing [`serde::Deserialize`].
pub trait FromYaml {
    /// Loads configuration from a YAML file.
    fn load_from_yaml<P>(path: P) -> Result<Self, Box<Error>>
    where
        P: AsRef<Path>,
        Self: Sized;

    /// Loads configuration from a YAML string.
    fn from_yaml<S>(yaml_conf: S) -> Result<Self, Box<Error>>
    where
        S: AsRef<str>,
        Self: Sized;

    /// Loads configuration from multiple YAML files. Top-level keys of later files replace the
    /// ones of earlier files. No files means default configuration.
    fn load_from_files<P>(paths: &[P]) -> Result<Self, Box<Error>>
    where
        P: AsRef<Path>,
        Self: Sized;
}

fn read_yaml_value(path: &Path) -> Result<Value, Box<Error>> {
    let file = File::open(path).map_err(|err| {
        Error::because(
            ErrorType::FileOpenError,
            format!("failed opening configuration file {path:?}"),
            err,
        )
    })?;
    let reader = BufReader::new(file);

    serde_yaml::from_reader(reader).map_err(|err| {
        Error::because(
            ErrorType::FileReadError,
            format!("failed reading configuration file {path:?}"),
            err,
        )
    })
}

fn value_to_conf<D: DeserializeOwned + Debug>(value: Value) -> Result<D, Box<Error>> {
    let conf = serde_yaml::from_value(value).map_err(|err| {
        Error::because(
            ErrorType::FileReadError,
            "failed parsing configuration",
            err,
        )
    })?;
    trace!("Loaded configuration: {conf:#?}");
    Ok(conf)
}

impl<D> FromYaml for D
where
    D: DeserializeOwned + Debug,
{
    fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<Error>> {
        value_to_conf(read_yaml_value(path.as_ref())?)
    }

    fn from_yaml<S: AsRef<str>>(yaml_conf: S) -> Result<Self, Box<Error>> {
        let value = serde_yaml::from_str(yaml_conf.as_ref()).map_err(|err| {
            Error::because(
                ErrorType::FileReadError,
                "failed reading configuration",
                err,
            )
        })?;
        value_to_conf(value)
    }

    fn load_from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, Box<Error>> {
        let mut merged = Mapping::new();
        for path in paths {
            match read_yaml_value(path.as_ref())? {
                Value::Mapping(mapping) => {
                    for (key, value) in mapping {
                        merged.insert(key, value);
                    }
                }
                Value::Null => {}
                _ => {
                    return Err(Error::explain(
                        ErrorType::FileReadError,
                        format!(
                            "configuration file {:?} does not contain a mapping",
                            path.as_ref()
                        ),
                    ))
                }
            }
        }
        value_to_conf(Value::Mapping(merged))
    }
}

/// This macro merges multiple structures implementing [`serde::Deserialize`] and [`Default`] into
/// a structure containing all of them.
///
/// The structure of the expected configuration file is flattened, so that the configuration
/// settings from each component are still expected to be found on the top level.
///
/// ```rust
/// use passenger_module_utils::{merge_conf, FromYaml};
/// use serde::Deserialize;
///
/// #[derive(Debug, Default, Deserialize)]
/// #[serde(default)]
/// struct ListenConf {
///     listen: Vec<String>,
/// }
///
/// #[derive(Debug, Default, Deserialize)]
/// #[serde(default)]
/// struct RootConf {
///     root: Option<String>,
/// }
///
/// merge_conf! {
///     struct Conf {
///         listen: ListenConf,
///         root: RootConf,
///     }
/// }
///
/// let conf = Conf::from_yaml("listen: ['127.0.0.1:8080']\nroot: /var/www").unwrap();
/// assert_eq!(conf.listen.listen, vec!["127.0.0.1:8080".to_owned()]);
/// assert_eq!(conf.root.root.as_deref(), Some("/var/www"));
/// ```
#[macro_export]
macro_rules! merge_conf {
    (
        $(#[$struct_attr:meta])*
        $struct_vis:vis struct $struct_name:ident {
            $(
                $(#[$field_attr:meta])*
                $field_vis:vis $field_name:ident: $field_type:ty,
            )*
        }
    ) => {
        $(#[$struct_attr])*
        #[derive(::std::fmt::Debug, ::std::default::Default, ::serde::Deserialize)]
        #[serde(default)]
        $struct_vis struct $struct_name {
            $(
                #[serde(flatten)]
                $(#[$field_attr])*
                $field_vis $field_name: $field_type,
            )*
        }
    }
}
