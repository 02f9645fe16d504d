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

#![doc = include_str!("../README.md")]

mod configuration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
pub use configuration::{ListenAddr, StartupConf, StartupOpt};
use http::Extensions;
use passenger_module_utils::pingora::{
    Error, ErrorType, HttpPeer, ProxyHttp, ResponseHeader, Session, SessionWrapper,
};
use passenger_module_utils::{RequestFilter, RequestFilterResult};
use std::borrow::Cow;
use std::fmt::Debug;
use std::ops::{Deref, DerefMut};

/// Handler doing nothing, used to wrap the session of a finished request
#[derive(Debug)]
struct DummyHandler;

impl RequestFilter for DummyHandler {
    type Conf = ();
    type CTX = ();

    fn new_ctx() -> Self::CTX {}
}

struct NoDebug<T> {
    inner: T,
}

impl<T> Debug for NoDebug<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("skipped").finish()
    }
}

impl<T> From<T> for NoDebug<T> {
    fn from(value: T) -> Self {
        Self { inner: value }
    }
}

impl<T> Deref for NoDebug<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> DerefMut for NoDebug<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Result of a test execution of the app
#[derive(Debug)]
pub struct AppResult {
    session: NoDebug<Session>,
    err: Option<Box<Error>>,
    extensions: Extensions,
    body: BytesMut,
}

impl AppResult {
    /// Produces the resulting session state of the request
    pub fn session(&mut self) -> impl SessionWrapper + '_ {
        SessionWrapperImpl {
            inner: &mut self.session,
            handler: &DummyHandler,
            extensions: &mut self.extensions,
            capture_body: false,
        }
    }

    /// Retrieves the error if any
    pub fn err(&self) -> &Option<Box<Error>> {
        &self.err
    }

    /// Retrieves the response body
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Retrieves the response body as string
    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// A basic Pingora app implementation, to be passed to [`StartupConf::into_server`]
///
/// This app handles the `early_request_filter`, `request_filter`, `upstream_peer`,
/// `upstream_response_filter` and `logging` phases. All processing is delegated to the respective
/// `RequestFilter` methods.
#[derive(Debug)]
pub struct DefaultApp<H> {
    handler: H,
    capture_body: bool,
}

impl<H> DefaultApp<H> {
    /// Creates a new app from a [`RequestFilter`] instance.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            capture_body: false,
        }
    }

    /// Returns the handler processing requests.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Handles all request phases for a request like Pingora would do it.
    ///
    /// This method is meant for testing. Response body is captured rather than sent, the
    /// request errors out if an upstream peer needs to be contacted.
    pub async fn handle_request(&mut self, mut session: Session) -> AppResult
    where
        H: RequestFilter + Sync,
        H::CTX: Send + Sync,
    {
        self.capture_body = true;

        let mut ctx = self.new_ctx();

        let result = async {
            self.early_request_filter(&mut session, &mut ctx).await?;

            if !self.request_filter(&mut session, &mut ctx).await? {
                self.upstream_peer(&mut session, &mut ctx).await?;
                return Err(Error::explain(
                    ErrorType::InternalError,
                    "Got upstream peer but no handler for it",
                ));
            }
            Ok(())
        }
        .await;

        self.logging(
            &mut session,
            result.as_ref().err().map(|err| err.as_ref()),
            &mut ctx,
        )
        .await;

        self.capture_body = false;

        let body = ctx.extensions.remove::<BytesMut>().unwrap_or_default();

        AppResult {
            session: session.into(),
            err: result.err(),
            extensions: ctx.extensions,
            body,
        }
    }
}

/// Context for the default app
#[derive(Debug, Clone)]
pub struct DefaultCtx<C> {
    extensions: Extensions,
    handler: C,
}

#[async_trait]
impl<H> ProxyHttp for DefaultApp<H>
where
    H: RequestFilter + Sync,
    H::CTX: Send,
{
    type CTX = DefaultCtx<<H as RequestFilter>::CTX>;

    fn new_ctx(&self) -> Self::CTX {
        Self::CTX {
            extensions: Extensions::new(),
            handler: H::new_ctx(),
        }
    }

    async fn early_request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<(), Box<Error>> {
        let mut session = SessionWrapperImpl::new(
            session,
            &self.handler,
            &mut ctx.extensions,
            self.capture_body,
        );
        self.handler
            .early_request_filter(&mut session, &mut ctx.handler)
            .await
    }

    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<bool, Box<Error>> {
        let mut session = SessionWrapperImpl::new(
            session,
            &self.handler,
            &mut ctx.extensions,
            self.capture_body,
        );
        Ok(self
            .handler
            .request_filter(&mut session, &mut ctx.handler)
            .await?
            == RequestFilterResult::ResponseSent)
    }

    async fn upstream_peer(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>, Box<Error>> {
        let mut session = SessionWrapperImpl::new(
            session,
            &self.handler,
            &mut ctx.extensions,
            self.capture_body,
        );
        let result = self
            .handler
            .upstream_peer(&mut session, &mut ctx.handler)
            .await?;
        if let Some(result) = result {
            Ok(result)
        } else {
            Err(Error::new(ErrorType::HTTPStatus(404)))
        }
    }

    fn upstream_response_filter(
        &self,
        session: &mut Session,
        response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) {
        let mut session = SessionWrapperImpl::new(
            session,
            &self.handler,
            &mut ctx.extensions,
            self.capture_body,
        );
        self.handler
            .response_filter(&mut session, response, Some(&mut ctx.handler))
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let mut session = SessionWrapperImpl::new(
            session,
            &self.handler,
            &mut ctx.extensions,
            self.capture_body,
        );
        self.handler
            .logging(&mut session, e, &mut ctx.handler)
            .await
    }
}

struct SessionWrapperImpl<'a, H> {
    inner: &'a mut Session,
    handler: &'a H,
    extensions: &'a mut Extensions,
    capture_body: bool,
}

impl<'a, H> SessionWrapperImpl<'a, H> {
    /// Creates a new session wrapper for the given Pingora session.
    fn new(
        inner: &'a mut Session,
        handler: &'a H,
        extensions: &'a mut Extensions,
        capture_body: bool,
    ) -> Self {
        Self {
            inner,
            handler,
            extensions,
            capture_body,
        }
    }
}

#[async_trait]
impl<H> SessionWrapper for SessionWrapperImpl<'_, H>
where
    H: RequestFilter + Sync,
{
    fn extensions(&self) -> &Extensions {
        self.extensions
    }

    fn extensions_mut(&mut self) -> &mut Extensions {
        self.extensions
    }

    async fn write_response_header(
        &mut self,
        mut resp: Box<ResponseHeader>,
        end_of_stream: bool,
    ) -> Result<(), Box<Error>> {
        self.handler.response_filter(self, &mut resp, None);

        self.deref_mut()
            .write_response_header(resp, end_of_stream)
            .await
    }

    async fn write_response_body(
        &mut self,
        data: Option<Bytes>,
        end_of_stream: bool,
    ) -> Result<(), Box<Error>> {
        if self.capture_body {
            if let Some(data) = data {
                self.extensions_mut()
                    .get_or_insert_default::<BytesMut>()
                    .extend_from_slice(&data);
            }
            Ok(())
        } else {
            self.deref_mut()
                .write_response_body(data, end_of_stream)
                .await
        }
    }
}

impl<H> Deref for SessionWrapperImpl<'_, H> {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        self.inner
    }
}

impl<H> DerefMut for SessionWrapperImpl<'_, H> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{header, StatusCode};
    use passenger_module_utils::pingora::{create_test_session, RequestHeader};
    use passenger_module_utils::standard_response::error_response;
    use test_log::test;

    #[derive(Debug)]
    struct TeapotHandler;

    #[async_trait]
    impl RequestFilter for TeapotHandler {
        type Conf = ();
        type CTX = ();

        fn new_ctx() -> Self::CTX {}

        async fn request_filter(
            &self,
            session: &mut impl SessionWrapper,
            _ctx: &mut Self::CTX,
        ) -> Result<RequestFilterResult, Box<Error>> {
            if session.uri().path() == "/teapot" {
                error_response(session, StatusCode::IM_A_TEAPOT).await?;
                Ok(RequestFilterResult::ResponseSent)
            } else {
                Ok(RequestFilterResult::Unhandled)
            }
        }

        fn response_filter(
            &self,
            _session: &mut impl SessionWrapper,
            response: &mut ResponseHeader,
            _ctx: Option<&mut Self::CTX>,
        ) {
            let _ = response.insert_header("X-Filtered", "yes");
        }
    }

    async fn make_session(path: &str) -> Session {
        let header = RequestHeader::build("GET", path.as_bytes(), None).unwrap();
        create_test_session(header).await
    }

    #[test(tokio::test)]
    async fn response_sent() {
        let mut app = DefaultApp::new(TeapotHandler);
        let mut result = app.handle_request(make_session("/teapot").await).await;
        assert!(result.err().is_none());
        assert!(result.body_str().contains("418"));
        let body_len = result.body().len().to_string();

        let session = result.session();
        let response = session.response_written().unwrap();
        assert_eq!(response.status, StatusCode::IM_A_TEAPOT);
        assert_eq!(response.headers.get("X-Filtered").unwrap(), "yes");
        assert_eq!(
            response.headers.get(header::CONTENT_LENGTH).unwrap(),
            &body_len
        );
    }

    #[test(tokio::test)]
    async fn unhandled() {
        let mut app = DefaultApp::new(TeapotHandler);
        let result = app.handle_request(make_session("/other").await).await;
        assert!(result.err().is_some());
        assert!(result.body().is_empty());
    }
}
