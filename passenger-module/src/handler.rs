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

//! Handler for the `request_filter` phase.

use async_trait::async_trait;
use http::StatusCode;
use log::{debug, error, trace};
use nix::unistd::{getpid, getuid};
use passenger_module_utils::pingora::{Error, SessionWrapper};
use passenger_module_utils::standard_response::{error_response, PROGRAM_NAME};
use passenger_module_utils::{RequestFilter, RequestFilterResult};
use passenger_support::app_type_detector::DetectorError;
use passenger_support::cached_file_stat::CachedFileStat;
use percent_encoding::percent_decode_str;
use std::sync::Arc;

use crate::classifier::{Classifier, Decision};
use crate::configuration::{MainConf, PassengerConf};
use crate::core_context::CoreContext;
use crate::location::Locations;
use crate::proxy::proxy_request;
use crate::response_parser::server_header;
use crate::static_files::{serve_file, StaticFilesHandler};
use crate::{PASSENGER_VERSION, SERVER_SOFTWARE, SERVER_VERSION};

fn report_detector_error(err: &DetectorError) {
    match err {
        DetectorError::Permission { message, .. } => error!(
            "{message}; This error means that the web server worker process (PID {}, running as \
             UID {}) does not have permission to access this file. Please read this page to \
             learn how to fix this problem: \
             https://www.phusionpassenger.com/library/admin/nginx/troubleshooting/?a=upon-accessing-the-web-app-nginx-reports-a-permission-denied-error; \
             Extra info",
            getpid(),
            getuid()
        ),
        DetectorError::Stat { .. } => error!("{err}"),
    }
}

/// Handler for Pingora’s `request_filter` phase
///
/// Requests for application locations are passed on to the Passenger core, page cache hits are
/// served directly. Everything else is left unhandled for the next handler in the chain.
#[derive(Debug)]
pub struct PassengerHandler {
    main_conf: MainConf,
    locations: Arc<Locations>,
    classifier: Classifier,
    core: Arc<CoreContext>,
}

impl TryFrom<PassengerConf> for PassengerHandler {
    type Error = Box<Error>;

    fn try_from(conf: PassengerConf) -> Result<Self, Self::Error> {
        debug!("Passenger configuration received: {conf:#?}");

        let locations = Locations::new(&conf).map_err(|err| {
            error!("cannot create Phusion Passenger configuration cache: {err}");
            err.into_error()
        })?;

        let stat_cache = Arc::new(CachedFileStat::default());
        let classifier = Classifier::new(
            conf.passenger.root_dir.is_some(),
            stat_cache,
            conf.passenger.stat_throttle_rate,
        );

        Ok(Self {
            main_conf: conf.passenger,
            locations: Arc::new(locations),
            classifier,
            core: Arc::new(CoreContext::new()),
        })
    }
}

impl PassengerHandler {
    /// The core used by this handler
    pub fn core(&self) -> &Arc<CoreContext> {
        &self.core
    }

    /// Replaces the core, e.g. by one started by other means.
    pub fn set_core(&mut self, core: Arc<CoreContext>) {
        self.core = core;
    }

    /// Starts the watchdog and core with the handler’s configuration.
    pub fn start_core(&self) -> Result<(), Box<Error>> {
        self.core.start(&self.main_conf)
    }

    /// Creates a handler serving static files from the same locations, to run after this one.
    pub fn static_files_handler(&self) -> StaticFilesHandler {
        StaticFilesHandler::new(self.locations.clone())
    }

    fn server_header(&self, server_tokens: bool) -> String {
        server_header(
            SERVER_SOFTWARE,
            SERVER_VERSION,
            PROGRAM_NAME,
            PASSENGER_VERSION,
            server_tokens,
            self.main_conf.show_version_in_header,
        )
    }
}

#[async_trait]
impl RequestFilter for PassengerHandler {
    type Conf = PassengerConf;

    type CTX = ();

    fn new_ctx() -> Self::CTX {}

    async fn request_filter(
        &self,
        session: &mut impl SessionWrapper,
        _ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>> {
        let path = percent_decode_str(session.uri().path())
            .decode_utf8_lossy()
            .into_owned();
        let Some(location) = self.locations.find(&path) else {
            return Ok(RequestFilterResult::Unhandled);
        };

        let decision = match self
            .classifier
            .classify(location, &session.req_header().method, &path)
        {
            Ok(decision) => decision,
            Err(err) => {
                report_detector_error(&err);
                error_response(session, StatusCode::INTERNAL_SERVER_ERROR).await?;
                return Ok(RequestFilterResult::ResponseSent);
            }
        };
        trace!("request for {path} classified as {decision:?}");

        match decision {
            Decision::Decline => Ok(RequestFilterResult::Unhandled),
            Decision::ServeCachedFile(file) => {
                debug!("serving page cache file {file:?}");
                serve_file(session, &file).await?;
                Ok(RequestFilterResult::ResponseSent)
            }
            Decision::Proxy(target) => {
                let Some(endpoint) = self.core.endpoint() else {
                    debug!("Passenger core isn't running, not handling {path}");
                    return Ok(RequestFilterResult::Unhandled);
                };
                let server = self.server_header(location.server_tokens);
                proxy_request(session, location, &target, endpoint, &server).await?;
                Ok(RequestFilterResult::ResponseSent)
            }
        }
    }
}
