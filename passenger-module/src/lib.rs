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

pub mod configuration;
mod classifier;
mod core_context;
mod handler;
mod location;
pub mod options_cache;
mod proxy;
mod request_builder;
mod response_parser;
mod static_files;
mod variables;

pub use configuration::{MainConf, PassengerConf, PassengerOpt};
pub use core_context::CoreContext;
pub use handler::PassengerHandler;
pub use static_files::StaticFilesHandler;

/// Version of Phusion Passenger this handler speaks to
pub const PASSENGER_VERSION: &str = "5.3.7";

/// Name of the web server as reported to the core and in the `Server` header
pub const SERVER_SOFTWARE: &str = "passenger-web-server";

/// Version of the web server
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
