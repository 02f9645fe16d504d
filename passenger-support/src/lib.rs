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

//! # Passenger support
//!
//! Components of the Passenger web server which don’t depend on Pingora:
//!
//! * [`path`]: absolutizing paths, resolving symlinks and extracting directory names
//! * [`cached_file_stat`]: throttled `stat()` calls shared between requests
//! * [`wrapper_registry`]: the application types known to the core
//! * [`app_type_detector`]: detecting the application type by probing marker files
//! * [`header_table`]: a small open-addressed header map merging repeated headers
//! * [`watchdog_launcher`]: starting and stopping the watchdog and core processes

pub mod app_type_detector;
pub mod cached_file_stat;
pub mod header_table;
pub mod path;
pub mod watchdog_launcher;
pub mod wrapper_registry;
