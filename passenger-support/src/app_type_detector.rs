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

//! Detects the type of an application by looking for marker files in its root directory.

use log::trace;
use nix::errno::Errno;
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::io;
use std::sync::Arc;

use crate::cached_file_stat::{CachedFileStat, FileKind};
use crate::path::{extract_dir_name_static, resolve_symlink};
use crate::wrapper_registry::{self, WrapperRegistryEntry};

/// Errors produced while probing the file system
#[derive(Debug)]
pub enum DetectorError {
    /// Access to a marker file or directory has been denied
    Permission {
        /// Description of the failed operation
        message: String,
        /// The path that could not be accessed
        path: String,
    },
    /// Any other file system error
    Stat {
        /// The path that could not be checked
        path: String,
        /// The underlying error
        source: io::Error,
    },
}

impl DetectorError {
    fn new(path: &str, err: io::Error) -> Self {
        if err.raw_os_error() == Some(Errno::EACCES as i32) {
            Self::Permission {
                message: format!("Cannot stat '{path}': {err}"),
                path: path.to_owned(),
            }
        } else {
            Self::Stat {
                path: path.to_owned(),
                source: err,
            }
        }
    }

    /// The path that failed to be checked
    pub fn path(&self) -> &str {
        match self {
            Self::Permission { path, .. } | Self::Stat { path, .. } => path,
        }
    }
}

impl Display for DetectorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Permission { message, .. } => f.write_str(message),
            Self::Stat { path, source } => write!(f, "Cannot stat '{path}': {source}"),
        }
    }
}

impl std::error::Error for DetectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Permission { .. } => None,
            Self::Stat { source, .. } => Some(source),
        }
    }
}

/// Outcome of a detection, an empty result if no marker matched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppTypeDetectorResult {
    /// Wrapper for the detected application type
    pub entry: Option<&'static WrapperRegistryEntry>,
    /// Application root the markers were found in
    pub app_root: String,
}

impl AppTypeDetectorResult {
    /// Checks whether detection came up empty.
    pub fn is_null(&self) -> bool {
        self.entry.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerCheck {
    File,
    Directory,
    NodePackage,
}

#[derive(Debug)]
struct Marker {
    path: &'static str,
    check: MarkerCheck,
    app_type: &'static str,
}

const fn marker(path: &'static str, check: MarkerCheck, app_type: &'static str) -> Marker {
    Marker {
        path,
        check,
        app_type,
    }
}

// Checked in order, first match wins
static MARKERS: &[Marker] = &[
    marker("config.ru", MarkerCheck::File, "rack"),
    marker("config/environment.rb", MarkerCheck::File, "rails"),
    marker("passenger_wsgi.py", MarkerCheck::File, "wsgi"),
    marker("app.js", MarkerCheck::File, "node"),
    marker("server.js", MarkerCheck::File, "node"),
    marker("index.js", MarkerCheck::File, "node"),
    marker("package.json", MarkerCheck::NodePackage, "node"),
    marker(".meteor", MarkerCheck::Directory, "meteor"),
];

#[derive(Debug, Default, Deserialize)]
struct NodePackage {
    main: Option<serde_json::Value>,
    #[serde(default)]
    scripts: NodeScripts,
}

#[derive(Debug, Default, Deserialize)]
struct NodeScripts {
    start: Option<serde_json::Value>,
}

impl NodePackage {
    fn is_startable(path: &str) -> bool {
        std::fs::read(path)
            .ok()
            .and_then(|data| serde_json::from_slice::<NodePackage>(&data).ok())
            .is_some_and(|package| package.main.is_some() || package.scripts.start.is_some())
    }
}

/// Application type detector sharing a stat cache with the rest of the server
#[derive(Debug, Clone)]
pub struct AppTypeDetector {
    stat_cache: Arc<CachedFileStat>,
    throttle_rate: u32,
}

impl AppTypeDetector {
    /// Creates a detector using the given stat cache and throttle rate (in seconds).
    pub fn new(stat_cache: Arc<CachedFileStat>, throttle_rate: u32) -> Self {
        Self {
            stat_cache,
            throttle_rate,
        }
    }

    /// Detects the application owning a document root directory.
    ///
    /// The application root is the parent of the document root. If the application is mounted
    /// below a base URI, the document root is usually a symlink into the application, so that
    /// symlink is resolved first.
    pub fn check_document_root(
        &self,
        document_root: &str,
        has_base_uri: bool,
    ) -> Result<AppTypeDetectorResult, DetectorError> {
        let app_root = if has_base_uri {
            let resolved = resolve_symlink(document_root)
                .map_err(|err| DetectorError::new(document_root, err))?;
            extract_dir_name_static(&resolved).to_owned()
        } else {
            extract_dir_name_static(document_root).to_owned()
        };
        self.check_app_root(&app_root)
    }

    /// Detects the application type by probing `app_root` for marker files.
    pub fn check_app_root(&self, app_root: &str) -> Result<AppTypeDetectorResult, DetectorError> {
        for marker in MARKERS {
            let path = if app_root.ends_with('/') {
                format!("{app_root}{}", marker.path)
            } else {
                format!("{app_root}/{}", marker.path)
            };

            let stat = match self.stat_cache.stat(&path, self.throttle_rate) {
                Ok(stat) => stat,
                Err(err)
                    if matches!(
                        Errno::from_i32(err.raw_os_error().unwrap_or(0)),
                        Errno::ENOENT | Errno::ENOTDIR
                    ) =>
                {
                    continue
                }
                Err(err) => return Err(DetectorError::new(&path, err)),
            };

            let matched = match marker.check {
                MarkerCheck::File => stat.kind == FileKind::File,
                MarkerCheck::Directory => stat.kind == FileKind::Directory,
                MarkerCheck::NodePackage => {
                    stat.kind == FileKind::File && NodePackage::is_startable(&path)
                }
            };
            if matched {
                trace!("found {} in {app_root}, app type {}", marker.path, marker.app_type);
                return Ok(AppTypeDetectorResult {
                    entry: wrapper_registry::lookup(marker.app_type),
                    app_root: app_root.to_owned(),
                });
            }
        }

        Ok(AppTypeDetectorResult {
            entry: None,
            app_root: app_root.to_owned(),
        })
    }
}
