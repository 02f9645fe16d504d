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

//! Decides per request whether the Passenger core should handle it.

use http::Method;
use log::{debug, trace};
use passenger_support::app_type_detector::{AppTypeDetector, DetectorError};
use passenger_support::cached_file_stat::CachedFileStat;
use passenger_support::path::absolutize_path;
use passenger_support::wrapper_registry::{self, WrapperRegistryEntry};
use std::path::PathBuf;
use std::sync::Arc;

use crate::location::Location;

/// Longest file name considered for page cache lookups
const MAX_PATH: usize = 4096;

/// Where an application request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProxyTarget {
    /// Document root of the application, never empty
    pub(crate) public_dir: String,
    /// Base URI the application is mounted at, if any
    pub(crate) base_uri: Option<String>,
    /// Wrapper of the application type
    pub(crate) wrapper: &'static WrapperRegistryEntry,
}

/// Outcome of request classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Not an application request, the next handler should take care of it.
    Decline,
    /// A page cache file should be served.
    ServeCachedFile(PathBuf),
    /// The request should be passed on to the core.
    Proxy(Box<ProxyTarget>),
}

/// Checks whether a URI path is below a base URI. A base URI `/` never matches.
pub(crate) fn base_uri_matches(uri: &str, base_uri: &str) -> bool {
    if base_uri == "/" {
        return false;
    }
    match uri.strip_prefix(base_uri) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn find_base_uri<'a>(location: &'a Location, uri: &str) -> Option<&'a str> {
    location
        .conf
        .base_uris
        .iter()
        .map(String::as_str)
        .find(|base_uri| base_uri_matches(uri, base_uri))
}

/// Determines the page cache file for a mapped path.
fn page_cache_candidate(mapped: &str, public_dir: &str) -> Option<String> {
    if mapped.is_empty() {
        return None;
    }

    let candidate = if mapped == public_dir || mapped.strip_suffix('/') == Some(public_dir) {
        if mapped.ends_with('/') {
            format!("{mapped}index.html")
        } else {
            format!("{mapped}/index.html")
        }
    } else if mapped.ends_with('/') {
        format!("{mapped}index.html")
    } else {
        format!("{mapped}.html")
    };

    (candidate.len() < MAX_PATH).then_some(candidate)
}

/// Request classifier sharing the stat cache with the application type detector
#[derive(Debug, Clone)]
pub(crate) struct Classifier {
    enabled: bool,
    stat_cache: Arc<CachedFileStat>,
    detector: AppTypeDetector,
}

impl Classifier {
    /// Creates a new classifier. It declines everything unless `enabled` is set.
    pub(crate) fn new(enabled: bool, stat_cache: Arc<CachedFileStat>, throttle_rate: u32) -> Self {
        let detector = AppTypeDetector::new(stat_cache.clone(), throttle_rate);
        Self {
            enabled,
            stat_cache,
            detector,
        }
    }

    fn is_file(&self, path: &str) -> bool {
        self.stat_cache
            .stat(path, 0)
            .is_ok_and(|stat| stat.is_file())
    }

    /// Classifies a request for the decoded URI path `path`.
    pub(crate) fn classify(
        &self,
        location: &Location,
        method: &Method,
        path: &str,
    ) -> Result<Decision, DetectorError> {
        if !self.enabled || !location.enabled() {
            return Ok(Decision::Decline);
        }

        let Some(root) = &location.root else {
            return Ok(Decision::Decline);
        };
        let root = root.trim_end_matches('/');

        // Dot segments must not escape the document root
        let path = match absolutize_path(path, "/") {
            Ok(mut normalized) => {
                if path.ends_with('/') && !normalized.ends_with('/') {
                    normalized.push('/');
                }
                normalized
            }
            Err(err) => {
                debug!("{err}");
                return Ok(Decision::Decline);
            }
        };
        let path = path.as_str();
        let mapped = format!("{root}{path}");
        if self.is_file(&mapped) {
            return Ok(Decision::Decline);
        }

        let base_uri = find_base_uri(location, path);
        let mut public_dir = match (base_uri, &location.conf.document_root) {
            (Some(_), Some(document_root)) => document_root.clone(),
            (Some(base_uri), None) => format!("{root}{base_uri}"),
            (None, _) => root.to_owned(),
        };
        if base_uri.is_some() {
            // Different spellings of a shared public directory map to the same application
            match absolutize_path(&public_dir, "") {
                Ok(normalized) => public_dir = normalized,
                Err(err) => debug!("{err}"),
            }
        }
        if public_dir.is_empty() {
            public_dir.push('/');
        }

        if method == Method::GET || method == Method::HEAD {
            if let Some(candidate) = page_cache_candidate(&mapped, &public_dir) {
                if self.is_file(&candidate) {
                    return Ok(Decision::ServeCachedFile(candidate.into()));
                }
            }
        }

        let wrapper = if let Some(app_type) = &location.conf.app_type {
            wrapper_registry::lookup(app_type)
        } else {
            let result = match &location.conf.app_root {
                Some(app_root) => self.detector.check_app_root(app_root)?,
                None => self
                    .detector
                    .check_document_root(&public_dir, base_uri.is_some())?,
            };
            trace!(
                "detected application type {:?} in {}",
                result.entry.map(|entry| entry.language),
                result.app_root
            );
            result.entry
        };

        Ok(match wrapper {
            Some(wrapper) => Decision::Proxy(Box::new(ProxyTarget {
                public_dir,
                base_uri: base_uri.map(str::to_owned),
                wrapper,
            })),
            None => Decision::Decline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passenger_module_utils::FromYaml;
    use std::fs::{create_dir_all, File};
    use std::os::unix::fs::symlink;
    use std::path::Path;
    use test_log::test;

    use crate::configuration::PassengerConf;
    use crate::location::Locations;

    fn touch(path: &Path) {
        create_dir_all(path.parent().unwrap()).unwrap();
        File::create(path).unwrap();
    }

    fn load(root: &Path, extra: &str) -> Locations {
        let conf = PassengerConf::from_yaml(format!(
            "root: {}\nenabled: true\n{extra}",
            root.display()
        ))
        .unwrap();
        Locations::new(&conf).unwrap()
    }

    fn classify(locations: &Locations, method: Method, path: &str) -> Decision {
        let classifier = Classifier::new(true, Arc::new(CachedFileStat::default()), 0);
        let location = locations.find(path).unwrap();
        classifier.classify(location, &method, path).unwrap()
    }

    #[test]
    fn base_uris() {
        assert!(base_uri_matches("/blog", "/blog"));
        assert!(base_uri_matches("/blog/", "/blog"));
        assert!(base_uri_matches("/blog/post/1", "/blog"));
        assert!(!base_uri_matches("/blogger", "/blog"));
        assert!(!base_uri_matches("/", "/blog"));
        assert!(!base_uri_matches("/", "/"));
        assert!(!base_uri_matches("/anything", "/"));
    }

    #[test]
    fn page_cache_candidates() {
        assert_eq!(
            page_cache_candidate("/srv/public", "/srv/public").unwrap(),
            "/srv/public/index.html"
        );
        assert_eq!(
            page_cache_candidate("/srv/public/", "/srv/public").unwrap(),
            "/srv/public/index.html"
        );
        assert_eq!(
            page_cache_candidate("/srv/public/dir/", "/srv/public").unwrap(),
            "/srv/public/dir/index.html"
        );
        assert_eq!(
            page_cache_candidate("/srv/public/about", "/srv/public").unwrap(),
            "/srv/public/about.html"
        );
        assert!(page_cache_candidate("", "/").is_none());
        assert!(page_cache_candidate(&format!("/{}", "a".repeat(MAX_PATH)), "/").is_none());
    }

    #[test]
    fn existing_file_declined() {
        let tempdir = tempfile::tempdir().unwrap();
        let public = tempdir.path().join("public");
        touch(&public.join("favicon.ico"));
        let locations = load(&public, "app_type: rack");

        assert_eq!(
            classify(&locations, Method::GET, "/favicon.ico"),
            Decision::Decline
        );
    }

    #[test]
    fn page_cache_hit() {
        let tempdir = tempfile::tempdir().unwrap();
        let public = tempdir.path().join("public");
        touch(&public.join("about.html"));
        touch(&public.join("index.html"));
        let locations = load(&public, "app_type: rack");

        let expected = public.join("about.html");
        assert_eq!(
            classify(&locations, Method::GET, "/about"),
            Decision::ServeCachedFile(expected.clone())
        );
        assert_eq!(
            classify(&locations, Method::HEAD, "/about"),
            Decision::ServeCachedFile(expected)
        );
        assert_eq!(
            classify(&locations, Method::GET, "/"),
            Decision::ServeCachedFile(public.join("index.html"))
        );
        assert!(matches!(
            classify(&locations, Method::POST, "/about"),
            Decision::Proxy(_)
        ));
    }

    #[test]
    fn dot_segments_stay_inside_root() {
        let tempdir = tempfile::tempdir().unwrap();
        let public = tempdir.path().join("public");
        touch(&tempdir.path().join("secret.html"));
        touch(&public.join("about.html"));
        touch(&public.join("index.html"));
        let locations = load(&public, "app_type: rack");

        for path in ["/../secret", "/../../secret", "/a/../../secret", "/./../secret"] {
            let decision = classify(&locations, Method::GET, path);
            assert!(
                matches!(decision, Decision::Proxy(_)),
                "unexpected decision {decision:?} for {path}"
            );
        }

        assert_eq!(
            classify(&locations, Method::GET, "/sub/../about"),
            Decision::ServeCachedFile(public.join("about.html"))
        );
        assert_eq!(
            classify(&locations, Method::GET, "/sub/../"),
            Decision::ServeCachedFile(public.join("index.html"))
        );
        assert_eq!(
            classify(&locations, Method::GET, "/../about.html"),
            Decision::Decline
        );
    }

    #[test]
    fn proxy_detected() {
        let tempdir = tempfile::tempdir().unwrap();
        let app = tempdir.path().join("app");
        touch(&app.join("config.ru"));
        create_dir_all(app.join("public")).unwrap();
        let locations = load(&app.join("public"), "");

        let decision = classify(&locations, Method::GET, "/users/42");
        let Decision::Proxy(target) = decision.clone() else {
            panic!("unexpected decision {decision:?}");
        };
        assert_eq!(target.public_dir, app.join("public").to_string_lossy());
        assert_eq!(target.base_uri, None);
        assert_eq!(target.wrapper.language, "ruby");

        // Same file system state, same decision
        assert_eq!(classify(&locations, Method::GET, "/users/42"), decision);
    }

    #[test]
    fn base_uri_with_symlink() {
        let tempdir = tempfile::tempdir().unwrap();
        let app = tempdir.path().join("apps/blog/current");
        touch(&app.join("config.ru"));
        create_dir_all(app.join("public")).unwrap();
        let www = tempdir.path().join("www");
        create_dir_all(&www).unwrap();
        symlink(app.join("public"), www.join("blog")).unwrap();

        let locations = load(&www, "base_uris: [/, /blog]");
        let Decision::Proxy(target) = classify(&locations, Method::GET, "/blog/post/1") else {
            panic!("expected the request to be proxied");
        };
        assert_eq!(target.public_dir, www.join("blog").to_string_lossy());
        assert_eq!(target.base_uri.as_deref(), Some("/blog"));
        assert_eq!(target.wrapper.language, "ruby");

        // Outside of the base URI there is no application
        assert_eq!(
            classify(&locations, Method::GET, "/other"),
            Decision::Decline
        );
    }

    #[test]
    fn declined() {
        let tempdir = tempfile::tempdir().unwrap();
        let public = tempdir.path().join("public");
        create_dir_all(&public).unwrap();

        // No application markers
        let locations = load(&public, "");
        assert_eq!(classify(&locations, Method::GET, "/"), Decision::Decline);

        // Disabled
        let locations = load(&public, "app_type: node\nlocations:\n  /off:\n    enabled: false");
        assert_eq!(classify(&locations, Method::GET, "/off/x"), Decision::Decline);
        assert!(matches!(
            classify(&locations, Method::GET, "/on"),
            Decision::Proxy(_)
        ));

        // Passenger not configured
        let classifier = Classifier::new(false, Arc::new(CachedFileStat::default()), 0);
        let location = locations.find("/on").unwrap();
        assert_eq!(
            classifier.classify(location, &Method::GET, "/on").unwrap(),
            Decision::Decline
        );
    }
}
