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

//! Effective settings per location, computed once when the configuration is loaded

use bytes::Bytes;
use http::HeaderName;
use log::debug;
use std::time::Duration;

use crate::configuration::{
    ConfigError, LocationConf, NextUpstream, PassengerConf, ScopeConf, DEFAULT_BUFFER_SIZE,
    DEFAULT_MAX_TEMP_FILE_SIZE, DEFAULT_TIMEOUT,
};
use crate::options_cache::{build_env_vars_cache, build_options_cache};
use crate::variables::Template;

/// Response headers hidden from the client unless listed in `pass_headers`
const HIDDEN_HEADERS: &[&str] = &[
    "x-accel-expires",
    "x-accel-redirect",
    "x-accel-limit-rate",
    "x-accel-buffering",
    "x-accel-charset",
];

/// A request header overridden by configuration
#[derive(Debug, Clone)]
pub(crate) struct SetHeader {
    pub(crate) name: HeaderName,
    pub(crate) display_name: String,
    pub(crate) template: Template,
}

/// Settings of the connection to the core
#[derive(Debug, Clone)]
pub(crate) struct ProxySettings {
    pub(crate) connect_timeout: Duration,
    pub(crate) send_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) next_upstream: Vec<NextUpstream>,
    pub(crate) next_upstream_tries: u32,
    pub(crate) next_upstream_timeout: Option<Duration>,
    pub(crate) buffer_size: usize,
    pub(crate) buffer_response: bool,
    pub(crate) store: bool,
    pub(crate) memory_buffers_size: usize,
    pub(crate) max_temp_file_size: u64,
    pub(crate) intercept_errors: bool,
    pub(crate) ignore_client_abort: bool,
    pub(crate) ignore_headers: Vec<HeaderName>,
    pub(crate) hide_headers: Vec<HeaderName>,
}

impl ProxySettings {
    fn new(conf: &LocationConf) -> Self {
        let timeout = |value: Option<u64>| Duration::from_millis(value.unwrap_or(DEFAULT_TIMEOUT));

        let next_upstream = match &conf.next_upstream {
            Some(list) if list.contains(&NextUpstream::Off) => Vec::new(),
            Some(list) => list.to_vec(),
            None => vec![NextUpstream::Error, NextUpstream::Timeout],
        };

        let buffers = conf.buffers.unwrap_or_default();

        let header_list = |names: &[String]| -> Vec<HeaderName> {
            names
                .iter()
                .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
                .collect()
        };
        let pass_headers = header_list(&conf.pass_headers);
        let hide_headers = HIDDEN_HEADERS
            .iter()
            .copied()
            .map(HeaderName::from_static)
            .filter(|name| !pass_headers.contains(name))
            .collect();

        Self {
            connect_timeout: timeout(conf.connect_timeout),
            send_timeout: timeout(conf.send_timeout),
            read_timeout: timeout(conf.read_timeout),
            next_upstream,
            next_upstream_tries: conf.next_upstream_tries.unwrap_or(0),
            next_upstream_timeout: conf
                .next_upstream_timeout
                .filter(|timeout| *timeout > 0)
                .map(Duration::from_millis),
            buffer_size: conf.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            buffer_response: conf.buffer_response.unwrap_or(false),
            store: conf.store.unwrap_or(false),
            memory_buffers_size: buffers.number * buffers.size,
            max_temp_file_size: conf
                .max_temp_file_size
                .unwrap_or(DEFAULT_MAX_TEMP_FILE_SIZE),
            intercept_errors: conf.intercept_errors.unwrap_or(false),
            ignore_client_abort: conf.ignore_client_abort.unwrap_or(false),
            ignore_headers: header_list(&conf.ignore_headers),
            hide_headers,
        }
    }

    /// Checks whether a response header lost its special meaning.
    pub(crate) fn ignores(&self, name: &str) -> bool {
        self.ignore_headers
            .iter()
            .any(|ignored| ignored.as_str().eq_ignore_ascii_case(name))
    }
}

/// A location with its merged settings and prepared data
#[derive(Debug, Clone)]
pub(crate) struct Location {
    pub(crate) prefix: String,
    pub(crate) root: Option<String>,
    pub(crate) server_tokens: bool,
    pub(crate) conf: LocationConf,
    pub(crate) options_cache: Bytes,
    pub(crate) env_vars_cache: Option<String>,
    pub(crate) set_headers: Vec<SetHeader>,
    pub(crate) proxy: ProxySettings,
}

impl Location {
    fn new(
        prefix: String,
        root: Option<String>,
        server_tokens: bool,
        conf: LocationConf,
    ) -> Result<Self, ConfigError> {
        conf.validate()?;

        let set_headers = conf
            .set_headers
            .iter()
            .map(|(name, value)| {
                Ok(SetHeader {
                    name: HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                        ConfigError::new(format!("invalid header name \"{name}\""))
                    })?,
                    display_name: name.to_owned(),
                    template: Template::parse(value)?,
                })
            })
            .collect::<Result<_, ConfigError>>()?;

        Ok(Self {
            options_cache: build_options_cache(&conf),
            env_vars_cache: build_env_vars_cache(&conf.env_vars),
            proxy: ProxySettings::new(&conf),
            prefix,
            root,
            server_tokens,
            conf,
            set_headers,
        })
    }

    /// Checks whether requests for this location go to applications.
    pub(crate) fn enabled(&self) -> bool {
        self.conf.enabled.unwrap_or(false)
    }
}

/// All configured locations
#[derive(Debug, Clone)]
pub(crate) struct Locations {
    list: Vec<Location>,
}

impl Locations {
    /// Merges every scope of the configuration with its enclosing scopes.
    pub(crate) fn new(conf: &PassengerConf) -> Result<Self, ConfigError> {
        let mut list = Vec::new();
        add_scope(
            &mut list,
            String::new(),
            &conf.server,
            &LocationConf::default(),
            None,
            true,
        )?;
        Ok(Self { list })
    }

    /// Finds the location with the longest prefix matching `path`.
    pub(crate) fn find(&self, path: &str) -> Option<&Location> {
        self.list
            .iter()
            .filter(|location| path.starts_with(&location.prefix))
            .max_by_key(|location| location.prefix.len())
    }

    /// Iterates over all locations.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Location> {
        self.list.iter()
    }
}

fn add_scope(
    list: &mut Vec<Location>,
    prefix: String,
    scope: &ScopeConf,
    parent: &LocationConf,
    parent_root: Option<&str>,
    parent_server_tokens: bool,
) -> Result<(), ConfigError> {
    let mut local = scope.location.clone();
    local.prepare()?;

    let merged = LocationConf::merge(parent, &local);
    let root = scope.root.as_deref().or(parent_root);
    let server_tokens = scope.server_tokens.unwrap_or(parent_server_tokens);

    for (child_prefix, child) in &scope.locations {
        add_scope(
            list,
            child_prefix.clone(),
            child,
            &merged,
            root,
            server_tokens,
        )?;
    }

    debug!("location {prefix:?}: {merged:?}");
    list.push(Location::new(
        prefix,
        root.map(str::to_owned),
        server_tokens,
        merged,
    )?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use passenger_module_utils::FromYaml;
    use test_log::test;

    fn locations(yaml: &str) -> Locations {
        Locations::new(&PassengerConf::from_yaml(yaml).unwrap()).unwrap()
    }

    #[test]
    fn nesting() {
        let locations = locations(
            r#"
                root: /srv/app/public
                enabled: true
                environment: production
                env_vars:
                    A: "1"
                locations:
                    /blog:
                        root: /srv/www
                        base_uri: /blog
                        env_vars:
                            B: "2"
                        locations:
                            /blog/static:
                                enabled: false
                    /admin:
                        server_tokens: false
                        environment: staging
            "#,
        );

        let root = locations.find("/").unwrap();
        assert_eq!(root.prefix, "");
        assert!(root.enabled());
        assert_eq!(root.root.as_deref(), Some("/srv/app/public"));
        assert!(root.server_tokens);
        assert!(root
            .options_cache
            .starts_with(b"!~PASSENGER_APP_ENV: production\r\n"));

        let blog = locations.find("/blog/post/1").unwrap();
        assert_eq!(blog.prefix, "/blog");
        assert_eq!(blog.root.as_deref(), Some("/srv/www"));
        assert_eq!(*blog.conf.base_uris, vec!["/blog".to_owned()]);
        assert_eq!(blog.conf.env_vars.len(), 2);
        assert!(blog.env_vars_cache.is_some());

        let static_files = locations.find("/blog/static/logo.png").unwrap();
        assert!(!static_files.enabled());
        assert_eq!(static_files.root.as_deref(), Some("/srv/www"));
        assert_eq!(*static_files.conf.base_uris, vec!["/blog".to_owned()]);

        let admin = locations.find("/admin").unwrap();
        assert!(!admin.server_tokens);
        assert_eq!(admin.conf.environment.as_deref(), Some("staging"));

        assert_eq!(locations.iter().count(), 4);
    }

    #[test]
    fn proxy_defaults() {
        let locations = locations("{}");
        let proxy = &locations.find("/").unwrap().proxy;
        assert_eq!(proxy.read_timeout, Duration::from_millis(DEFAULT_TIMEOUT));
        assert_eq!(
            proxy.next_upstream,
            vec![NextUpstream::Error, NextUpstream::Timeout]
        );
        assert_eq!(proxy.next_upstream_tries, 0);
        assert_eq!(proxy.next_upstream_timeout, None);
        assert_eq!(proxy.hide_headers.len(), HIDDEN_HEADERS.len());
        assert!(!proxy.buffer_response);
    }

    #[test]
    fn proxy_settings() {
        let locations = locations(
            r#"
                read_timeout: 500
                next_upstream: [error, "off"]
                pass_headers: X-Accel-Redirect
                ignore_headers: [X-Accel-Buffering]
                store: true
                set_headers:
                    X-Real-IP: $remote_addr
            "#,
        );
        let location = locations.find("/").unwrap();
        let proxy = &location.proxy;
        assert_eq!(proxy.read_timeout, Duration::from_millis(500));
        assert!(proxy.next_upstream.is_empty());
        assert!(!proxy
            .hide_headers
            .contains(&HeaderName::from_static("x-accel-redirect")));
        assert!(proxy.ignores("x-accel-buffering"));
        assert_eq!(proxy.max_temp_file_size, DEFAULT_MAX_TEMP_FILE_SIZE);
        assert_eq!(location.set_headers.len(), 1);
        assert_eq!(location.set_headers[0].name, "x-real-ip");
        assert_eq!(location.set_headers[0].display_name, "X-Real-IP");
    }

    #[test]
    fn errors() {
        let conf = PassengerConf::from_yaml("set_headers:\n  X-Test: $unknown").unwrap();
        assert!(Locations::new(&conf).is_err());

        let conf =
            PassengerConf::from_yaml("locations:\n  /app:\n    buffers: {number: 1, size: 8}")
                .unwrap();
        assert!(Locations::new(&conf).is_err());

        let conf = PassengerConf::from_yaml("thread_count: 4").unwrap();
        assert!(Locations::new(&conf).is_err());
    }
}
