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

//! Data structures required for `PassengerHandler` configuration
//!
//! The configuration file has three layers. Process-wide settings live below the `passenger` key.
//! The remaining top-level keys configure the server scope, and nested scopes are listed below
//! `locations`, keyed by their URI prefix:
//!
//! ```yaml
//! passenger:
//!   root: /usr/lib/passenger
//!   max_pool_size: 4
//! root: /srv/app/public
//! enabled: true
//! locations:
//!   /blog:
//!     base_uri: /blog
//!     environment: staging
//! ```
//!
//! Scope settings are all optional. An unset setting is inherited from the enclosing scope.

use clap::Parser;
use log::warn;
use passenger_module_utils::pingora::{Error, ErrorType};
use passenger_module_utils::OneOrMany;
use passenger_support::wrapper_registry;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Default size of the buffer receiving the response head
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
/// Default number of response buffers
pub const DEFAULT_BUFFERS_NUMBER: usize = 8;
/// Default limit for response data spilled into a temporary file
pub const DEFAULT_MAX_TEMP_FILE_SIZE: u64 = 1024 * 1024 * 1024;
/// Default connect, send and read timeout in milliseconds
pub const DEFAULT_TIMEOUT: u64 = 12_000_000;

const ENTERPRISE_URL: &str = "https://www.phusionpassenger.com/enterprise";

/// Error in the configuration, aborts loading it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    /// Creates an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Converts the error into a Pingora error.
    pub fn into_error(self) -> Box<Error> {
        Error::explain(ErrorType::InternalError, self.message)
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Command line options of the Passenger module
#[derive(Debug, Default, Parser)]
pub struct PassengerOpt {
    /// The directory Phusion Passenger is installed in. Requests are only passed on to
    /// applications if this is set.
    #[clap(long)]
    pub passenger_root: Option<String>,

    /// Exit if the Phusion Passenger core cannot be started.
    #[clap(long)]
    pub abort_on_startup_error: bool,
}

/// An ordered list of key/value pairs with unique keys
///
/// In the configuration file this is a mapping. Scalar values of any type are accepted and kept
/// as strings. Setting a key that is already present replaces the value but keeps the position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueList {
    entries: Vec<(String, String)>,
}

impl KeyValueList {
    /// Sets a value, keeping the position of an existing key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Looks up the value of a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for KeyValueList {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut list = Self::default();
        for (key, value) in iter {
            list.insert(key, value);
        }
        list
    }
}

fn scalar_to_string<E: serde::de::Error>(value: YamlValue) -> Result<String, E> {
    match value {
        YamlValue::String(value) => Ok(value),
        YamlValue::Number(value) => Ok(value.to_string()),
        YamlValue::Bool(value) => Ok(value.to_string()),
        YamlValue::Null => Ok(String::new()),
        _ => Err(E::custom("expected a scalar value")),
    }
}

impl<'de> Deserialize<'de> for KeyValueList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ListVisitor;

        impl<'de> Visitor<'de> for ListVisitor {
            type Value = KeyValueList;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("a mapping of names to values")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut list = KeyValueList::default();
                while let Some((key, value)) = map.next_entry::<YamlValue, YamlValue>()? {
                    list.insert(scalar_to_string(key)?, scalar_to_string(value)?);
                }
                Ok(list)
            }
        }

        deserializer.deserialize_map(ListVisitor)
    }
}

/// Conditions under which a failed request to the core is attempted once more
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextUpstream {
    /// Connecting, sending the request or reading the response head failed.
    Error,
    /// A timeout occurred while connecting, sending the request or reading the response head.
    Timeout,
    /// The core sent an invalid response head.
    InvalidHeader,
    /// The core responded with 500.
    Http500,
    /// The core responded with 502.
    Http502,
    /// The core responded with 503.
    Http503,
    /// The core responded with 504.
    Http504,
    /// The core responded with 403.
    Http403,
    /// The core responded with 404.
    Http404,
    /// Never retry, overrides everything else.
    Off,
}

impl NextUpstream {
    /// The status code this condition matches, if any
    pub fn status(self) -> Option<u16> {
        match self {
            Self::Http500 => Some(500),
            Self::Http502 => Some(502),
            Self::Http503 => Some(503),
            Self::Http504 => Some(504),
            Self::Http403 => Some(403),
            Self::Http404 => Some(404),
            _ => None,
        }
    }
}

/// Number and size of the buffers holding response data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BuffersConf {
    /// Number of buffers
    pub number: usize,
    /// Size of a single buffer in bytes
    pub size: usize,
}

impl Default for BuffersConf {
    fn default() -> Self {
        Self {
            number: DEFAULT_BUFFERS_NUMBER,
            size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Options kept for compatibility with older or commercial configurations
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CompatConf {
    rails_framework_spawner_idle_time: Option<YamlValue>,
    use_global_queue: Option<YamlValue>,
    fly_with: Option<YamlValue>,
    max_instances: Option<YamlValue>,
    max_request_time: Option<YamlValue>,
    memory_limit: Option<YamlValue>,
    concurrency_model: Option<YamlValue>,
    thread_count: Option<YamlValue>,
    rolling_restarts: Option<YamlValue>,
    resist_deployment_errors: Option<YamlValue>,
}

impl CompatConf {
    /// Logs a message for deprecated options and rejects options that are only supported by the
    /// commercial edition.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.rails_framework_spawner_idle_time.is_some() {
            warn!("The 'rails_framework_spawner_idle_time' directive is deprecated; please set 'passenger_max_preloader_idle_time' instead");
        }
        if self.use_global_queue.is_some() {
            warn!("The 'passenger_use_global_queue' directive is obsolete and doesn't do anything anymore. Global queuing is now always enabled. Please remove this configuration directive.");
        }

        let enterprise = [
            ("fly_with", &self.fly_with),
            ("max_instances", &self.max_instances),
            ("max_request_time", &self.max_request_time),
            ("memory_limit", &self.memory_limit),
            ("concurrency_model", &self.concurrency_model),
            ("thread_count", &self.thread_count),
            ("rolling_restarts", &self.rolling_restarts),
            ("resist_deployment_errors", &self.resist_deployment_errors),
        ];
        if let Some((name, _)) = enterprise.iter().find(|(_, value)| value.is_some()) {
            return Err(ConfigError::new(format!(
                "\"passenger_{name}\": this feature is only available in Phusion Passenger Enterprise. You are currently running the open source Phusion Passenger. Please learn more about and/or buy Phusion Passenger Enterprise at {ENTERPRISE_URL} ;"
            )));
        }
        Ok(())
    }
}

/// Settings of a scope
///
/// Every setting is optional, see [`LocationConf::merge`] for the inheritance rules.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LocationConf {
    /// Pass requests in this scope on to applications.
    pub enabled: Option<bool>,
    /// Show detailed error pages if an application fails to start.
    pub friendly_error_pages: Option<bool>,
    /// Load environment variables from the shell startup files before starting applications.
    pub load_shell_envvars: Option<bool>,
    /// Route requests of one client to the same application process.
    pub sticky_sessions: Option<bool>,
    /// Enable the debugger of Ruby applications.
    pub debugger: Option<bool>,
    /// Enable Union Station support.
    pub union_station_support: Option<bool>,
    /// Close WebSocket connections when an application process shuts down.
    pub abort_websockets_on_process_shutdown: Option<bool>,
    /// Don’t check for security updates.
    pub disable_security_update_check: Option<bool>,

    /// Minimal number of application processes.
    pub min_instances: Option<u32>,
    /// Maximal number of processes per application.
    pub max_instances_per_app: Option<u32>,
    /// Number of requests after which an application process is restarted.
    pub max_requests: Option<u32>,
    /// Time in seconds an application may take to start.
    pub start_timeout: Option<u32>,
    /// Time in seconds after which an idle preloader process shuts down.
    #[serde(alias = "rails_app_spawner_idle_time")]
    pub max_preloader_idle_time: Option<u32>,
    /// Maximal number of requests waiting for an application process.
    pub max_request_queue_size: Option<u32>,
    /// Status code returned if the request queue is full.
    pub request_queue_overflow_status_code: Option<u16>,
    /// Overrides the number of concurrent requests a process is assumed to handle.
    pub force_max_concurrent_requests_per_process: Option<i32>,
    /// File descriptor limit of application processes.
    pub app_file_descriptor_ulimit: Option<u32>,
    /// Listen backlog of the core socket.
    pub socket_backlog: Option<u32>,
    /// File descriptor limit of the core.
    pub core_file_descriptor_ulimit: Option<u32>,

    /// Ruby interpreter
    pub ruby: Option<String>,
    /// Python interpreter
    pub python: Option<String>,
    /// Node.js interpreter
    pub nodejs: Option<String>,
    /// Application environment, e.g. `production`
    #[serde(alias = "app_env", alias = "rails_env", alias = "rack_env")]
    pub environment: Option<String>,
    /// User to run applications as. This is `app_user` in the configuration file, `user` is the
    /// user of the server itself.
    #[serde(rename = "app_user")]
    pub user: Option<String>,
    /// Group to run applications as, `app_group` in the configuration file.
    #[serde(rename = "app_group")]
    pub group: Option<String>,
    /// Name of the application group, derived from the application root if unset.
    pub app_group_name: Option<String>,
    /// Application root directory, skips detection if set.
    pub app_root: Option<String>,
    /// Rights of the application processes in the core.
    pub app_rights: Option<String>,
    /// `smart` or `direct`
    #[serde(alias = "rails_spawn_method")]
    pub spawn_method: Option<String>,
    /// Directory containing `restart.txt`
    pub restart_dir: Option<String>,
    /// Application startup file
    pub startup_file: Option<String>,
    /// Application type, skips marker detection if set.
    pub app_type: Option<String>,
    /// Cookie used for sticky sessions
    pub sticky_sessions_cookie_name: Option<String>,
    /// Cookie varying the turbocache
    pub vary_turbocache_by_cookie: Option<String>,
    /// Union Station key
    pub union_station_key: Option<String>,
    /// Proxy used for security update checks
    pub security_update_check_proxy: Option<String>,
    /// Meteor settings file
    pub meteor_app_settings: Option<String>,
    /// Document root used for applications mounted below a base URI
    pub document_root: Option<String>,

    /// URI prefixes applications are mounted at
    #[serde(alias = "base_uri")]
    pub base_uris: OneOrMany<String>,
    /// Union Station filters
    pub union_station_filters: OneOrMany<String>,
    /// Environment variables of the applications
    #[serde(alias = "env_var")]
    pub env_vars: KeyValueList,

    /// Request headers to set, values may contain variables like `$host`
    #[serde(alias = "set_header")]
    pub set_headers: KeyValueList,
    /// `X-Accel-*` response headers to pass on to the client
    #[serde(alias = "pass_header")]
    pub pass_headers: OneOrMany<String>,
    /// Response headers losing their special meaning
    #[serde(alias = "ignore_header")]
    pub ignore_headers: OneOrMany<String>,
    /// Timeout connecting to the core, in milliseconds
    pub connect_timeout: Option<u64>,
    /// Timeout sending data to the core, in milliseconds
    pub send_timeout: Option<u64>,
    /// Timeout reading data from the core, in milliseconds
    pub read_timeout: Option<u64>,
    /// Conditions for repeating a request
    pub next_upstream: Option<OneOrMany<NextUpstream>>,
    /// Maximal number of attempts, 0 for no limit
    pub next_upstream_tries: Option<u32>,
    /// Time in milliseconds after which a request is no longer repeated, 0 for no limit
    pub next_upstream_timeout: Option<u64>,
    /// Size of the buffer receiving the response head
    pub buffer_size: Option<usize>,
    /// Buffers holding the response data
    pub buffers: Option<BuffersConf>,
    /// Limit of buffers busy sending data to the client
    pub busy_buffers_size: Option<usize>,
    /// Amount of data written to a temporary file at once
    pub temp_file_write_size: Option<usize>,
    /// Maximal size of the temporary file, 0 to disable temporary files
    pub max_temp_file_size: Option<u64>,
    /// Receive the complete response before sending it to the client.
    pub buffer_response: Option<bool>,
    /// Keep buffered responses in temporary files.
    pub store: Option<bool>,
    /// Cache responses.
    pub cache: Option<bool>,
    /// Replace error responses by the standard error pages.
    pub intercept_errors: Option<bool>,
    /// Keep processing the response if the client goes away.
    pub ignore_client_abort: Option<bool>,

    /// Deprecated and unsupported options
    #[serde(flatten)]
    pub compat: CompatConf,
}

trait MergeValue: Sized {
    fn merge_value(parent: &Self, child: &Self) -> Self;
}

impl<T: Clone> MergeValue for Option<T> {
    fn merge_value(parent: &Self, child: &Self) -> Self {
        child.as_ref().or(parent.as_ref()).cloned()
    }
}

impl<T: Clone + PartialEq> MergeValue for OneOrMany<T> {
    fn merge_value(parent: &Self, child: &Self) -> Self {
        let mut result = parent.clone();
        for value in child {
            if !result.contains(value) {
                result.push(value.clone());
            }
        }
        result
    }
}

impl MergeValue for KeyValueList {
    fn merge_value(parent: &Self, child: &Self) -> Self {
        let mut result = parent.clone();
        for (key, value) in child.iter() {
            result.insert(key, value);
        }
        result
    }
}

impl MergeValue for CompatConf {
    fn merge_value(_parent: &Self, child: &Self) -> Self {
        child.clone()
    }
}

macro_rules! merge_fields {
    ($parent:ident, $child:ident, $($field:ident,)*) => {
        LocationConf {
            $(
                $field: MergeValue::merge_value(&$parent.$field, &$child.$field),
            )*
        }
    };
}

impl LocationConf {
    /// Produces the effective settings of a scope nested into another one.
    ///
    /// Settings of the child take precedence. Lists contain the parent’s values followed by the
    /// child’s values, key/value lists take the child’s value for keys present in both. Merging
    /// the same parent twice has no additional effect.
    pub fn merge(parent: &Self, child: &Self) -> Self {
        merge_fields!(
            parent,
            child,
            enabled,
            friendly_error_pages,
            load_shell_envvars,
            sticky_sessions,
            debugger,
            union_station_support,
            abort_websockets_on_process_shutdown,
            disable_security_update_check,
            min_instances,
            max_instances_per_app,
            max_requests,
            start_timeout,
            max_preloader_idle_time,
            max_request_queue_size,
            request_queue_overflow_status_code,
            force_max_concurrent_requests_per_process,
            app_file_descriptor_ulimit,
            socket_backlog,
            core_file_descriptor_ulimit,
            ruby,
            python,
            nodejs,
            environment,
            user,
            group,
            app_group_name,
            app_root,
            app_rights,
            spawn_method,
            restart_dir,
            startup_file,
            app_type,
            sticky_sessions_cookie_name,
            vary_turbocache_by_cookie,
            union_station_key,
            security_update_check_proxy,
            meteor_app_settings,
            document_root,
            base_uris,
            union_station_filters,
            env_vars,
            set_headers,
            pass_headers,
            ignore_headers,
            connect_timeout,
            send_timeout,
            read_timeout,
            next_upstream,
            next_upstream_tries,
            next_upstream_timeout,
            buffer_size,
            buffers,
            busy_buffers_size,
            temp_file_write_size,
            max_temp_file_size,
            buffer_response,
            store,
            cache,
            intercept_errors,
            ignore_client_abort,
            compat,
        )
    }

    /// Checks the settings of a single scope before merging. Enabling either `store` or `cache`
    /// turns the other one off.
    pub fn prepare(&mut self) -> Result<(), ConfigError> {
        self.compat.check()?;

        match (self.store, self.cache) {
            (Some(true), Some(true)) => {
                return Err(ConfigError::new(
                    "\"passenger_store\" is incompatible with \"passenger_cache\"",
                ))
            }
            (Some(true), None) => self.cache = Some(false),
            (None, Some(true)) => self.store = Some(false),
            _ => {}
        }
        if self.cache == Some(true) {
            warn!("response caching is not supported, ignoring passenger_cache");
        }

        if let Some(app_type) = &self.app_type {
            if wrapper_registry::lookup(app_type).is_none() {
                return Err(ConfigError::new(format!(
                    "\"passenger_app_type\": unknown application type \"{app_type}\""
                )));
            }
        }
        Ok(())
    }

    /// Validates merged settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let buffers = self.buffers.unwrap_or_default();

        if buffers.number < 2 {
            return Err(ConfigError::new(
                "there must be at least 2 \"passenger_buffers\"",
            ));
        }

        let size = buffer_size.max(buffers.size);

        let busy_buffers_size = self.busy_buffers_size.unwrap_or(size.saturating_mul(2));
        if busy_buffers_size < size {
            return Err(ConfigError::new("\"passenger_busy_buffers_size\" must be equal to or greater than the maximum of the value of \"passenger_buffer_size\" and one of the \"passenger_buffers\""));
        }
        if busy_buffers_size > (buffers.number - 1).saturating_mul(buffers.size) {
            return Err(ConfigError::new("\"passenger_busy_buffers_size\" must be less than the size of all \"passenger_buffers\" minus one buffer"));
        }

        let temp_file_write_size = self.temp_file_write_size.unwrap_or(size.saturating_mul(2));
        if temp_file_write_size < size {
            return Err(ConfigError::new("\"passenger_temp_file_write_size\" must be equal to or greater than the maximum of the value of \"passenger_buffer_size\" and one of the \"passenger_buffers\""));
        }

        let max_temp_file_size = self
            .max_temp_file_size
            .unwrap_or(DEFAULT_MAX_TEMP_FILE_SIZE);
        if max_temp_file_size != 0 && max_temp_file_size < size as u64 {
            return Err(ConfigError::new("\"passenger_max_temp_file_size\" must be equal to zero to disable temporary files usage or must be equal to or greater than the maximum of the value of \"passenger_buffer_size\" and one of the \"passenger_buffers\""));
        }

        Ok(())
    }
}

/// A scope of the configuration: the server itself or a location within it
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScopeConf {
    /// Directory that URIs of this scope are mapped to
    pub root: Option<String>,
    /// Include the server version in the `Server` header.
    pub server_tokens: Option<bool>,
    /// Passenger settings of this scope
    #[serde(flatten)]
    pub location: LocationConf,
    /// Nested scopes, keyed by URI prefix
    pub locations: BTreeMap<String, ScopeConf>,
}

/// Process-wide settings, below the `passenger` key of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MainConf {
    /// Installation directory of Phusion Passenger
    #[serde(rename = "root")]
    pub root_dir: Option<String>,
    /// Default Ruby interpreter
    #[serde(rename = "ruby")]
    pub default_ruby: String,
    /// Log level of the core, 0 to 7
    pub log_level: u32,
    /// Log file of the core, standard error if unset
    pub log_file: Option<String>,
    /// Log file for file descriptor tracking
    pub file_descriptor_log_file: Option<String>,
    /// Directory for buffering request bodies
    pub data_buffer_dir: Option<String>,
    /// Directory to create the instance directory in
    pub instance_registry_dir: Option<String>,
    /// URLs of applications to start right away
    #[serde(rename = "pre_start")]
    pub prestart_uris: OneOrMany<String>,
    /// Exit if the core cannot be started.
    pub abort_on_startup_error: bool,
    /// Maximal number of application processes
    pub max_pool_size: u32,
    /// Time in seconds after which idle application processes are shut down
    pub pool_idle_time: u32,
    /// Response size at which the core stops reading from an application
    pub response_buffer_high_watermark: u64,
    /// Interval in seconds during which file system checks are cached
    pub stat_throttle_rate: u32,
    /// Add the Passenger version to the `Server` header.
    pub show_version_in_header: bool,
    /// Enable the core’s response cache.
    pub turbocaching: bool,
    /// Run applications as the owner of their startup file.
    pub user_switching: bool,
    /// User applications run as if user switching doesn’t apply
    pub default_user: String,
    /// Group applications run as if user switching doesn’t apply
    pub default_group: Option<String>,
    /// Owner of the analytics log
    pub analytics_log_user: String,
    /// Group of the analytics log
    pub analytics_log_group: Option<String>,
    /// Don’t check for security updates.
    pub disable_security_update_check: bool,
    /// Proxy used for security update checks
    pub security_update_check_proxy: Option<String>,
    /// Listen backlog of the core socket
    pub socket_backlog: u32,
    /// File descriptor limit of the core
    pub core_file_descriptor_ulimit: Option<u32>,
    /// Enable Union Station support.
    pub union_station_support: bool,
    /// Union Station gateway host
    pub union_station_gateway_address: String,
    /// Union Station gateway port
    pub union_station_gateway_port: u16,
    /// Certificate of the Union Station gateway
    pub union_station_gateway_cert: Option<String>,
    /// Proxy for Union Station connections
    pub union_station_proxy_address: Option<String>,
    /// Settings passed to the core verbatim, overriding anything else
    pub ctl: KeyValueList,
}

impl Default for MainConf {
    fn default() -> Self {
        Self {
            root_dir: None,
            default_ruby: "ruby".to_owned(),
            log_level: 3,
            log_file: None,
            file_descriptor_log_file: None,
            data_buffer_dir: None,
            instance_registry_dir: None,
            prestart_uris: Default::default(),
            abort_on_startup_error: false,
            max_pool_size: 6,
            pool_idle_time: 300,
            response_buffer_high_watermark: 128 * 1024 * 1024,
            stat_throttle_rate: 10,
            show_version_in_header: true,
            turbocaching: true,
            user_switching: true,
            default_user: "nobody".to_owned(),
            default_group: None,
            analytics_log_user: "nobody".to_owned(),
            analytics_log_group: None,
            disable_security_update_check: false,
            security_update_check_proxy: None,
            socket_backlog: 2048,
            core_file_descriptor_ulimit: None,
            union_station_support: false,
            union_station_gateway_address: "gateway.unionstationapp.com".to_owned(),
            union_station_gateway_port: 443,
            union_station_gateway_cert: None,
            union_station_proxy_address: None,
            ctl: Default::default(),
        }
    }
}

impl MainConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: PassengerOpt) {
        if opt.passenger_root.is_some() {
            self.root_dir = opt.passenger_root;
        }

        if opt.abort_on_startup_error {
            self.abort_on_startup_error = true;
        }
    }

    /// Checks the settings the core is started with. Nothing is checked while Passenger isn’t
    /// enabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_dir.is_none() {
            return Ok(());
        }

        if !matches!(nix::unistd::User::from_name(&self.default_user), Ok(Some(_))) {
            return Err(ConfigError::new(
                "The user specified by the 'default_user' option does not exist.",
            ));
        }

        if let Some(group) = &self.default_group {
            if !matches!(nix::unistd::Group::from_name(group), Ok(Some(_))) {
                return Err(ConfigError::new(
                    "The group specified by the 'default_group' option does not exist.",
                ));
            }
        }

        Ok(())
    }

    /// Produces the parameters document the watchdog is started with.
    pub fn watchdog_params(&self, server_software: &str, server_version: &str) -> JsonValue {
        fn optional(value: &Option<String>) -> JsonValue {
            JsonValue::String(value.clone().unwrap_or_default())
        }

        let mut params = Map::new();
        params.insert(
            "web_server_control_process_pid".into(),
            std::process::id().into(),
        );
        params.insert("server_software".into(), server_software.into());
        params.insert("server_version".into(), server_version.into());
        params.insert("multi_app".into(), true.into());
        params.insert("load_shell_envvars".into(), true.into());
        params.insert("integration_mode".into(), "nginx".into());
        params.insert(
            "passenger_root".into(),
            optional(&self.root_dir),
        );
        params.insert("log_level".into(), self.log_level.into());
        if let Some(log_file) = &self.log_file {
            params.insert("log_file".into(), log_file.as_str().into());
        }
        params.insert(
            "file_descriptor_log_file".into(),
            optional(&self.file_descriptor_log_file),
        );
        params.insert("socket_backlog".into(), self.socket_backlog.into());
        params.insert("data_buffer_dir".into(), optional(&self.data_buffer_dir));
        params.insert(
            "instance_registry_dir".into(),
            optional(&self.instance_registry_dir),
        );
        params.insert(
            "disable_security_update_check".into(),
            self.disable_security_update_check.into(),
        );
        params.insert(
            "security_update_check_proxy".into(),
            optional(&self.security_update_check_proxy),
        );
        params.insert("user_switching".into(), self.user_switching.into());
        params.insert(
            "show_version_in_header".into(),
            self.show_version_in_header.into(),
        );
        params.insert("turbocaching".into(), self.turbocaching.into());
        params.insert("default_user".into(), self.default_user.as_str().into());
        if !self.user_switching {
            params.insert("user".into(), self.default_user.as_str().into());
        }
        params.insert("default_group".into(), optional(&self.default_group));
        params.insert("default_ruby".into(), self.default_ruby.as_str().into());
        params.insert("max_pool_size".into(), self.max_pool_size.into());
        params.insert("pool_idle_time".into(), self.pool_idle_time.into());
        params.insert(
            "response_buffer_high_watermark".into(),
            self.response_buffer_high_watermark.into(),
        );
        params.insert("stat_throttle_rate".into(), self.stat_throttle_rate.into());
        params.insert(
            "analytics_log_user".into(),
            self.analytics_log_user.as_str().into(),
        );
        params.insert(
            "analytics_log_group".into(),
            optional(&self.analytics_log_group),
        );
        params.insert(
            "union_station_support".into(),
            self.union_station_support.into(),
        );
        params.insert(
            "union_station_gateway_address".into(),
            self.union_station_gateway_address.as_str().into(),
        );
        params.insert(
            "union_station_gateway_port".into(),
            self.union_station_gateway_port.into(),
        );
        params.insert(
            "union_station_gateway_cert".into(),
            optional(&self.union_station_gateway_cert),
        );
        params.insert(
            "union_station_proxy_address".into(),
            optional(&self.union_station_proxy_address),
        );
        params.insert(
            "prestart_urls".into(),
            self.prestart_uris
                .iter()
                .map(|uri| JsonValue::from(uri.as_str()))
                .collect(),
        );
        if let Some(ulimit) = self.core_file_descriptor_ulimit {
            params.insert("core_file_descriptor_ulimit".into(), ulimit.into());
        }

        for (key, value) in self.ctl.iter() {
            let value = serde_json::from_str(value).unwrap_or_else(|_| value.into());
            params.insert(key.to_owned(), value);
        }

        JsonValue::Object(params)
    }
}

/// Configuration file settings of the Passenger module
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PassengerConf {
    /// Process-wide settings
    pub passenger: MainConf,
    /// The server scope with its nested locations
    #[serde(flatten)]
    pub server: ScopeConf,
}

impl PassengerConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: PassengerOpt) {
        self.passenger.merge_with_opt(opt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passenger_module_utils::FromYaml;
    use test_log::test;

    fn location(yaml: &str) -> LocationConf {
        LocationConf::from_yaml(yaml).unwrap()
    }

    #[test]
    fn layout() {
        let conf = PassengerConf::from_yaml(
            r#"
                passenger:
                    root: /opt/passenger
                    max_pool_size: 2
                    ctl:
                        foo: "12"
                        bar: baz
                root: /srv/app/public
                enabled: true
                app_user: app
                server_tokens: false
                locations:
                    /blog:
                        base_uri: /blog
                        rails_env: staging
                        locations:
                            /blog/admin:
                                enabled: false
            "#,
        )
        .unwrap();

        assert_eq!(conf.passenger.root_dir.as_deref(), Some("/opt/passenger"));
        assert_eq!(conf.passenger.max_pool_size, 2);
        assert_eq!(conf.passenger.stat_throttle_rate, 10);
        assert_eq!(conf.passenger.ctl.get("foo"), Some("12"));

        assert_eq!(conf.server.root.as_deref(), Some("/srv/app/public"));
        assert_eq!(conf.server.server_tokens, Some(false));
        assert_eq!(conf.server.location.enabled, Some(true));
        assert_eq!(conf.server.location.user.as_deref(), Some("app"));

        let blog = &conf.server.locations["/blog"];
        assert_eq!(*blog.location.base_uris, vec!["/blog".to_owned()]);
        assert_eq!(blog.location.environment.as_deref(), Some("staging"));
        assert_eq!(blog.locations["/blog/admin"].location.enabled, Some(false));
    }

    #[test]
    fn aliases() {
        let conf = location(
            "rails_spawn_method: direct\nrack_env: test\nrails_app_spawner_idle_time: 10\nenv_var: {A: 1}",
        );
        assert_eq!(conf.spawn_method.as_deref(), Some("direct"));
        assert_eq!(conf.environment.as_deref(), Some("test"));
        assert_eq!(conf.max_preloader_idle_time, Some(10));
        assert_eq!(conf.env_vars.get("A"), Some("1"));
    }

    #[test]
    fn key_value_order() {
        let conf = location("env_vars:\n  ZETA: z\n  ALPHA: a\n  FLAG: true");
        let entries: Vec<_> = conf.env_vars.iter().collect();
        assert_eq!(entries, vec![("ZETA", "z"), ("ALPHA", "a"), ("FLAG", "true")]);
    }

    #[test]
    fn merge() {
        let parent = location(
            "enabled: true\nenvironment: production\nbase_uris: [/a]\nenv_vars: {A: '1', B: '2'}",
        );
        let child =
            location("environment: staging\nbase_uris: [/b, /a]\nenv_vars: {B: '3', C: '4'}");

        let merged = LocationConf::merge(&parent, &child);
        assert_eq!(merged.enabled, Some(true));
        assert_eq!(merged.environment.as_deref(), Some("staging"));
        assert_eq!(*merged.base_uris, vec!["/a".to_owned(), "/b".to_owned()]);
        let env: Vec<_> = merged.env_vars.iter().collect();
        assert_eq!(env, vec![("A", "1"), ("B", "3"), ("C", "4")]);

        // Unset values never override set ones
        let merged = LocationConf::merge(&parent, &LocationConf::default());
        assert_eq!(merged, parent);

        // Merging the same parent twice changes nothing
        for (a, b) in [(&parent, &child), (&child, &parent)] {
            let once = LocationConf::merge(a, b);
            assert_eq!(LocationConf::merge(a, &once), once);
        }
    }

    #[test]
    fn store_and_cache() {
        let mut conf = location("store: true");
        conf.prepare().unwrap();
        assert_eq!(conf.cache, Some(false));

        let mut conf = location("cache: true");
        conf.prepare().unwrap();
        assert_eq!(conf.store, Some(false));

        let mut conf = location("cache: true\nstore: true");
        assert!(conf.prepare().is_err());
    }

    #[test]
    fn compat_options() {
        let mut conf = location("use_global_queue: true\nrails_framework_spawner_idle_time: 0");
        conf.prepare().unwrap();

        let mut conf = location("memory_limit: 200");
        let err = conf.prepare().unwrap_err();
        assert!(err
            .message()
            .starts_with("\"passenger_memory_limit\": this feature is only available in Phusion Passenger Enterprise."));

        let mut conf = location("app_type: cobol");
        assert!(conf.prepare().is_err());
        let mut conf = location("app_type: rails");
        conf.prepare().unwrap();
    }

    #[test]
    fn buffer_validation() {
        location("{}").validate().unwrap();

        let err = location("buffers: {number: 1, size: 4096}")
            .validate()
            .unwrap_err();
        assert_eq!(
            err.message(),
            "there must be at least 2 \"passenger_buffers\""
        );

        let err = location("busy_buffers_size: 1024").validate().unwrap_err();
        assert!(err.message().contains("must be equal to or greater than"));

        let err = location("busy_buffers_size: 1000000")
            .validate()
            .unwrap_err();
        assert!(err.message().contains("minus one buffer"));

        let err = location("temp_file_write_size: 1024")
            .validate()
            .unwrap_err();
        assert!(err.message().starts_with("\"passenger_temp_file_write_size\""));

        let err = location("max_temp_file_size: 1024")
            .validate()
            .unwrap_err();
        assert!(err.message().starts_with("\"passenger_max_temp_file_size\""));
        location("max_temp_file_size: 0").validate().unwrap();
    }

    #[test]
    fn buffers_larger_than_buffer_size() {
        // Defaults derive from the larger of the two sizes.
        location("buffers: {number: 8, size: 65536}").validate().unwrap();
        location("buffer_size: 32768").validate().unwrap();
        location("{buffer_size: 65536, buffers: {number: 4, size: 65536}}")
            .validate()
            .unwrap();
        let err = location("buffer_size: 65536").validate().unwrap_err();
        assert!(err.message().contains("minus one buffer"));

        // Upper bound is inclusive: all buffers minus one.
        location("{buffers: {number: 8, size: 65536}, busy_buffers_size: 458752}")
            .validate()
            .unwrap();
        let err = location("{buffers: {number: 8, size: 65536}, busy_buffers_size: 458753}")
            .validate()
            .unwrap_err();
        assert!(err.message().contains("minus one buffer"));

        let err = location("{buffers: {number: 8, size: 65536}, busy_buffers_size: 16384}")
            .validate()
            .unwrap_err();
        assert!(err.message().contains("must be equal to or greater than"));

        let err = location("{buffers: {number: 8, size: 65536}, temp_file_write_size: 16384}")
            .validate()
            .unwrap_err();
        assert!(err.message().starts_with("\"passenger_temp_file_write_size\""));
        location("{buffers: {number: 8, size: 65536}, temp_file_write_size: 65536}")
            .validate()
            .unwrap();
    }

    #[test]
    fn next_upstream() {
        let conf = location("next_upstream: [error, http_502]");
        let conditions = conf.next_upstream.unwrap().into_inner();
        assert_eq!(conditions, vec![NextUpstream::Error, NextUpstream::Http502]);
        assert_eq!(NextUpstream::Http502.status(), Some(502));
        assert_eq!(location("next_upstream: off").next_upstream.unwrap().len(), 1);
    }

    #[test]
    fn watchdog_params() {
        let conf = PassengerConf::from_yaml(
            r#"
                passenger:
                    root: /opt/passenger
                    user_switching: false
                    ctl:
                        max_pool_size: "12"
                        custom: "some text"
                        flag: "true"
            "#,
        )
        .unwrap();
        let params = conf.passenger.watchdog_params("test-server/1.0", "1.0");
        assert_eq!(params["passenger_root"], "/opt/passenger");
        assert_eq!(params["server_software"], "test-server/1.0");
        assert_eq!(params["integration_mode"], "nginx");
        assert_eq!(params["multi_app"], true);
        assert_eq!(params["user"], "nobody");
        assert_eq!(params["max_pool_size"], 12);
        assert_eq!(params["custom"], "some text");
        assert_eq!(params["flag"], true);
        assert_eq!(params["prestart_urls"], serde_json::json!([]));
        assert!(params.get("core_file_descriptor_ulimit").is_none());
    }
}
