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

//! Serializes the merged settings of a location into the private `!~` header lines sent to the
//! core with every request.
//!
//! The result is computed once when the configuration is loaded. Requests only copy the prepared
//! bytes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write as _;

use crate::configuration::{KeyValueList, LocationConf};

/// Value of a single option in the private header block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue<'a> {
    /// Encoded as `t` or `f`
    Bool(bool),
    /// Encoded in decimal
    Int(i64),
    /// Encoded verbatim
    Str(&'a str),
}

fn decimal_len(value: i64) -> usize {
    let mut len = if value < 0 { 2 } else { 1 };
    let mut rest = value.unsigned_abs();
    while rest >= 10 {
        rest /= 10;
        len += 1;
    }
    len
}

impl OptionValue<'_> {
    fn encoded_len(&self) -> usize {
        match self {
            Self::Bool(_) => 1,
            Self::Int(value) => decimal_len(*value),
            Self::Str(value) => value.len(),
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        match self {
            Self::Bool(true) => out.put_u8(b't'),
            Self::Bool(false) => out.put_u8(b'f'),
            Self::Int(value) => {
                // BytesMut never fails writing
                let _ = write!(out, "{value}");
            }
            Self::Str(value) => out.put_slice(value.as_bytes()),
        }
    }
}

type Getter = for<'a> fn(&'a LocationConf) -> Option<OptionValue<'a>>;

/// An option transmitted to the core
#[derive(Debug)]
pub struct OptionField {
    /// Header name including the `!~` prefix
    pub header: &'static str,
    get: Getter,
}

impl OptionField {
    /// Retrieves the value of the option, `None` if it is unset.
    pub fn value<'a>(&self, conf: &'a LocationConf) -> Option<OptionValue<'a>> {
        (self.get)(conf)
    }
}

fn flag(value: &Option<bool>) -> Option<OptionValue<'_>> {
    value.map(OptionValue::Bool)
}

fn int<T: Copy + Into<i64>>(value: &Option<T>) -> Option<OptionValue<'_>> {
    value.map(|value| OptionValue::Int(value.into()))
}

fn text(value: &Option<String>) -> Option<OptionValue<'_>> {
    value.as_deref().map(OptionValue::Str)
}

macro_rules! options {
    ($($header:literal => $kind:ident($field:ident),)*) => {
        /// All options in the order they are sent
        pub static OPTIONS: &[OptionField] = &[
            $(
                OptionField {
                    header: $header,
                    get: |conf| $kind(&conf.$field),
                },
            )*
        ];
    };
}

options! {
    "!~PASSENGER_SOCKET_BACKLOG" => int(socket_backlog),
    "!~PASSENGER_CORE_FILE_DESCRIPTOR_ULIMIT" => int(core_file_descriptor_ulimit),
    "!~DISABLE_SECURITY_UPDATE_CHECK" => flag(disable_security_update_check),
    "!~SECURITY_UPDATE_CHECK_PROXY" => text(security_update_check_proxy),
    "!~PASSENGER_APP_FILE_DESCRIPTOR_ULIMIT" => int(app_file_descriptor_ulimit),
    "!~PASSENGER_RUBY" => text(ruby),
    "!~PASSENGER_PYTHON" => text(python),
    "!~PASSENGER_NODEJS" => text(nodejs),
    "!~PASSENGER_METEOR_APP_SETTINGS" => text(meteor_app_settings),
    "!~PASSENGER_APP_ENV" => text(environment),
    "!~PASSENGER_FRIENDLY_ERROR_PAGES" => flag(friendly_error_pages),
    "!~PASSENGER_MIN_PROCESSES" => int(min_instances),
    "!~PASSENGER_MAX_PROCESSES" => int(max_instances_per_app),
    "!~PASSENGER_MAX_REQUESTS" => int(max_requests),
    "!~PASSENGER_START_TIMEOUT" => int(start_timeout),
    "!~PASSENGER_USER" => text(user),
    "!~PASSENGER_GROUP" => text(group),
    "!~PASSENGER_APP_GROUP_NAME" => text(app_group_name),
    "!~PASSENGER_APP_ROOT" => text(app_root),
    "!~PASSENGER_APP_RIGHTS" => text(app_rights),
    "!~UNION_STATION_SUPPORT" => flag(union_station_support),
    "!~PASSENGER_DEBUGGER" => flag(debugger),
    "!~PASSENGER_MAX_PRELOADER_IDLE_TIME" => int(max_preloader_idle_time),
    "!~PASSENGER_SPAWN_METHOD" => text(spawn_method),
    "!~PASSENGER_LOAD_SHELL_ENVVARS" => flag(load_shell_envvars),
    "!~UNION_STATION_KEY" => text(union_station_key),
    "!~PASSENGER_MAX_REQUEST_QUEUE_SIZE" => int(max_request_queue_size),
    "!~PASSENGER_REQUEST_QUEUE_OVERFLOW_STATUS_CODE" => int(request_queue_overflow_status_code),
    "!~PASSENGER_RESTART_DIR" => text(restart_dir),
    "!~PASSENGER_STARTUP_FILE" => text(startup_file),
    "!~PASSENGER_STICKY_SESSIONS" => flag(sticky_sessions),
    "!~PASSENGER_STICKY_SESSIONS_COOKIE_NAME" => text(sticky_sessions_cookie_name),
    "!~PASSENGER_VARY_TURBOCACHE_BY_COOKIE" => text(vary_turbocache_by_cookie),
    "!~PASSENGER_ABORT_WEBSOCKETS_ON_PROCESS_SHUTDOWN" => flag(abort_websockets_on_process_shutdown),
    "!~PASSENGER_FORCE_MAX_CONCURRENT_REQUESTS_PER_PROCESS" => int(force_max_concurrent_requests_per_process),
}

/// Produces the header lines for all options set in `conf`, each terminated by CRLF.
pub fn build_options_cache(conf: &LocationConf) -> Bytes {
    let len = OPTIONS
        .iter()
        .filter_map(|option| {
            option
                .value(conf)
                .map(|value| option.header.len() + 2 + value.encoded_len() + 2)
        })
        .sum();

    let mut buf = BytesMut::with_capacity(len);
    for option in OPTIONS {
        if let Some(value) = option.value(conf) {
            buf.put_slice(option.header.as_bytes());
            buf.put_slice(b": ");
            value.encode(&mut buf);
            buf.put_slice(b"\r\n");
        }
    }
    debug_assert_eq!(buf.len(), len);
    buf.freeze()
}

/// Encodes environment variables as `key\0value\0` pairs in base64. Returns `None` if there are
/// no environment variables.
pub fn build_env_vars_cache(env_vars: &KeyValueList) -> Option<String> {
    if env_vars.is_empty() {
        return None;
    }

    let len = env_vars
        .iter()
        .map(|(key, value)| key.len() + value.len() + 2)
        .sum();
    let mut blob = Vec::with_capacity(len);
    for (key, value) in env_vars.iter() {
        blob.extend_from_slice(key.as_bytes());
        blob.push(0);
        blob.extend_from_slice(value.as_bytes());
        blob.push(0);
    }
    Some(STANDARD.encode(blob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use passenger_module_utils::FromYaml;

    #[test]
    fn unset_options_omitted() {
        assert!(build_options_cache(&LocationConf::default()).is_empty());
        assert!(build_env_vars_cache(&KeyValueList::default()).is_none());
    }

    #[test]
    fn encoding() {
        let conf = LocationConf::from_yaml(
            r#"
                enabled: true
                ruby: /usr/bin/ruby3
                friendly_error_pages: false
                sticky_sessions: true
                min_instances: 2
                force_max_concurrent_requests_per_process: -1
                environment: staging
                socket_backlog: 1024
            "#,
        )
        .unwrap();

        let cache = build_options_cache(&conf);
        assert_eq!(
            cache,
            concat!(
                "!~PASSENGER_SOCKET_BACKLOG: 1024\r\n",
                "!~PASSENGER_RUBY: /usr/bin/ruby3\r\n",
                "!~PASSENGER_APP_ENV: staging\r\n",
                "!~PASSENGER_FRIENDLY_ERROR_PAGES: f\r\n",
                "!~PASSENGER_MIN_PROCESSES: 2\r\n",
                "!~PASSENGER_STICKY_SESSIONS: t\r\n",
                "!~PASSENGER_FORCE_MAX_CONCURRENT_REQUESTS_PER_PROCESS: -1\r\n",
            )
        );

        // Same input, same bytes
        assert_eq!(build_options_cache(&conf.clone()), cache);
    }

    #[test]
    fn decimal_lengths() {
        for value in [0, 9, 10, 99, 100, -1, -10, i64::MAX, i64::MIN] {
            assert_eq!(decimal_len(value), value.to_string().len(), "{value}");
        }
    }

    #[test]
    fn integers_written_in_place() {
        for value in [0, 7, -42, 1_000_000, i64::MAX, i64::MIN] {
            let option = OptionValue::Int(value);
            let mut out = BytesMut::with_capacity(option.encoded_len());
            let capacity = out.capacity();
            option.encode(&mut out);
            assert_eq!(out, value.to_string().as_bytes(), "{value}");
            assert_eq!(out.len(), option.encoded_len(), "{value}");
            assert_eq!(out.capacity(), capacity, "{value}");
        }
    }

    #[test]
    fn unique_headers() {
        for (i, option) in OPTIONS.iter().enumerate() {
            assert!(option.header.starts_with("!~"));
            assert!(
                OPTIONS[i + 1..].iter().all(|o| o.header != option.header),
                "{} is duplicated",
                option.header
            );
        }
    }

    #[test]
    fn env_vars() {
        let env_vars: KeyValueList = [("RAILS_ENV", "production"), ("SECRET_KEY", "abc\ndef")]
            .into_iter()
            .collect();
        let cache = build_env_vars_cache(&env_vars).unwrap();
        assert_eq!(
            STANDARD.decode(cache).unwrap(),
            b"RAILS_ENV\0production\0SECRET_KEY\0abc\ndef\0"
        );
    }
}
