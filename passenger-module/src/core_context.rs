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

//! Connection to the core: starting it through the watchdog and publishing its socket address.

use log::{error, info, warn};
use passenger_module_utils::pingora::{Error, ErrorType};
use nix::unistd::{Gid, Group, Uid, User};
use passenger_support::watchdog_launcher::{ForkAction, WatchdogLauncher};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use crate::configuration::{ConfigError, MainConf};
use crate::{SERVER_SOFTWARE, SERVER_VERSION};

/// Socket and credentials of a running core
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CoreEndpoint {
    pub(crate) socket: PathBuf,
    pub(crate) password: String,
}

impl CoreEndpoint {
    fn parse(address: &str, password: impl Into<String>) -> Result<Self, ConfigError> {
        let path = address
            .strip_prefix("unix:")
            .filter(|path| path.starts_with('/'))
            .ok_or_else(|| ConfigError::new(format!("unsupported core address \"{address}\"")))?;
        Ok(Self {
            socket: PathBuf::from(path),
            password: password.into(),
        })
    }
}

type Owner = (Uid, Option<Gid>);

/// Looks up the owner of files handed over to the user the server runs as. Without an explicit
/// group the user’s primary group is used.
fn resolve_owner(user: &str, group: Option<&str>) -> Result<Owner, ConfigError> {
    let user = User::from_name(user)
        .map_err(|err| ConfigError::new(format!("cannot look up user \"{user}\": {err}")))?
        .ok_or_else(|| ConfigError::new(format!("user \"{user}\" does not exist")))?;
    let gid = match group {
        Some(group) => {
            Group::from_name(group)
                .map_err(|err| {
                    ConfigError::new(format!("cannot look up group \"{group}\": {err}"))
                })?
                .ok_or_else(|| ConfigError::new(format!("group \"{group}\" does not exist")))?
                .gid
        }
        None => user.gid,
    };
    Ok((user.uid, Some(gid)))
}

/// Process-wide handle of the core
///
/// The endpoint is published once the watchdog reported back, before any request is processed.
/// Requests arriving without a published endpoint are declined.
#[derive(Debug, Default)]
pub struct CoreContext {
    launcher: Mutex<WatchdogLauncher>,
    endpoint: OnceLock<CoreEndpoint>,
    pid_file_owner: Mutex<Option<Owner>>,
}

impl CoreContext {
    /// Creates a context without a running core.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context for a core started by other means, `address` has the format
    /// `unix:/path/to/socket`.
    pub fn with_endpoint(address: &str, password: &str) -> Result<Self, Box<Error>> {
        let endpoint = CoreEndpoint::parse(address, password).map_err(ConfigError::into_error)?;
        Ok(Self {
            endpoint: OnceLock::from(endpoint),
            ..Default::default()
        })
    }

    /// Makes the control process PID file belong to `user` and `group`. This is required if the
    /// server drops privileges after starting, the file has to remain writable then.
    pub fn set_pid_file_owner(&self, user: &str, group: Option<&str>) -> Result<(), Box<Error>> {
        let owner = resolve_owner(user, group).map_err(ConfigError::into_error)?;
        let mut pid_file_owner = self.pid_file_owner.lock().map_err(|_| {
            Error::explain(ErrorType::InternalError, "PID file owner lock poisoned")
        })?;
        *pid_file_owner = Some(owner);
        Ok(())
    }

    fn pid_file_owner(&self) -> Option<Owner> {
        self.pid_file_owner.lock().ok().and_then(|owner| *owner)
    }

    /// Starts the watchdog unless Passenger’s installation directory is unknown.
    ///
    /// Failure to start only disables the Passenger handler, unless `abort_on_startup_error` is
    /// set. A context that already has a core keeps it and doesn’t start another one.
    pub fn start(&self, conf: &MainConf) -> Result<(), Box<Error>> {
        let mut launcher = self.launcher.lock().map_err(|_| {
            Error::explain(ErrorType::InternalError, "watchdog launcher lock poisoned")
        })?;
        if let Some(endpoint) = self.endpoint() {
            warn!(
                "Phusion Passenger core already available at {}, not starting another one",
                endpoint.socket.display()
            );
            return Ok(());
        }

        let Some(root) = &conf.root_dir else {
            info!("Phusion Passenger disabled, no installation directory configured");
            return Ok(());
        };

        let mut actions = Vec::new();
        if conf.log_file.is_none() {
            warn!("no passenger log file configured, discarding log output");
        }
        actions.push(ForkAction::RedirectStdio {
            path: conf.log_file.as_ref().map(PathBuf::from),
        });

        let params = conf.watchdog_params(SERVER_SOFTWARE, SERVER_VERSION);
        if let Err(err) = launcher.start(root, &params, &actions) {
            error!("{err}");
            if conf.abort_on_startup_error {
                return Err(Error::because(
                    ErrorType::InternalError,
                    "failed starting Phusion Passenger",
                    err,
                ));
            }
            return Ok(());
        }

        if let Err(err) =
            launcher.write_control_process_pid(std::process::id(), self.pid_file_owner())
        {
            error!(
                "could not create {}/web_server_info/control_process.pid: {err}",
                launcher.instance_dir()
            );
        }

        match CoreEndpoint::parse(launcher.core_address(), launcher.core_password()) {
            Ok(endpoint) => match self.endpoint.set(endpoint) {
                Ok(()) => Ok(()),
                Err(endpoint) => {
                    error!(
                        "Phusion Passenger core at {} started while another one was published",
                        endpoint.socket.display()
                    );
                    launcher.shutdown();
                    Err(Error::explain(
                        ErrorType::InternalError,
                        "Phusion Passenger core started twice",
                    ))
                }
            },
            Err(err) => {
                error!("{err}");
                launcher.shutdown();
                if conf.abort_on_startup_error {
                    Err(err.into_error())
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Checks whether requests can be passed to the core.
    pub fn is_running(&self) -> bool {
        self.endpoint.get().is_some()
    }

    pub(crate) fn endpoint(&self) -> Option<&CoreEndpoint> {
        self.endpoint.get()
    }

    /// Records the current process ID in the instance directory. This has to be called again if
    /// the server process changed, e.g. after daemonizing.
    pub fn save_control_process_pid(&self) {
        let Ok(launcher) = self.launcher.lock() else {
            return;
        };
        if launcher.instance_dir().is_empty() {
            return;
        }
        if let Err(err) =
            launcher.write_control_process_pid(std::process::id(), self.pid_file_owner())
        {
            error!(
                "could not create {}/web_server_info/control_process.pid: {err}",
                launcher.instance_dir()
            );
        }
    }

    /// Shuts down the watchdog if this process started it.
    pub fn shutdown(&self) {
        if let Ok(mut launcher) = self.launcher.lock() {
            launcher.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passenger_module_utils::FromYaml;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use test_log::test;

    fn install_agent(root: &Path, script: &str) {
        let dir = root.join("support-binaries");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("PassengerAgent");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn endpoints() {
        let context = CoreContext::with_endpoint("unix:/tmp/core.sock", "secret").unwrap();
        assert!(context.is_running());
        assert_eq!(
            context.endpoint(),
            Some(&CoreEndpoint {
                socket: PathBuf::from("/tmp/core.sock"),
                password: "secret".to_owned(),
            })
        );

        assert!(CoreContext::with_endpoint("127.0.0.1:3000", "secret").is_err());
        assert!(CoreContext::with_endpoint("unix:relative.sock", "secret").is_err());
    }

    #[test]
    fn disabled() {
        let context = CoreContext::new();
        context.start(&MainConf::default()).unwrap();
        assert!(!context.is_running());
        context.save_control_process_pid();
        context.shutdown();
    }

    #[test]
    fn start_and_shutdown() {
        let tempdir = tempfile::tempdir().unwrap();
        let root = tempdir.path();
        let instance = root.join("instance");
        std::fs::create_dir_all(instance.join("web_server_info")).unwrap();
        install_agent(
            root,
            &format!(
                "read config\nread password\necho \"$config\" > {0}/config.json\necho {0} >&0\nread command",
                instance.display()
            ),
        );

        let conf = MainConf::from_yaml(format!(
            "root: {}\nlog_level: 5\nctl:\n  custom_option: \"[1, 2]\"",
            root.display()
        ))
        .unwrap();
        let context = CoreContext::new();
        context.start(&conf).unwrap();
        assert!(context.is_running());

        let endpoint = context.endpoint().unwrap();
        assert_eq!(endpoint.socket, instance.join("agents.s/core"));
        assert!(!endpoint.password.is_empty());

        let config: serde_json::Value =
            serde_json::from_slice(&std::fs::read(instance.join("config.json")).unwrap())
                .unwrap();
        assert_eq!(config["log_level"], 5);
        assert_eq!(config["server_software"], SERVER_SOFTWARE);
        assert_eq!(config["custom_option"], serde_json::json!([1, 2]));

        assert_eq!(
            std::fs::read_to_string(instance.join("web_server_info/control_process.pid"))
                .unwrap(),
            format!("{}\n", std::process::id())
        );

        context.shutdown();
    }

    #[test]
    fn owner_resolution() {
        assert_eq!(
            resolve_owner("root", None).unwrap(),
            (Uid::from_raw(0), Some(Gid::from_raw(0)))
        );
        assert_eq!(
            resolve_owner("root", Some("root")).unwrap(),
            (Uid::from_raw(0), Some(Gid::from_raw(0)))
        );
        assert_eq!(
            resolve_owner("no-such-user-here", None)
                .unwrap_err()
                .message(),
            "user \"no-such-user-here\" does not exist"
        );
        assert_eq!(
            resolve_owner("root", Some("no-such-group-here"))
                .unwrap_err()
                .message(),
            "group \"no-such-group-here\" does not exist"
        );

        let context = CoreContext::new();
        assert!(context.set_pid_file_owner("no-such-user-here", None).is_err());
        assert_eq!(context.pid_file_owner(), None);
    }

    #[test]
    fn pid_file_handed_over() {
        use std::os::unix::fs::MetadataExt;

        let tempdir = tempfile::tempdir().unwrap();
        let root = tempdir.path();
        let instance = root.join("instance");
        std::fs::create_dir_all(instance.join("web_server_info")).unwrap();
        install_agent(
            root,
            &format!(
                "read config\nread password\necho {} >&0\nread command",
                instance.display()
            ),
        );

        let user = User::from_uid(Uid::current()).unwrap().unwrap();
        let context = CoreContext::new();
        context.set_pid_file_owner(&user.name, None).unwrap();
        assert_eq!(context.pid_file_owner(), Some((user.uid, Some(user.gid))));

        let conf = MainConf::from_yaml(format!("root: {}", root.display())).unwrap();
        context.start(&conf).unwrap();
        assert!(context.is_running());

        let pid_file = instance.join("web_server_info/control_process.pid");
        let metadata = std::fs::metadata(&pid_file).unwrap();
        assert_eq!(metadata.uid(), user.uid.as_raw());
        assert_eq!(metadata.gid(), user.gid.as_raw());

        std::fs::remove_file(&pid_file).unwrap();
        context.save_control_process_pid();
        assert_eq!(std::fs::metadata(&pid_file).unwrap().uid(), user.uid.as_raw());

        context.shutdown();
    }

    #[test]
    fn existing_endpoint_kept() {
        let tempdir = tempfile::tempdir().unwrap();
        let root = tempdir.path();
        let marker = root.join("started");
        install_agent(root, &format!("touch {}", marker.display()));

        let context = CoreContext::with_endpoint("unix:/tmp/core.sock", "secret").unwrap();
        let conf = MainConf::from_yaml(format!("root: {}", root.display())).unwrap();
        context.start(&conf).unwrap();

        assert!(!marker.exists());
        assert_eq!(
            context.endpoint().unwrap().socket,
            PathBuf::from("/tmp/core.sock")
        );
    }

    #[test]
    fn startup_errors() {
        let tempdir = tempfile::tempdir().unwrap();
        let root = tempdir.path();
        install_agent(
            root,
            "read config\nread password\nprintf 'Watchdog startup error\\tno luck\\n' >&0",
        );

        let mut conf = MainConf::from_yaml(format!("root: {}", root.display())).unwrap();
        let context = CoreContext::new();
        context.start(&conf).unwrap();
        assert!(!context.is_running());

        conf.abort_on_startup_error = true;
        let context = CoreContext::new();
        assert!(context.start(&conf).is_err());
        assert!(!context.is_running());
    }
}
