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

//! Starts the watchdog process, which in turn starts the core, and shuts it down again.
//!
//! The watchdog gets one end of a socket pair as its standard input, this is the feedback
//! channel. The launcher writes the configuration (a single line of JSON) and the password
//! requests have to carry into the channel. The watchdog answers with a single line: either the
//! path of its instance directory or a tab-separated error report.
//!
//! The watchdog runs in its own process group, so that shutting it down also reaches the core and
//! any application processes.

use base64::Engine as _;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{chown, Gid, Pid, Uid};
use std::fmt::{Display, Formatter};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const PROGRAM_NAME: &str = "Phusion Passenger";
const AGENT_EXE: &str = "PassengerAgent";
const PASSENGER_ROOT_DOC_URL: &str =
    "https://www.phusionpassenger.com/library/config/nginx/reference/#passenger_root";
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Error starting the watchdog
#[derive(Debug)]
pub struct LaunchError {
    message: String,
    source: Option<io::Error>,
}

impl LaunchError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    fn because(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            message: message.into(),
            source: Some(source),
        }
    }
}

impl Display for LaunchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|err| -> &(dyn std::error::Error + 'static) { err })
    }
}

/// Preparations applied to the watchdog process before it starts running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkAction {
    /// Send standard output and standard error to the given log file (appending), or discard
    /// them if no file is given.
    RedirectStdio {
        /// Log file path
        path: Option<PathBuf>,
    },
    /// Set an environment variable.
    ApplyEnv {
        /// Variable name
        key: String,
        /// Variable value
        value: String,
    },
    /// Make sure that a file descriptor of this process isn’t inherited.
    CloseFd {
        /// The file descriptor
        fd: RawFd,
    },
}

/// State of the launcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherState {
    /// Nothing has been started yet
    New,
    /// Waiting for the watchdog to report back
    Starting,
    /// Watchdog is up and running
    Running,
    /// Watchdog failed to start
    Failed,
    /// Watchdog is running but no longer owned by this launcher
    Detached,
    /// Watchdog has been shut down
    Terminated,
}

/// Outcome of a single feedback line
#[derive(Debug)]
struct AgentsInformation {
    instance_dir: String,
    core_address: Option<String>,
    core_password: Option<String>,
}

/// Handle of the watchdog process
#[derive(Debug)]
pub struct WatchdogLauncher {
    state: LauncherState,
    child: Option<Child>,
    feedback: Option<UnixStream>,
    instance_dir: String,
    core_address: String,
    core_password: String,
    grace_period: Duration,
    inspection_timeout: Duration,
}

impl Default for WatchdogLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchdogLauncher {
    /// Creates a launcher that didn’t start anything yet.
    pub fn new() -> Self {
        Self {
            state: LauncherState::New,
            child: None,
            feedback: None,
            instance_dir: String::new(),
            core_address: String::new(),
            core_password: String::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            inspection_timeout: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Current state
    pub fn state(&self) -> LauncherState {
        self.state
    }

    /// Process ID of the watchdog while it is owned by this launcher
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Address of the core’s request socket, e.g. `unix:/tmp/passenger.abc/agents.s/core`
    pub fn core_address(&self) -> &str {
        &self.core_address
    }

    /// Password to be sent with every request to the core
    pub fn core_password(&self) -> &str {
        &self.core_password
    }

    /// Instance directory created by the watchdog
    pub fn instance_dir(&self) -> &str {
        &self.instance_dir
    }

    /// Locates the agent executable below the Passenger installation directory.
    pub fn agent_path(passenger_root: &str) -> PathBuf {
        let root = Path::new(passenger_root);
        let buildout = root
            .join("buildout")
            .join("support-binaries")
            .join(AGENT_EXE);
        if buildout.exists() {
            buildout
        } else {
            root.join("support-binaries").join(AGENT_EXE)
        }
    }

    fn generate_password() -> Result<String, LaunchError> {
        let mut data = [0u8; 24];
        getrandom::getrandom(&mut data)
            .map_err(|err| LaunchError::new(format!("Cannot generate the core password: {err}")))?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data))
    }

    fn apply_actions(command: &mut Command, actions: &[ForkAction]) -> Result<(), LaunchError> {
        let mut redirected = false;
        for action in actions {
            match action {
                ForkAction::RedirectStdio { path } => {
                    let file = match path {
                        Some(path) => OpenOptions::new().create(true).append(true).open(path),
                        None => File::options().write(true).open("/dev/null"),
                    }
                    .map_err(|err| {
                        LaunchError::because(format!("Cannot open log file {path:?}"), err)
                    })?;
                    let stderr = file.try_clone().map_err(|err| {
                        LaunchError::because("Cannot duplicate log file descriptor", err)
                    })?;
                    command.stdout(file).stderr(stderr);
                    redirected = true;
                }
                ForkAction::ApplyEnv { key, value } => {
                    command.env(key, value);
                }
                ForkAction::CloseFd { fd } => {
                    fcntl(*fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|err| {
                        LaunchError::because(
                            format!("Cannot set close-on-exec flag on file descriptor {fd}"),
                            io::Error::from(err),
                        )
                    })?;
                }
            }
        }
        if !redirected {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        Ok(())
    }

    /// Starts the watchdog and waits for it to report back.
    ///
    /// `params` is the configuration document passed to the watchdog. On success, the core
    /// address, password and instance directory are available.
    pub fn start(
        &mut self,
        passenger_root: &str,
        params: &serde_json::Value,
        actions: &[ForkAction],
    ) -> Result<(), LaunchError> {
        if self.state != LauncherState::New {
            return Err(LaunchError::new(format!(
                "Unable to start the {PROGRAM_NAME} watchdog: it has already been started"
            )));
        }
        self.state = LauncherState::Starting;

        match self.start_inner(passenger_root, params, actions) {
            Ok(()) => {
                self.state = LauncherState::Running;
                Ok(())
            }
            Err(err) => {
                self.state = LauncherState::Failed;
                self.feedback = None;
                if let Some(child) = self.child.take() {
                    self.kill_process_group_and_wait(child, self.grace_period);
                }
                Err(err)
            }
        }
    }

    fn start_inner(
        &mut self,
        passenger_root: &str,
        params: &serde_json::Value,
        actions: &[ForkAction],
    ) -> Result<(), LaunchError> {
        let agent = Self::agent_path(passenger_root);
        let password = Self::generate_password()?;

        let (feedback, child_end) = UnixStream::pair()
            .map_err(|err| LaunchError::because("Cannot create a Unix socket pair", err))?;

        let mut command = Command::new(&agent);
        command
            .arg("watchdog")
            .env("PASSENGER_USE_FEEDBACK_FD", "true")
            .stdin(Stdio::from(OwnedFd::from(child_end)))
            .process_group(0);
        Self::apply_actions(&mut command, actions)?;

        debug!("starting watchdog {}", agent.display());
        let child = command.spawn().map_err(|err| {
            if err.raw_os_error() == Some(Errno::ENOENT as i32) {
                Self::executable_not_found(&agent)
            } else {
                LaunchError::because(
                    format!(
                        "Unable to start the {PROGRAM_NAME} watchdog ({})",
                        agent.display()
                    ),
                    err,
                )
            }
        })?;
        // The child end of the socket pair is closed now, so EOF is seen once the watchdog exits
        drop(command);
        self.child = Some(child);

        let mut message = serde_json::to_string(params).map_err(|err| {
            LaunchError::because("Cannot serialize watchdog parameters", io::Error::from(err))
        })?;
        message.push('\n');
        message.push_str(&password);
        message.push('\n');

        // The watchdog might have sent an error report without reading the parameters, this
        // will show up when reading its feedback.
        if let Err(err) = (&feedback).write_all(message.as_bytes()) {
            if !matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            ) {
                return Err(self.inspect_crash_reason());
            }
        }

        let mut line = String::new();
        match BufReader::new(&feedback).read_line(&mut line) {
            Ok(0) => return Err(self.inspect_crash_reason()),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {
                return Err(self.inspect_crash_reason())
            }
            Err(err) => {
                return Err(LaunchError::because(
                    format!(
                        "Unable to start the {PROGRAM_NAME} watchdog: unable to read its startup information report"
                    ),
                    err,
                ))
            }
        }

        let info = Self::parse_feedback(line.trim_end_matches(['\r', '\n']), &agent)?;
        self.core_address = info
            .core_address
            .unwrap_or_else(|| format!("unix:{}/agents.s/core", info.instance_dir));
        self.core_password = info.core_password.unwrap_or(password);
        self.instance_dir = info.instance_dir;
        self.feedback = Some(feedback);

        info!(
            "{PROGRAM_NAME} watchdog started, instance directory {}",
            self.instance_dir
        );
        Ok(())
    }

    fn executable_not_found(agent: &Path) -> LaunchError {
        LaunchError::new(format!(
            "Unable to start {PROGRAM_NAME}: Executable {} not found. There may be different causes for this:\n\n - Your 'passenger_root' setting is set to the wrong value. Please see {PASSENGER_ROOT_DOC_URL} to learn how to fix the value.\n - Your Passenger installation is broken or incomplete. Please reinstall Passenger.",
            agent.display()
        ))
    }

    fn parse_feedback(line: &str, agent: &Path) -> Result<AgentsInformation, LaunchError> {
        if line.starts_with('/') {
            return Ok(AgentsInformation {
                instance_dir: line.to_owned(),
                core_address: None,
                core_password: None,
            });
        }

        let args: Vec<&str> = line.split('\t').collect();
        let arg = |index: usize| args.get(index).copied().unwrap_or("");
        let errno = |index: usize| arg(index).trim().parse::<i32>().unwrap_or(0);
        match args[0] {
            "Agents information" => {
                if (args.len() - 1) % 2 != 0 {
                    return Err(LaunchError::new(format!(
                        "Unable to start the {PROGRAM_NAME} watchdog because it sent an invalid startup information report (the number of items is not an even number)"
                    )));
                }
                let mut info = AgentsInformation {
                    instance_dir: String::new(),
                    core_address: None,
                    core_password: None,
                };
                for pair in args[1..].chunks(2) {
                    match pair[0] {
                        "instance_dir" => info.instance_dir = pair[1].to_owned(),
                        "core_address" => info.core_address = Some(pair[1].to_owned()),
                        "core_password" => info.core_password = Some(pair[1].to_owned()),
                        _ => {}
                    }
                }
                if info.instance_dir.is_empty() {
                    return Err(LaunchError::new(format!(
                        "Unable to start the {PROGRAM_NAME} watchdog because its startup information report lacks the instance directory"
                    )));
                }
                Ok(info)
            }
            "Watchdog startup error" => Err(LaunchError::new(format!(
                "Unable to start the {PROGRAM_NAME} watchdog because it encountered the following error during startup: {}",
                arg(1)
            ))),
            "system error" => Err(LaunchError::because(
                arg(1),
                io::Error::from_raw_os_error(errno(2)),
            )),
            "exec error" => {
                let errno = errno(1);
                if errno == Errno::ENOENT as i32 {
                    Err(Self::executable_not_found(agent))
                } else {
                    Err(LaunchError::because(
                        format!(
                            "Unable to start the {PROGRAM_NAME} watchdog ({})",
                            agent.display()
                        ),
                        io::Error::from_raw_os_error(errno),
                    ))
                }
            }
            other => Err(LaunchError::new(format!(
                "The {PROGRAM_NAME} watchdog sent an unknown feedback message '{other}'"
            ))),
        }
    }

    /// Waits for the child to exit, returns its exit status if it did within `timeout`.
    fn wait_timeout(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(_) => return None,
            }
            if start.elapsed() >= timeout {
                return None;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Produces an error describing why the watchdog closed the feedback channel.
    fn inspect_crash_reason(&mut self) -> LaunchError {
        let Some(child) = self.child.as_mut() else {
            return LaunchError::new(format!(
                "Unable to start the {PROGRAM_NAME} watchdog: it seems to have crashed during startup for an unknown reason"
            ));
        };

        match Self::wait_timeout(child, self.inspection_timeout) {
            None => LaunchError::new(format!(
                "Unable to start the {PROGRAM_NAME} watchdog: it froze during startup and reported an unknown error"
            )),
            Some(status) => {
                self.child = None;
                if let Some(signal) = status.signal() {
                    let name = Signal::try_from(signal)
                        .map(|signal| signal.as_str().to_owned())
                        .unwrap_or_else(|_| signal.to_string());
                    LaunchError::new(format!(
                        "Unable to start the {PROGRAM_NAME} watchdog: it seems to have been killed with signal {name} during startup"
                    ))
                } else if let Some(code) = status.code() {
                    LaunchError::new(format!(
                        "Unable to start the {PROGRAM_NAME} watchdog: it seems to have crashed during startup for an unknown reason, with exit code {code}"
                    ))
                } else {
                    LaunchError::new(format!(
                        "Unable to start the {PROGRAM_NAME} watchdog: it seems to have crashed during startup for an unknown reason"
                    ))
                }
            }
        }
    }

    fn signal_group(child: &Child, signal: Signal) {
        let Ok(pid) = i32::try_from(child.id()) else {
            return;
        };
        if let Err(err) = killpg(Pid::from_raw(pid), signal) {
            if err != Errno::ESRCH {
                warn!(
                    "failed sending {} to watchdog process group {pid}: {err}",
                    signal.as_str()
                );
            }
        }
    }

    fn kill_process_group_and_wait(&self, mut child: Child, timeout: Duration) {
        if Self::wait_timeout(&mut child, timeout).is_none() {
            Self::signal_group(&child, Signal::SIGKILL);
            let _ = child.wait();
        }
    }

    /// Writes the server’s process ID into the instance directory, so that the watchdog knows
    /// which process to watch. The file is handed over to the given owner if any.
    pub fn write_control_process_pid(
        &self,
        pid: u32,
        owner: Option<(Uid, Option<Gid>)>,
    ) -> io::Result<()> {
        let path = Path::new(&self.instance_dir)
            .join("web_server_info")
            .join("control_process.pid");
        std::fs::write(&path, format!("{pid}\n"))?;
        if let Some((uid, gid)) = owner {
            chown(&path, Some(uid), gid).map_err(io::Error::from)?;
        }
        Ok(())
    }

    /// Stops owning the watchdog, it keeps running.
    pub fn detach(&mut self) {
        self.feedback = None;
        self.child = None;
        if self.state == LauncherState::Running {
            self.state = LauncherState::Detached;
        }
    }

    /// Shuts the watchdog down.
    ///
    /// The watchdog is asked to exit cleanly first. If it doesn’t exit within the grace period,
    /// its process group receives `SIGTERM` and finally `SIGKILL`.
    pub fn shutdown(&mut self) {
        if self.state != LauncherState::Running {
            return;
        }
        self.state = LauncherState::Terminated;

        if let Some(feedback) = self.feedback.take() {
            // Tells the watchdog that this is a clean shutdown
            let _ = (&feedback).write_all(b"c");
        }

        if let Some(mut child) = self.child.take() {
            if Self::wait_timeout(&mut child, self.grace_period).is_none() {
                info!("watchdog didn’t exit, terminating its process group");
                Self::signal_group(&child, Signal::SIGTERM);
                self.kill_process_group_and_wait(child, self.grace_period);
            }
        }
    }
}

impl Drop for WatchdogLauncher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use test_log::test;

    fn install_agent(root: &Path, script: &str) {
        let dir = root.join("support-binaries");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(AGENT_EXE);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn launcher() -> WatchdogLauncher {
        let mut launcher = WatchdogLauncher::new();
        launcher.grace_period = Duration::from_secs(2);
        launcher.inspection_timeout = Duration::from_millis(300);
        launcher
    }

    fn start(root: &Path, actions: &[ForkAction]) -> (WatchdogLauncher, Result<(), LaunchError>) {
        let mut launcher = launcher();
        let result = launcher.start(
            &root.to_string_lossy(),
            &json!({"passenger_root": root.to_string_lossy(), "log_level": 3}),
            actions,
        );
        (launcher, result)
    }

    #[test]
    fn successful_start() {
        let tempdir = tempfile::tempdir().unwrap();
        let root = tempdir.path();
        let instance = root.join("instance");
        std::fs::create_dir_all(instance.join("web_server_info")).unwrap();
        install_agent(
            root,
            r#"read config
read password
echo "$config" > "$INSTANCE_DIR/config.json"
echo "$password $1 $PASSENGER_USE_FEEDBACK_FD" > "$INSTANCE_DIR/password"
echo "$INSTANCE_DIR" >&0
read command
echo "$command" > "$INSTANCE_DIR/command""#,
        );

        let (mut launcher, result) = start(
            root,
            &[
                ForkAction::RedirectStdio { path: None },
                ForkAction::ApplyEnv {
                    key: "INSTANCE_DIR".to_owned(),
                    value: instance.to_string_lossy().into_owned(),
                },
            ],
        );
        result.unwrap();
        assert_eq!(launcher.state(), LauncherState::Running);
        assert!(launcher.pid().is_some());
        assert_eq!(launcher.instance_dir(), instance.to_string_lossy());
        assert_eq!(
            launcher.core_address(),
            format!("unix:{}/agents.s/core", instance.to_string_lossy())
        );
        assert!(!launcher.core_password().is_empty());

        let config: serde_json::Value =
            serde_json::from_slice(&std::fs::read(instance.join("config.json")).unwrap())
                .unwrap();
        assert_eq!(config["log_level"], 3);
        assert_eq!(
            std::fs::read_to_string(instance.join("password")).unwrap(),
            format!("{} watchdog true\n", launcher.core_password())
        );

        launcher.write_control_process_pid(1234, None).unwrap();
        assert_eq!(
            std::fs::read_to_string(instance.join("web_server_info/control_process.pid")).unwrap(),
            "1234\n"
        );

        launcher.shutdown();
        assert_eq!(launcher.state(), LauncherState::Terminated);
        assert!(launcher.pid().is_none());
        assert_eq!(
            std::fs::read_to_string(instance.join("command")).unwrap(),
            "c\n"
        );

        // Only a single start per launcher
        let result = launcher.start(&root.to_string_lossy(), &json!({}), &[]);
        assert!(result.is_err());
    }

    #[test]
    fn agents_information_report() {
        let tempdir = tempfile::tempdir().unwrap();
        let root = tempdir.path();
        install_agent(
            root,
            "read config\nread password\nprintf 'Agents information\\tinstance_dir\\t/tmp/instance\\tcore_address\\tunix:/tmp/core.sock\\tcore_password\\tsecret\\n' >&0\nread command",
        );

        let (mut launcher, result) = start(root, &[]);
        result.unwrap();
        assert_eq!(launcher.instance_dir(), "/tmp/instance");
        assert_eq!(launcher.core_address(), "unix:/tmp/core.sock");
        assert_eq!(launcher.core_password(), "secret");

        launcher.detach();
        assert_eq!(launcher.state(), LauncherState::Detached);
        assert!(launcher.pid().is_none());
    }

    #[test]
    fn error_reports() {
        let tempdir = tempfile::tempdir().unwrap();
        let root = tempdir.path();

        install_agent(
            root,
            "read config\nprintf 'Watchdog startup error\\tsomething broke\\n' >&0",
        );
        let (launcher, result) = start(root, &[]);
        assert_eq!(launcher.state(), LauncherState::Failed);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Unable to start the Phusion Passenger watchdog because it encountered the following error during startup: something broke"
        );

        install_agent(root, "printf 'exec error\\t2\\n' >&0");
        let (_, result) = start(root, &[]);
        let message = result.unwrap_err().to_string();
        assert!(message.contains("not found"), "{message}");
        assert!(message.contains(PASSENGER_ROOT_DOC_URL), "{message}");

        install_agent(root, "printf 'hello\\n' >&0");
        let (_, result) = start(root, &[]);
        assert_eq!(
            result.unwrap_err().to_string(),
            "The Phusion Passenger watchdog sent an unknown feedback message 'hello'"
        );

        install_agent(root, "exit 3");
        let (_, result) = start(root, &[]);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Unable to start the Phusion Passenger watchdog: it seems to have crashed during startup for an unknown reason, with exit code 3"
        );

        install_agent(root, "exec 0<&-\nsleep 10");
        let (_, result) = start(root, &[]);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Unable to start the Phusion Passenger watchdog: it froze during startup and reported an unknown error"
        );
    }

    #[test]
    fn missing_agent() {
        let tempdir = tempfile::tempdir().unwrap();
        let (launcher, result) = start(tempdir.path(), &[]);
        assert_eq!(launcher.state(), LauncherState::Failed);
        let message = result.unwrap_err().to_string();
        assert!(message.contains("support-binaries/PassengerAgent not found"), "{message}");
    }

    #[test]
    fn log_redirection() {
        let tempdir = tempfile::tempdir().unwrap();
        let root = tempdir.path();
        let log = root.join("watchdog.log");
        install_agent(root, "echo 'hello from the watchdog'\nexit 1");

        let (_, result) = start(
            root,
            &[ForkAction::RedirectStdio {
                path: Some(log.clone()),
            }],
        );
        assert!(result.is_err());
        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "hello from the watchdog\n"
        );
    }
}
