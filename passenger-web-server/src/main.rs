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

use async_trait::async_trait;
use clap::Parser;
use log::{error, info};
use nix::unistd::Uid;
use passenger_module::{CoreContext, PassengerConf, PassengerHandler, PassengerOpt};
use passenger_module_utils::pingora::{background_service, BackgroundService, ShutdownWatch};
use passenger_module_utils::{merge_conf, FromYaml, HandlerChain};
use startup_module::{DefaultApp, StartupConf, StartupOpt};
use std::sync::Arc;

/// Run Passenger Web Server
#[derive(Debug, Parser)]
struct Opt {
    #[clap(flatten)]
    startup: StartupOpt,
    #[clap(flatten)]
    passenger: PassengerOpt,
}

merge_conf! {
    /// The configuration of Passenger Web Server
    struct Conf {
        startup: StartupConf,
        passenger: PassengerConf,
    }
}

/// Records the server process in Passenger’s instance directory once the server is running and
/// stops the watchdog on shutdown.
#[derive(Debug)]
struct CoreLifecycle {
    core: Arc<CoreContext>,
}

#[async_trait]
impl BackgroundService for CoreLifecycle {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        // Process ID changes when daemonizing
        self.core.save_control_process_pid();

        let _ = shutdown.changed().await;
        info!("shutting down Phusion Passenger");
        self.core.shutdown();
    }
}

fn main() {
    env_logger::init();

    let opt = Opt::parse();

    let mut conf = match Conf::load_from_files(opt.startup.conf.as_deref().unwrap_or(&[])) {
        Ok(conf) => conf,
        Err(err) => {
            error!("{err}");
            Conf::default()
        }
    };
    conf.passenger.merge_with_opt(opt.passenger);

    if let Err(err) = conf.passenger.passenger.validate() {
        error!("{err}");
        return;
    }

    let handler = match PassengerHandler::try_from(conf.passenger) {
        Ok(handler) => handler,
        Err(err) => {
            error!("{err}");
            return;
        }
    };

    if let Some(user) = conf.startup.server.user.as_deref() {
        if Uid::effective().is_root() {
            if let Err(err) = handler
                .core()
                .set_pid_file_owner(user, conf.startup.server.group.as_deref())
            {
                error!("{err}");
                return;
            }
        }
    }

    if !opt.startup.test {
        if let Err(err) = handler.start_core() {
            error!("{err}");
            #[allow(clippy::exit)]
            std::process::exit(1);
        }
    }

    let core = handler.core().clone();
    let static_files = handler.static_files_handler();
    let app = DefaultApp::new(HandlerChain::new(handler, static_files));

    let mut server = conf.startup.into_server(app, Some(opt.startup));
    server.add_service(background_service(
        "Phusion Passenger core",
        CoreLifecycle { core },
    ));
    server.run_forever();
}
