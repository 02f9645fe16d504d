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

use clap::Parser;
use passenger_module_utils::pingora::{
    http_proxy_service, ProxyHttp, Server, ServerConf, ServerOpt, TcpSocketOptions,
};
use serde::Deserialize;

/// Run a web server
#[derive(Debug, Default, Parser)]
pub struct StartupOpt {
    /// Address and port to listen on, e.g. "127.0.0.1:8080". This command line flag can be
    /// specified multiple times.
    #[clap(short, long)]
    pub listen: Option<Vec<String>>,
    /// Use this flag to make the server run in the background.
    #[clap(short, long)]
    pub daemon: bool,
    /// Test the configuration and exit. This is useful to validate the configuration before
    /// restarting the process.
    #[clap(short, long)]
    pub test: bool,
    /// The path to the configuration file. This command line flag can be specified multiple times.
    #[clap(short, long)]
    pub conf: Option<Vec<String>>,
}

/// Address for the server to listen on
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "ListenAddrRepr")]
pub struct ListenAddr {
    /// IP address and port combination, e.g. `127.0.0.1:8080` or `[::1]:8080`
    pub addr: String,

    /// Determines whether listening on IPv6 [::] address should accept IPv4 connections as well.
    ///
    /// If set, the IPV6_V6ONLY flag will be set accordingly for the socket. Otherwise the system
    /// default will be used.
    pub ipv6_only: Option<bool>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListenAddrRepr {
    Plain(String),
    Full {
        addr: String,
        #[serde(default)]
        ipv6_only: Option<bool>,
    },
}

impl From<ListenAddrRepr> for ListenAddr {
    fn from(value: ListenAddrRepr) -> Self {
        match value {
            ListenAddrRepr::Plain(addr) => Self {
                addr,
                ipv6_only: None,
            },
            ListenAddrRepr::Full { addr, ipv6_only } => Self { addr, ipv6_only },
        }
    }
}

impl From<&str> for ListenAddr {
    fn from(value: &str) -> Self {
        Self {
            addr: value.to_owned(),
            ipv6_only: None,
        }
    }
}

/// Configuration settings of the startup module
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartupConf {
    /// List of address/port combinations to listen on, e.g. "127.0.0.1:8080".
    pub listen: Vec<ListenAddr>,
    /// Pingora’s default server configuration options
    #[serde(flatten)]
    pub server: ServerConf,
}

impl StartupConf {
    /// Addresses to listen on, command line flags taking precedence over the configuration
    fn listen_addrs(&self, opt: &StartupOpt) -> Vec<ListenAddr> {
        let mut listen = match &opt.listen {
            Some(listen) => listen.iter().map(|addr| addr.as_str().into()).collect(),
            None => self.listen.clone(),
        };
        if listen.is_empty() {
            // Make certain we have a listening address
            listen.push("127.0.0.1:8080".into());
            listen.push("[::1]:8080".into());
        }
        listen
    }

    /// Sets up a server with the given configuration and command line options
    pub fn into_server<SV>(self, app: SV, opt: Option<StartupOpt>) -> Server
    where
        SV: ProxyHttp + Send + Sync + 'static,
        <SV as ProxyHttp>::CTX: Send + Sync,
    {
        let opt = opt.unwrap_or_default();
        let listen = self.listen_addrs(&opt);

        let mut server = Server::new_with_opt_and_conf(
            ServerOpt {
                daemon: opt.daemon,
                test: opt.test,
                upgrade: false,
                nocapture: false,
                conf: None,
            },
            self.server,
        );
        server.bootstrap();

        let mut proxy = http_proxy_service(&server.configuration, app);
        for addr in listen {
            if let Some(ipv6_only) = addr.ipv6_only {
                proxy.add_tcp_with_settings(&addr.addr, TcpSocketOptions { ipv6_only });
            } else {
                proxy.add_tcp(&addr.addr);
            }
        }
        server.add_service(proxy);

        server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passenger_module_utils::FromYaml;

    #[test]
    fn listen_formats() {
        let conf = StartupConf::from_yaml(
            r#"
                listen:
                - 127.0.0.1:8080
                - addr: "[::]:8081"
                  ipv6_only: true
                threads: 4
            "#,
        )
        .unwrap();
        assert_eq!(
            conf.listen,
            vec![
                ListenAddr::from("127.0.0.1:8080"),
                ListenAddr {
                    addr: "[::]:8081".to_owned(),
                    ipv6_only: Some(true),
                },
            ]
        );
        assert_eq!(conf.server.threads, 4);
    }

    #[test]
    fn default_listen() {
        let conf = StartupConf::default();
        assert_eq!(
            conf.listen_addrs(&StartupOpt::default()),
            vec![
                ListenAddr::from("127.0.0.1:8080"),
                ListenAddr::from("[::1]:8080")
            ]
        );

        let opt = StartupOpt {
            listen: Some(vec!["0.0.0.0:80".to_owned()]),
            ..Default::default()
        };
        assert_eq!(
            conf.listen_addrs(&opt),
            vec![ListenAddr::from("0.0.0.0:80")]
        );
    }
}
