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

//! Header value templates referencing request variables like `$host` or `${http_user_agent}`

use http::{HeaderMap, HeaderName};
use std::str::FromStr;

use crate::configuration::ConfigError;

/// Values of the variables for the current request
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequestVars<'a> {
    pub(crate) host: &'a str,
    pub(crate) remote_addr: &'a str,
    pub(crate) remote_port: &'a str,
    pub(crate) scheme: &'a str,
    pub(crate) request_uri: &'a str,
    pub(crate) uri: &'a str,
    pub(crate) args: &'a str,
    pub(crate) method: &'a str,
    pub(crate) protocol: &'a str,
    pub(crate) document_root: &'a str,
    pub(crate) headers: &'a HeaderMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Variable {
    Host,
    RemoteAddr,
    RemotePort,
    Scheme,
    RequestUri,
    Uri,
    Args,
    RequestMethod,
    ServerProtocol,
    DocumentRoot,
    Header(HeaderName),
}

impl Variable {
    fn parse(name: &str) -> Result<Self, ConfigError> {
        Ok(match name {
            "host" => Self::Host,
            "remote_addr" => Self::RemoteAddr,
            "remote_port" => Self::RemotePort,
            "scheme" => Self::Scheme,
            "request_uri" => Self::RequestUri,
            "uri" | "document_uri" => Self::Uri,
            "args" | "query_string" => Self::Args,
            "request_method" => Self::RequestMethod,
            "server_protocol" => Self::ServerProtocol,
            "document_root" => Self::DocumentRoot,
            _ => {
                let header = name
                    .strip_prefix("http_")
                    .map(|header| header.replace('_', "-"))
                    .and_then(|header| HeaderName::from_str(&header).ok())
                    .ok_or_else(|| ConfigError::new(format!("unknown \"{name}\" variable")))?;
                Self::Header(header)
            }
        })
    }

    fn push_value(&self, vars: &RequestVars<'_>, out: &mut String) {
        match self {
            Self::Host => out.push_str(vars.host),
            Self::RemoteAddr => out.push_str(vars.remote_addr),
            Self::RemotePort => out.push_str(vars.remote_port),
            Self::Scheme => out.push_str(vars.scheme),
            Self::RequestUri => out.push_str(vars.request_uri),
            Self::Uri => out.push_str(vars.uri),
            Self::Args => out.push_str(vars.args),
            Self::RequestMethod => out.push_str(vars.method),
            Self::ServerProtocol => out.push_str(vars.protocol),
            Self::DocumentRoot => out.push_str(vars.document_root),
            Self::Header(name) => {
                let mut first = true;
                for value in vars.headers.get_all(name) {
                    if !first {
                        out.push_str(", ");
                    }
                    first = false;
                    out.push_str(&String::from_utf8_lossy(value.as_bytes()));
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Variable(Variable),
}

/// A string containing variable references
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Template {
    parts: Vec<Part>,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl Template {
    /// Parses a template, failing on unknown variables.
    pub(crate) fn parse(template: &str) -> Result<Self, ConfigError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = template;

        while let Some(index) = rest.find('$') {
            literal.push_str(&rest[..index]);
            rest = &rest[index + 1..];

            let (name, remainder) = if let Some(braced) = rest.strip_prefix('{') {
                let end = braced.find('}').ok_or_else(|| {
                    ConfigError::new(format!("the closing bracket in \"{template}\" is missing"))
                })?;
                (&braced[..end], &braced[end + 1..])
            } else {
                let end = rest.find(|c| !is_name_char(c)).unwrap_or(rest.len());
                (&rest[..end], &rest[end..])
            };

            if name.is_empty() {
                return Err(ConfigError::new(format!(
                    "invalid variable name in \"{template}\""
                )));
            }

            if !literal.is_empty() {
                parts.push(Part::Literal(std::mem::take(&mut literal)));
            }
            parts.push(Part::Variable(Variable::parse(name)?));
            rest = remainder;
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(Self { parts })
    }

    /// Produces the template value for a request.
    pub(crate) fn evaluate(&self, vars: &RequestVars<'_>) -> String {
        let mut result = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(literal) => result.push_str(literal),
                Part::Variable(variable) => variable.push_value(vars, &mut result),
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluate(template: &str) -> String {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", "test/1.0".try_into().unwrap());
        headers.append("accept", "text/html".try_into().unwrap());
        headers.append("accept", "*/*".try_into().unwrap());

        let vars = RequestVars {
            host: "example.com",
            remote_addr: "127.0.0.1",
            remote_port: "4321",
            scheme: "http",
            request_uri: "/a%20b?x=1",
            uri: "/a b",
            args: "x=1",
            method: "GET",
            protocol: "HTTP/1.1",
            document_root: "/srv/app/public",
            headers: &headers,
        };
        Template::parse(template).unwrap().evaluate(&vars)
    }

    #[test]
    fn variables() {
        assert_eq!(evaluate("plain"), "plain");
        assert_eq!(evaluate(""), "");
        assert_eq!(evaluate("$host"), "example.com");
        assert_eq!(evaluate("$remote_addr:$remote_port"), "127.0.0.1:4321");
        assert_eq!(evaluate("${scheme}://$host$request_uri"), "http://example.com/a%20b?x=1");
        assert_eq!(evaluate("[$uri] [$args] $request_method $server_protocol"), "[/a b] [x=1] GET HTTP/1.1");
        assert_eq!(evaluate("$document_root/"), "/srv/app/public/");
        assert_eq!(evaluate("ua=$http_user_agent"), "ua=test/1.0");
        assert_eq!(evaluate("$http_accept"), "text/html, */*");
        assert_eq!(evaluate("$http_x_missing"), "");
    }

    #[test]
    fn invalid() {
        assert_eq!(
            Template::parse("$nonsense").unwrap_err().message(),
            "unknown \"nonsense\" variable"
        );
        assert!(Template::parse("${host").is_err());
        assert!(Template::parse("costs $ 5").is_err());
    }
}
