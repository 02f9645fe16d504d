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

//! Standard responses for various conditions

use http::{header, method::Method, status::StatusCode};
use maud::{html, DOCTYPE};

use crate::pingora::{Error, ResponseHeader, SessionWrapper};

/// Name displayed at the bottom of the standard pages
pub const PROGRAM_NAME: &str = "Phusion Passenger";

/// Produces the text of a standard response page for the given status code.
pub fn response_text(status: StatusCode) -> String {
    let title = format!(
        "{} {}",
        status.as_str(),
        status.canonical_reason().unwrap_or("")
    );
    html! {
        (DOCTYPE)
        html {
            head {
                title { (title) }
            }

            body {
                center {
                    h1 { (title) }
                }
                hr;
                center { (PROGRAM_NAME) }
            }
        }
    }
    .into()
}

fn response_header(
    status: StatusCode,
    text: &str,
    location: Option<&str>,
) -> Result<Box<ResponseHeader>, Box<Error>> {
    let mut header = ResponseHeader::build(status, Some(4))?;
    header.append_header(header::CONTENT_LENGTH, text.len().to_string())?;
    header.append_header(header::CONTENT_TYPE, "text/html; charset=utf-8")?;
    if let Some(location) = location {
        header.append_header(header::LOCATION, location)?;
    }
    Ok(Box::new(header))
}

async fn send_page(
    session: &mut impl SessionWrapper,
    status: StatusCode,
    location: Option<&str>,
) -> Result<(), Box<Error>> {
    let text = response_text(status);
    let header = response_header(status, &text, location)?;

    if session.req_header().method == Method::HEAD {
        session.write_response_header(header, true).await
    } else {
        session.write_response_header(header, false).await?;
        session.write_response_body(Some(text.into()), true).await
    }
}

/// Responds with a standard error page for the given status code.
pub async fn error_response(
    session: &mut impl SessionWrapper,
    status: StatusCode,
) -> Result<(), Box<Error>> {
    send_page(session, status, None).await
}

/// Responds with a redirect to the given location.
pub async fn redirect_response(
    session: &mut impl SessionWrapper,
    status: StatusCode,
    location: &str,
) -> Result<(), Box<Error>> {
    send_page(session, status, Some(location)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_text() {
        let text = response_text(StatusCode::BAD_GATEWAY);
        assert!(text.starts_with("<!DOCTYPE html>"));
        assert!(text.contains("<title>502 Bad Gateway</title>"));
        assert!(text.contains("<h1>502 Bad Gateway</h1>"));
        assert!(text.contains("<center>Phusion Passenger</center>"));
    }

    #[test]
    fn header() {
        let header = response_header(StatusCode::MOVED_PERMANENTLY, "abc", Some("/dir/")).unwrap();
        assert_eq!(header.status, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(header.headers.get("Content-Length").unwrap(), "3");
        assert_eq!(header.headers.get("Location").unwrap(), "/dir/");
    }
}
