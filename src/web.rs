// src/web.rs
// HTTP alternative to the session transport
//
// Some Anweddol servers expose a REST form of the protocol: the request
// parameters are POSTed to "<scheme>://<ip>:<port>/<verb>" and the server
// answers with a normalized response document as JSON. No handshake, no
// framing; TLS is the platform's business.

use reqwest::blocking::ClientBuilder;
use reqwest::header::CONTENT_TYPE;
use serde_json::{Map, Value};

use crate::error::{ClientError, Result};
use crate::sanitize::{make_request, verify_response, Response};

pub const DEFAULT_HTTP_SERVER_LISTEN_PORT: u16 = 8080;
pub const DEFAULT_HTTPS_SERVER_LISTEN_PORT: u16 = 4443;
pub const DEFAULT_ENABLE_SSL: bool = false;

pub struct WebClientInterface {
    server_ip: String,
    server_listen_port: u16,
    enable_ssl: bool,
}

impl WebClientInterface {
    pub fn new(server_ip: &str, server_listen_port: u16, enable_ssl: bool) -> Self {
        WebClientInterface {
            server_ip: server_ip.to_string(),
            server_listen_port,
            enable_ssl,
        }
    }

    /// Validate and POST a request, then validate the JSON response.
    ///
    /// `verify_tls_certificate` only matters when SSL is enabled; disabling
    /// it accepts self-signed server certificates.
    pub fn send_request(
        &self,
        verb: &str,
        parameters: Map<String, Value>,
        verify_tls_certificate: bool,
    ) -> Result<Response> {
        let document = make_request(verb, parameters)?;

        let scheme = if self.enable_ssl { "https" } else { "http" };
        let url = format!(
            "{}://{}:{}/{}",
            scheme,
            self.server_ip,
            self.server_listen_port,
            verb.to_lowercase()
        );

        let client = ClientBuilder::new()
            .danger_accept_invalid_certs(!verify_tls_certificate)
            .build()?;

        let body = serde_json::to_string(&document["parameters"])
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let http_response = client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()?;

        let status = http_response.status().as_u16();
        if status >= 300 {
            return Err(ClientError::Transport(format!(
                "status code {} from remote URL",
                status
            )));
        }

        let payload = http_response.text()?;
        let value: Value = serde_json::from_str(&payload)
            .map_err(|e| ClientError::validation("response", e.to_string()))?;

        verify_response(&value)
    }
}
