// src/commands.rs
// Orchestration of the three service verbs
//
// Binds the transports to the local stores: any stored access token for the
// target server rides along in the request parameters, and store mutations
// happen only once the transport succeeded, the response validated and the
// server reported success.

use log::{debug, info};
use serde_json::{json, Map, Value};

use crate::client::{
    ClientInterface, DEFAULT_CLIENT_TIMEOUT, DEFAULT_RECEIVE_FIRST, DEFAULT_SERVER_LISTEN_PORT,
    REQUEST_VERB_CREATE, REQUEST_VERB_DESTROY, REQUEST_VERB_STAT,
};
use crate::config::Config;
use crate::db::{with_container_store, with_session_store, with_token_store};
use crate::error::{ClientError, Result};
use crate::keys;
use crate::sanitize::{Response, ResponseData, SessionBundle};
use crate::web::{
    WebClientInterface, DEFAULT_HTTPS_SERVER_LISTEN_PORT, DEFAULT_HTTP_SERVER_LISTEN_PORT,
};

/// How to reach the server; the target IP travels separately.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Use the HTTP transport instead of the session protocol.
    pub web: bool,
    pub enable_ssl: bool,
    pub verify_tls_certificate: bool,
    /// Override the transport's default listen port.
    pub server_port: Option<u16>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            web: false,
            enable_ssl: false,
            verify_tls_certificate: true,
            server_port: None,
        }
    }
}

impl TransportOptions {
    fn effective_port(&self) -> u16 {
        self.server_port.unwrap_or(if self.web {
            if self.enable_ssl {
                DEFAULT_HTTPS_SERVER_LISTEN_PORT
            } else {
                DEFAULT_HTTP_SERVER_LISTEN_PORT
            }
        } else {
            DEFAULT_SERVER_LISTEN_PORT
        })
    }
}

#[derive(Debug)]
pub struct CreateOutcome {
    pub response: Response,
    pub bundle: SessionBundle,
    pub session_entry_id: Option<i64>,
    pub container_entry_id: Option<i64>,
}

#[derive(Debug)]
pub struct DestroyOutcome {
    pub response: Response,
    pub deleted_session_entry_id: Option<i64>,
    pub deleted_container_entry_id: Option<i64>,
}

pub fn is_valid_ipv4(ip: &str) -> bool {
    ip.parse::<std::net::Ipv4Addr>().is_ok() && ip.split('.').count() == 4
}

fn check_target(server_ip: &str, server_port: Option<u16>) -> Result<()> {
    if !is_valid_ipv4(server_ip) {
        return Err(ClientError::validation(
            "server_ip",
            format!("'{}' is not a valid IPv4 format", server_ip),
        ));
    }

    if server_port == Some(0) {
        return Err(ClientError::validation(
            "server_port",
            "must be between 1 and 65535",
        ));
    }

    Ok(())
}

/// Copy the stored access token for `server_ip`, if any, into the request
/// parameters.
fn attach_access_token(
    config: &Config,
    server_ip: &str,
    parameters: &mut Map<String, Value>,
) -> Result<()> {
    with_token_store(&config.access_token_db_file_path, |store| {
        if let Some(entry_id) = store.get_entry_id(server_ip)? {
            if let Some(entry) = store.get_entry(entry_id)? {
                debug!("attaching stored access token for {}", server_ip);
                parameters.insert("access_token".into(), json!(entry.access_token));
            }
        }
        Ok(())
    })
}

/// One request / response exchange over the selected transport. The
/// connection never outlives this call.
fn dispatch(
    config: &Config,
    server_ip: &str,
    server_port: u16,
    opts: &TransportOptions,
    verb: &str,
    parameters: Map<String, Value>,
) -> Result<Response> {
    if opts.web {
        debug!("dispatching {} to {}:{} over HTTP", verb, server_ip, server_port);
        let web_client = WebClientInterface::new(server_ip, server_port, opts.enable_ssl);
        return web_client.send_request(verb, parameters, opts.verify_tls_certificate);
    }

    debug!(
        "dispatching {} to {}:{} over the session protocol",
        verb, server_ip, server_port
    );

    let rsa_wrapper = keys::load_runtime_rsa_wrapper(config)?;
    let mut client = ClientInterface::new(
        server_ip,
        server_port,
        Some(DEFAULT_CLIENT_TIMEOUT),
        rsa_wrapper,
    )?;

    client.connect(DEFAULT_RECEIVE_FIRST)?;
    client.send_request(verb, parameters)?;
    let response = client.recv_response();
    client.close();

    response
}

/// CREATE: request a new container and, unless disabled, store the returned
/// session and container credentials.
pub fn create_container(
    config: &Config,
    server_ip: &str,
    opts: &TransportOptions,
    store_credentials: bool,
) -> Result<CreateOutcome> {
    check_target(server_ip, opts.server_port)?;

    let mut parameters = Map::new();
    attach_access_token(config, server_ip, &mut parameters)?;

    let response = dispatch(
        config,
        server_ip,
        opts.effective_port(),
        opts,
        REQUEST_VERB_CREATE,
        parameters,
    )?;

    if !response.success {
        return Err(ClientError::ResponseFailure(response.message));
    }

    let bundle = match &response.bundle {
        ResponseData::Session(bundle) => bundle.clone(),
        _ => {
            return Err(ClientError::validation(
                "data",
                "expected the session credentials bundle",
            ))
        }
    };

    let mut session_entry_id = None;
    let mut container_entry_id = None;

    if store_credentials {
        let server_port = opts.effective_port();

        session_entry_id = Some(with_session_store(
            &config.session_credentials_db_file_path,
            |store| {
                let (entry_id, _) = store.add_entry(
                    server_ip,
                    server_port,
                    &bundle.container_uuid,
                    &bundle.client_token,
                )?;
                Ok(entry_id)
            },
        )?);

        container_entry_id = Some(with_container_store(
            &config.container_credentials_db_file_path,
            |store| {
                let (entry_id, _) = store.add_entry(
                    server_ip,
                    server_port,
                    &bundle.container_username,
                    &bundle.container_password,
                    bundle.container_listen_port,
                )?;
                Ok(entry_id)
            },
        )?);

        info!(
            "stored credentials for container {} on {}",
            bundle.container_uuid, server_ip
        );
    }

    Ok(CreateOutcome {
        response,
        bundle,
        session_entry_id,
        container_entry_id,
    })
}

/// DESTROY: tear down the container referenced by a local session entry and,
/// unless disabled, delete the matching local credentials.
pub fn destroy_container(
    config: &Config,
    session_entry_id: i64,
    opts: &TransportOptions,
    delete_credentials: bool,
) -> Result<DestroyOutcome> {
    let entry = with_session_store(&config.session_credentials_db_file_path, |store| {
        store.get_entry(session_entry_id)
    })?
    .ok_or_else(|| {
        ClientError::Lookup(format!(
            "no session credentials entry with ID {}",
            session_entry_id
        ))
    })?;

    check_target(&entry.server_ip, opts.server_port)?;

    let mut parameters = Map::new();
    parameters.insert("container_uuid".into(), json!(entry.container_uuid));
    parameters.insert("client_token".into(), json!(entry.client_token));
    attach_access_token(config, &entry.server_ip, &mut parameters)?;

    let server_port = opts.server_port.unwrap_or(entry.server_port);
    let response = dispatch(
        config,
        &entry.server_ip,
        server_port,
        opts,
        REQUEST_VERB_DESTROY,
        parameters,
    )?;

    if !response.success {
        return Err(ClientError::ResponseFailure(response.message));
    }

    let mut deleted_session_entry_id = None;
    let mut deleted_container_entry_id = None;

    if delete_credentials {
        with_session_store(&config.session_credentials_db_file_path, |store| {
            store.delete_entry(session_entry_id)
        })?;
        deleted_session_entry_id = Some(session_entry_id);

        deleted_container_entry_id = with_container_store(
            &config.container_credentials_db_file_path,
            |store| match store.get_entry_id(&entry.server_ip)? {
                Some(entry_id) => {
                    store.delete_entry(entry_id)?;
                    Ok(Some(entry_id))
                }
                None => Ok(None),
            },
        )?;

        info!(
            "deleted credentials for container {} on {}",
            entry.container_uuid, entry.server_ip
        );
    }

    Ok(DestroyOutcome {
        response,
        deleted_session_entry_id,
        deleted_container_entry_id,
    })
}

/// STAT: fetch runtime statistics. Never mutates the stores.
pub fn server_stat(config: &Config, server_ip: &str, opts: &TransportOptions) -> Result<Response> {
    check_target(server_ip, opts.server_port)?;

    let mut parameters = Map::new();
    attach_access_token(config, server_ip, &mut parameters)?;

    let response = dispatch(
        config,
        server_ip,
        opts.effective_port(),
        opts,
        REQUEST_VERB_STAT,
        parameters,
    )?;

    if !response.success {
        return Err(ClientError::ResponseFailure(response.message));
    }

    Ok(response)
}

/// Store a new access token for a server. At most one token per IP: a
/// duplicate add fails before anything is written.
pub fn add_access_token(
    config: &Config,
    server_ip: &str,
    server_port: u16,
    access_token: &str,
) -> Result<(i64, i64)> {
    check_target(server_ip, Some(server_port))?;

    if access_token.is_empty() {
        return Err(ClientError::validation("access_token", "must not be empty"));
    }

    with_token_store(&config.access_token_db_file_path, |store| {
        if store.get_entry_id(server_ip)?.is_some() {
            return Err(ClientError::Lookup(format!(
                "an access token entry already exists for {}",
                server_ip
            )));
        }

        store.add_entry(server_ip, server_port, access_token)
    })
}
