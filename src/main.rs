// src/main.rs
// The Anweddol client CLI

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use serde_json::json;

use anweddol_client::client::DEFAULT_SERVER_LISTEN_PORT;
use anweddol_client::commands::{self, TransportOptions};
use anweddol_client::config::Config;
use anweddol_client::db::{with_container_store, with_session_store, with_token_store};
use anweddol_client::error::{ClientError, Result};
use anweddol_client::keys;
use anweddol_client::sanitize::ResponseData;

const COLOR_GREEN: &str = "\x1b[92m";
const COLOR_RED: &str = "\x1b[91m";
const COLOR_RESET: &str = "\x1b[0m";

const JSON_STATUS_SUCCESS: &str = "OK";
const JSON_STATUS_ERROR: &str = "ERROR";

#[derive(Parser)]
#[command(
    name = "anweddol-client",
    version,
    about = "The Anweddol client CLI",
    long_about = "Request and manage disposable SSH-reachable containers on Anweddol servers.\n\
                  Interrupting a command leaves no partial local state: credentials are only\n\
                  written once a response has been received and validated."
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a container on a remote server
    Create {
        /// Server IP
        ip: String,
        /// Server listen port
        #[arg(short, long)]
        port: Option<u16>,
        /// Use the HTTP transport
        #[arg(short, long)]
        web: bool,
        /// Enable SSL for HTTP communications
        #[arg(short, long)]
        ssl: bool,
        /// Do not verify the server SSL certificate (for self-signed ones)
        #[arg(long)]
        no_ssl_verification: bool,
        /// Display the received credentials in the terminal
        #[arg(long)]
        show_credentials: bool,
        /// Do not store the received credentials
        #[arg(long)]
        do_not_store: bool,
        /// Print output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Destroy a created container on a remote server
    Destroy {
        /// Local session credentials entry ID
        session_entry_id: i64,
        /// Server listen port
        #[arg(short, long)]
        port: Option<u16>,
        /// Use the HTTP transport
        #[arg(short, long)]
        web: bool,
        /// Enable SSL for HTTP communications
        #[arg(short, long)]
        ssl: bool,
        /// Do not verify the server SSL certificate (for self-signed ones)
        #[arg(long)]
        no_ssl_verification: bool,
        /// Keep the local credentials entries
        #[arg(long)]
        do_not_delete: bool,
        /// Print output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Get runtime statistics of a remote server
    Stat {
        /// Server IP
        ip: String,
        /// Server listen port
        #[arg(short, long)]
        port: Option<u16>,
        /// Use the HTTP transport
        #[arg(short, long)]
        web: bool,
        /// Enable SSL for HTTP communications
        #[arg(short, long)]
        ssl: bool,
        /// Do not verify the server SSL certificate (for self-signed ones)
        #[arg(long)]
        no_ssl_verification: bool,
        /// Print output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Manage stored session credentials
    Session {
        #[command(subcommand)]
        action: EntryAction,
    },

    /// Manage stored container credentials
    Container {
        #[command(subcommand)]
        action: EntryAction,
    },

    /// Manage access tokens
    AccessToken {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Regenerate the stored RSA key pair
    RegenRsa {
        /// Print output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum EntryAction {
    /// List stored entries
    List {
        /// Print output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Print one entry
    Show {
        entry_id: i64,
        /// Print output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Delete one entry
    Delete {
        entry_id: i64,
        /// Print output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// List stored access tokens
    List {
        /// Print output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Store a new access token for a server
    Add {
        /// Server IP
        ip: String,
        /// Server listen port
        #[arg(short, long)]
        port: Option<u16>,
        /// The access token text
        #[arg(short, long)]
        token: String,
        /// Print output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Print one entry, token included
    Show {
        entry_id: i64,
        /// Print output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Delete one entry
    Delete {
        entry_id: i64,
        /// Print output in JSON format
        #[arg(long)]
        json: bool,
    },
}

fn log_json(status: &str, message: &str, result: serde_json::Value) {
    println!(
        "{}",
        json!({ "status": status, "message": message, "result": result })
    );
}

fn print_error(err: &ClientError, json: bool) {
    if json {
        log_json(
            JSON_STATUS_ERROR,
            "An error occurred",
            json!({ "error": err.kind(), "message": err.to_string() }),
        );
    } else {
        eprintln!("{}An error occurred{}", COLOR_RED, COLOR_RESET);
        eprintln!("  {} : {}", err.kind(), err);
    }
}

fn json_flag(command: &Command) -> bool {
    match command {
        Command::Create { json, .. }
        | Command::Destroy { json, .. }
        | Command::Stat { json, .. }
        | Command::RegenRsa { json } => *json,
        Command::Session { action } | Command::Container { action } => match action {
            EntryAction::List { json }
            | EntryAction::Show { json, .. }
            | EntryAction::Delete { json, .. } => *json,
        },
        Command::AccessToken { action } => match action {
            TokenAction::List { json }
            | TokenAction::Add { json, .. }
            | TokenAction::Show { json, .. }
            | TokenAction::Delete { json, .. } => *json,
        },
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    Config::load(&path.unwrap_or_else(Config::default_path))
}

fn run_create(
    config: &Config,
    ip: String,
    opts: TransportOptions,
    show_credentials: bool,
    do_not_store: bool,
    json: bool,
) -> Result<()> {
    if !json {
        println!("Sending request, waiting for response. This can take some time ...");
    }

    let outcome = commands::create_container(config, &ip, &opts, !do_not_store)?;

    if json {
        log_json(
            JSON_STATUS_SUCCESS,
            "Container successfully created",
            json!({
                "message": outcome.response.message,
                "data": outcome.response.data,
                "session_entry_id": outcome.session_entry_id,
                "container_entry_id": outcome.container_entry_id,
            }),
        );
        return Ok(());
    }

    println!("{}Container successfully created{}", COLOR_GREEN, COLOR_RESET);
    println!("  Message : {}", outcome.response.message);
    println!(
        "  Container ISO checksum : {}",
        outcome.bundle.container_iso_sha256
    );
    if let Some(entry_id) = outcome.session_entry_id {
        println!("  Session credentials entry ID : {}", entry_id);
    }
    if let Some(entry_id) = outcome.container_entry_id {
        println!("  Container credentials entry ID : {}", entry_id);
    }

    if show_credentials {
        println!("Session credentials :");
        println!("  Container UUID : {}", outcome.bundle.container_uuid);
        println!("  Client token : {}", outcome.bundle.client_token);
        println!("  Container username : {}", outcome.bundle.container_username);
        println!("  Container password : {}", outcome.bundle.container_password);
        println!(
            "  Container listen port : {}",
            outcome.bundle.container_listen_port
        );
    }

    Ok(())
}

fn run_destroy(
    config: &Config,
    session_entry_id: i64,
    opts: TransportOptions,
    do_not_delete: bool,
    json: bool,
) -> Result<()> {
    if !json {
        println!("Sending request, waiting for response. This can take some time ...");
    }

    let outcome = commands::destroy_container(config, session_entry_id, &opts, !do_not_delete)?;

    if json {
        log_json(
            JSON_STATUS_SUCCESS,
            "Container successfully destroyed",
            json!({
                "message": outcome.response.message,
                "deleted_session_entry_id": outcome.deleted_session_entry_id,
                "deleted_container_entry_id": outcome.deleted_container_entry_id,
            }),
        );
        return Ok(());
    }

    println!(
        "{}Container successfully destroyed{}",
        COLOR_GREEN, COLOR_RESET
    );
    println!("  Message : {}", outcome.response.message);
    Ok(())
}

fn run_stat(config: &Config, ip: String, opts: TransportOptions, json: bool) -> Result<()> {
    if !json {
        println!("Sending request, waiting for response. This can take some time ...");
    }

    let response = commands::server_stat(config, &ip, &opts)?;

    if json {
        log_json(
            JSON_STATUS_SUCCESS,
            "Server statistics",
            json!({ "message": response.message, "data": response.data }),
        );
        return Ok(());
    }

    println!("{}Server statistics{}", COLOR_GREEN, COLOR_RESET);
    println!("  Message : {}", response.message);
    if let ResponseData::Stat(stat) = &response.bundle {
        println!("  Uptime : {} seconds", stat.uptime);
        println!("  Version : {}", stat.version);
    }
    Ok(())
}

fn run_session(config: &Config, action: EntryAction) -> Result<()> {
    let path = &config.session_credentials_db_file_path;

    match action {
        EntryAction::List { json } => {
            let entries = with_session_store(path, |store| store.list_entries())?;
            if json {
                let list: Vec<_> = entries
                    .iter()
                    .map(|e| json!([e.entry_id, e.created_at, e.server_ip]))
                    .collect();
                log_json(
                    JSON_STATUS_SUCCESS,
                    "Stored session credentials",
                    json!({ "entry_list": list }),
                );
            } else {
                for entry in entries {
                    println!(
                        "Entry ID {} : created {}, server {}",
                        entry.entry_id, entry.created_at, entry.server_ip
                    );
                }
            }
        }
        EntryAction::Show { entry_id, json } => {
            let entry = with_session_store(path, |store| store.get_entry(entry_id))?
                .ok_or_else(|| {
                    ClientError::Lookup(format!("no session credentials entry with ID {}", entry_id))
                })?;
            if json {
                log_json(
                    JSON_STATUS_SUCCESS,
                    "Session credentials entry",
                    json!({
                        "entry_id": entry.entry_id,
                        "created_at": entry.created_at,
                        "server_ip": entry.server_ip,
                        "server_port": entry.server_port,
                        "container_uuid": entry.container_uuid,
                        "client_token": entry.client_token,
                    }),
                );
            } else {
                println!("Entry ID {} :", entry.entry_id);
                println!("  Created : {}", entry.created_at);
                println!("  Server : {}:{}", entry.server_ip, entry.server_port);
                println!("  Container UUID : {}", entry.container_uuid);
                println!("  Client token : {}", entry.client_token);
            }
        }
        EntryAction::Delete { entry_id, json } => {
            with_session_store(path, |store| {
                if store.get_entry(entry_id)?.is_none() {
                    return Err(ClientError::Lookup(format!(
                        "no session credentials entry with ID {}",
                        entry_id
                    )));
                }
                store.delete_entry(entry_id)
            })?;
            if json {
                log_json(
                    JSON_STATUS_SUCCESS,
                    "Entry deleted",
                    json!({ "entry_id": entry_id }),
                );
            } else {
                println!("Entry ID {} deleted", entry_id);
            }
        }
    }

    Ok(())
}

fn run_container(config: &Config, action: EntryAction) -> Result<()> {
    let path = &config.container_credentials_db_file_path;

    match action {
        EntryAction::List { json } => {
            let entries = with_container_store(path, |store| store.list_entries())?;
            if json {
                let list: Vec<_> = entries
                    .iter()
                    .map(|e| json!([e.entry_id, e.created_at, e.server_ip]))
                    .collect();
                log_json(
                    JSON_STATUS_SUCCESS,
                    "Stored container credentials",
                    json!({ "entry_list": list }),
                );
            } else {
                for entry in entries {
                    println!(
                        "Entry ID {} : created {}, server {}",
                        entry.entry_id, entry.created_at, entry.server_ip
                    );
                }
            }
        }
        EntryAction::Show { entry_id, json } => {
            let entry = with_container_store(path, |store| store.get_entry(entry_id))?
                .ok_or_else(|| {
                    ClientError::Lookup(format!(
                        "no container credentials entry with ID {}",
                        entry_id
                    ))
                })?;
            if json {
                log_json(
                    JSON_STATUS_SUCCESS,
                    "Container credentials entry",
                    json!({
                        "entry_id": entry.entry_id,
                        "created_at": entry.created_at,
                        "server_ip": entry.server_ip,
                        "server_port": entry.server_port,
                        "container_username": entry.container_username,
                        "container_password": entry.container_password,
                        "container_listen_port": entry.container_listen_port,
                    }),
                );
            } else {
                println!("Entry ID {} :", entry.entry_id);
                println!("  Created : {}", entry.created_at);
                println!("  Server : {}:{}", entry.server_ip, entry.server_port);
                println!("  Container username : {}", entry.container_username);
                println!("  Container password : {}", entry.container_password);
                println!("  Container listen port : {}", entry.container_listen_port);
            }
        }
        EntryAction::Delete { entry_id, json } => {
            with_container_store(path, |store| {
                if store.get_entry(entry_id)?.is_none() {
                    return Err(ClientError::Lookup(format!(
                        "no container credentials entry with ID {}",
                        entry_id
                    )));
                }
                store.delete_entry(entry_id)
            })?;
            if json {
                log_json(
                    JSON_STATUS_SUCCESS,
                    "Entry deleted",
                    json!({ "entry_id": entry_id }),
                );
            } else {
                println!("Entry ID {} deleted", entry_id);
            }
        }
    }

    Ok(())
}

fn run_access_token(config: &Config, action: TokenAction) -> Result<()> {
    let path = &config.access_token_db_file_path;

    match action {
        TokenAction::List { json } => {
            let entries = with_token_store(path, |store| store.list_entries())?;
            if json {
                let list: Vec<_> = entries
                    .iter()
                    .map(|e| json!([e.entry_id, e.created_at, e.server_ip]))
                    .collect();
                log_json(
                    JSON_STATUS_SUCCESS,
                    "Stored access tokens",
                    json!({ "entry_list": list }),
                );
            } else {
                for entry in entries {
                    println!(
                        "Entry ID {} : created {}, server {}",
                        entry.entry_id, entry.created_at, entry.server_ip
                    );
                }
            }
        }
        TokenAction::Add {
            ip,
            port,
            token,
            json,
        } => {
            let (entry_id, _) = commands::add_access_token(
                config,
                &ip,
                port.unwrap_or(DEFAULT_SERVER_LISTEN_PORT),
                &token,
            )?;
            if json {
                log_json(
                    JSON_STATUS_SUCCESS,
                    "Access token stored",
                    json!({ "entry_id": entry_id }),
                );
            } else {
                println!("{}Access token stored{}", COLOR_GREEN, COLOR_RESET);
                println!("  Entry ID : {}", entry_id);
            }
        }
        TokenAction::Show { entry_id, json } => {
            let entry = with_token_store(path, |store| store.get_entry(entry_id))?
                .ok_or_else(|| {
                    ClientError::Lookup(format!("no access token entry with ID {}", entry_id))
                })?;
            if json {
                log_json(
                    JSON_STATUS_SUCCESS,
                    "Access token entry",
                    json!({
                        "entry_id": entry.entry_id,
                        "created_at": entry.created_at,
                        "server_ip": entry.server_ip,
                        "server_port": entry.server_port,
                        "access_token": entry.access_token,
                    }),
                );
            } else {
                println!("Entry ID {} :", entry.entry_id);
                println!("  Created : {}", entry.created_at);
                println!("  Server : {}:{}", entry.server_ip, entry.server_port);
                println!("  Access token : {}", entry.access_token);
            }
        }
        TokenAction::Delete { entry_id, json } => {
            with_token_store(path, |store| {
                if store.get_entry(entry_id)?.is_none() {
                    return Err(ClientError::Lookup(format!(
                        "no access token entry with ID {}",
                        entry_id
                    )));
                }
                store.delete_entry(entry_id)
            })?;
            if json {
                log_json(
                    JSON_STATUS_SUCCESS,
                    "Entry deleted",
                    json!({ "entry_id": entry_id }),
                );
            } else {
                println!("Entry ID {} deleted", entry_id);
            }
        }
    }

    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config)?;

    match cli.command {
        Command::Create {
            ip,
            port,
            web,
            ssl,
            no_ssl_verification,
            show_credentials,
            do_not_store,
            json,
        } => {
            let opts = TransportOptions {
                web,
                enable_ssl: ssl,
                verify_tls_certificate: !no_ssl_verification,
                server_port: port,
            };
            run_create(&config, ip, opts, show_credentials, do_not_store, json)
        }
        Command::Destroy {
            session_entry_id,
            port,
            web,
            ssl,
            no_ssl_verification,
            do_not_delete,
            json,
        } => {
            let opts = TransportOptions {
                web,
                enable_ssl: ssl,
                verify_tls_certificate: !no_ssl_verification,
                server_port: port,
            };
            run_destroy(&config, session_entry_id, opts, do_not_delete, json)
        }
        Command::Stat {
            ip,
            port,
            web,
            ssl,
            no_ssl_verification,
            json,
        } => {
            let opts = TransportOptions {
                web,
                enable_ssl: ssl,
                verify_tls_certificate: !no_ssl_verification,
                server_port: port,
            };
            run_stat(&config, ip, opts, json)
        }
        Command::Session { action } => run_session(&config, action),
        Command::Container { action } => run_container(&config, action),
        Command::AccessToken { action } => run_access_token(&config, action),
        Command::RegenRsa { json } => {
            let fingerprint = keys::regenerate_rsa_keys(&config)?;
            if json {
                log_json(
                    JSON_STATUS_SUCCESS,
                    "RSA keys regenerated",
                    json!({ "fingerprint": fingerprint }),
                );
            } else {
                println!("{}RSA keys regenerated{}", COLOR_GREEN, COLOR_RESET);
                println!("  Public key fingerprint : {}", fingerprint);
            }
            Ok(())
        }
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let json = json_flag(&cli.command);

    match run(cli) {
        Ok(()) => process::exit(0),
        Err(err) => {
            print_error(&err, json);
            process::exit(-1);
        }
    }
}
