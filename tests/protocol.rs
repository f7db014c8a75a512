// tests/protocol.rs
// End-to-end exercises of the session protocol, the HTTP transport and the
// verb orchestration, against in-process mock servers on the loopback
// interface.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use serde_json::{json, Map, Value};

use anweddol_client::client::{
    encode_frame_header, parse_frame_header, ClientInterface, ConnectionState, MESSAGE_NOK,
    MESSAGE_OK, REQUEST_VERB_STAT,
};
use anweddol_client::commands::{self, TransportOptions};
use anweddol_client::config::Config;
use anweddol_client::crypto::{AesWrapper, RsaWrapper, AES_KEY_SIZE, DEFAULT_RSA_EXPONENT};
use anweddol_client::db::{
    with_container_store, with_session_store, with_token_store,
};
use anweddol_client::error::ClientError;
use anweddol_client::sanitize::ResponseData;

const TEST_RSA_KEY_SIZE: usize = 2048;
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// Key generation is expensive; every test shares two cached pairs.
static CLIENT_KEY_PEMS: OnceLock<(String, String)> = OnceLock::new();
static SERVER_KEY_PEMS: OnceLock<(String, String)> = OnceLock::new();

fn cached_pems(slot: &'static OnceLock<(String, String)>) -> &'static (String, String) {
    slot.get_or_init(|| {
        let mut wrapper = RsaWrapper::empty();
        wrapper
            .generate_key_pair(DEFAULT_RSA_EXPONENT, TEST_RSA_KEY_SIZE)
            .unwrap();
        (
            wrapper.private_key_pem().unwrap(),
            wrapper.public_key_pem().unwrap(),
        )
    })
}

fn client_rsa() -> RsaWrapper {
    let (private_pem, public_pem) = cached_pems(&CLIENT_KEY_PEMS);
    let mut wrapper = RsaWrapper::empty();
    wrapper.set_private_key_pem(private_pem, false).unwrap();
    wrapper.set_public_key_pem(public_pem).unwrap();
    wrapper
}

fn server_rsa() -> RsaWrapper {
    let (private_pem, public_pem) = cached_pems(&SERVER_KEY_PEMS);
    let mut wrapper = RsaWrapper::empty();
    wrapper.set_private_key_pem(private_pem, false).unwrap();
    wrapper.set_public_key_pem(public_pem).unwrap();
    wrapper
}

fn client_token() -> String {
    "A".repeat(255)
}

fn session_bundle_data() -> Value {
    json!({
        "container_uuid": "00000000-0000-0000-0000-000000000001",
        "client_token": client_token(),
        "container_iso_sha256": "ab".repeat(32),
        "container_username": "user_00001",
        "container_password": "pw1",
        "container_listen_port": 22,
    })
}

// ---------------------------------------------------------------------------
// Mock peer plumbing
// ---------------------------------------------------------------------------

fn peer_read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).unwrap();
    let length = parse_frame_header(&header).unwrap();
    stream.write_all(&[MESSAGE_OK]).unwrap();

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).unwrap();
    body
}

fn peer_write_frame(stream: &mut TcpStream, body: &[u8], key_frame: bool) {
    stream.write_all(&encode_frame_header(body.len()).unwrap()).unwrap();

    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).unwrap();
    assert_eq!(ack[0], MESSAGE_OK);

    stream.write_all(body).unwrap();

    if key_frame {
        stream.read_exact(&mut ack).unwrap();
        assert_eq!(ack[0], MESSAGE_OK);
    }
}

/// Run the receive-first mirror of the client handshake, returning the
/// installed AES state.
fn peer_handshake(stream: &mut TcpStream) -> AesWrapper {
    let mut rsa = server_rsa();

    // Client public key frame, then the body-acceptance ack.
    let pem = peer_read_frame(stream);
    rsa.set_remote_public_key_pem(std::str::from_utf8(&pem).unwrap())
        .unwrap();
    stream.write_all(&[MESSAGE_OK]).unwrap();

    // Own public key frame.
    peer_write_frame(stream, rsa.public_key_pem().unwrap().as_bytes(), true);

    // Client AES key block.
    let cipher = peer_read_frame(stream);
    let block = rsa.decrypt(&cipher).unwrap();
    let mut aes = AesWrapper::new();
    aes.set_key(&block[..AES_KEY_SIZE], Some(&block[AES_KEY_SIZE..]))
        .unwrap();
    stream.write_all(&[MESSAGE_OK]).unwrap();

    // Echo the session key back under the client's public key.
    let echoed = rsa.encrypt(&block, false).unwrap();
    peer_write_frame(stream, &echoed, true);

    aes
}

/// A mock server completing one handshake + request/response exchange.
/// Returns its port and a channel yielding the decrypted request document.
fn spawn_session_server(response: Value) -> (u16, Receiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (sender, receiver) = channel();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(TEST_TIMEOUT)).unwrap();

        let aes = peer_handshake(&mut stream);

        let request_cipher = peer_read_frame(&mut stream);
        let request: Value =
            serde_json::from_str(&aes.decrypt_string(&request_cipher).unwrap()).unwrap();
        sender.send(request).unwrap();

        let payload = serde_json::to_string(&response).unwrap();
        peer_write_frame(&mut stream, &aes.encrypt(payload.as_bytes()), false);
    });

    (port, receiver)
}

fn test_config(base: &std::path::Path) -> Config {
    let mut config = Config::with_base_dir(base);

    // Pre-seed the key files so the orchestration loads the cached test pair
    // instead of generating a full-size one.
    let (private_pem, public_pem) = cached_pems(&CLIENT_KEY_PEMS);
    std::fs::create_dir_all(config.private_rsa_key_file_path.parent().unwrap()).unwrap();
    std::fs::write(&config.private_rsa_key_file_path, private_pem).unwrap();
    std::fs::write(&config.public_rsa_key_file_path, public_pem).unwrap();

    config.enable_onetime_rsa_keys = false;
    config
}

fn session_entry_count(config: &Config) -> usize {
    with_session_store(&config.session_credentials_db_file_path, |store| {
        store.list_entries()
    })
    .unwrap()
    .len()
}

fn container_entry_count(config: &Config) -> usize {
    with_container_store(&config.container_credentials_db_file_path, |store| {
        store.list_entries()
    })
    .unwrap()
    .len()
}

// ---------------------------------------------------------------------------
// Session transport
// ---------------------------------------------------------------------------

#[test]
fn test_handshake_and_stat_exchange() {
    let (port, requests) = spawn_session_server(json!({
        "success": true,
        "message": "OK",
        "data": { "uptime": 42, "version": "4.1.2" },
    }));

    let mut client =
        ClientInterface::new("127.0.0.1", port, Some(TEST_TIMEOUT), Some(client_rsa())).unwrap();

    client.connect(false).unwrap();
    assert_eq!(client.state(), ConnectionState::Keyed);

    client.send_request(REQUEST_VERB_STAT, Map::new()).unwrap();
    let response = client.recv_response().unwrap();
    client.close();

    assert!(response.success);
    assert_eq!(response.data["uptime"], 42);
    match response.bundle {
        ResponseData::Stat(stat) => {
            assert_eq!(stat.uptime, 42);
            assert_eq!(stat.version, "4.1.2");
        }
        other => panic!("unexpected bundle: {other:?}"),
    }

    let request = requests.recv_timeout(TEST_TIMEOUT).unwrap();
    assert_eq!(request["verb"], "STAT");
    assert!(request["parameters"].as_object().unwrap().is_empty());
}

#[test]
fn test_handshake_same_direction_deadlocks() {
    // A peer that also sends first: it pushes its own header and waits for an
    // ack, exactly like the client does. Neither side ever answers.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = stream.write_all(&encode_frame_header(451).unwrap());
        let mut ack = [0u8; 1];
        let _ = stream.read_exact(&mut ack);
    });

    let mut client = ClientInterface::new(
        "127.0.0.1",
        port,
        Some(Duration::from_millis(300)),
        Some(client_rsa()),
    )
    .unwrap();

    assert!(matches!(
        client.connect(false),
        Err(ClientError::Transport(_))
    ));
    assert!(client.is_closed());
}

#[test]
fn test_negative_length_header_is_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (sender, receiver) = channel();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(TEST_TIMEOUT)).unwrap();

        let _aes = peer_handshake(&mut stream);
        let _ = peer_read_frame(&mut stream);

        // Misbehave: answer with a negative length header.
        stream.write_all(b"-1======").unwrap();

        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).unwrap();
        sender.send(ack[0]).unwrap();
    });

    let mut client =
        ClientInterface::new("127.0.0.1", port, Some(TEST_TIMEOUT), Some(client_rsa())).unwrap();

    client.connect(false).unwrap();
    client.send_request(REQUEST_VERB_STAT, Map::new()).unwrap();

    assert!(matches!(
        client.recv_response(),
        Err(ClientError::Transport(_))
    ));
    assert!(client.is_closed());

    // The peer got a negative ack before the connection went down.
    assert_eq!(receiver.recv_timeout(TEST_TIMEOUT).unwrap(), MESSAGE_NOK);
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

#[test]
fn test_create_stores_both_credential_rows() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let (port, requests) = spawn_session_server(json!({
        "success": true,
        "message": "OK",
        "data": session_bundle_data(),
    }));

    let opts = TransportOptions {
        server_port: Some(port),
        ..TransportOptions::default()
    };

    let outcome = commands::create_container(&config, "127.0.0.1", &opts, true).unwrap();

    let session_entry_id = outcome.session_entry_id.unwrap();
    let container_entry_id = outcome.container_entry_id.unwrap();

    let session_entry = with_session_store(&config.session_credentials_db_file_path, |store| {
        store.get_entry(session_entry_id)
    })
    .unwrap()
    .unwrap();
    assert_eq!(session_entry.server_ip, "127.0.0.1");
    assert_eq!(session_entry.server_port, port);
    assert_eq!(
        session_entry.container_uuid,
        "00000000-0000-0000-0000-000000000001"
    );

    let container_entry =
        with_container_store(&config.container_credentials_db_file_path, |store| {
            store.get_entry(container_entry_id)
        })
        .unwrap()
        .unwrap();
    assert_eq!(container_entry.server_ip, session_entry.server_ip);
    assert_eq!(container_entry.container_username, "user_00001");
    assert_eq!(container_entry.container_listen_port, 22);

    let request = requests.recv_timeout(TEST_TIMEOUT).unwrap();
    assert_eq!(request["verb"], "CREATE");
}

#[test]
fn test_create_attaches_stored_access_token() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    commands::add_access_token(&config, "127.0.0.1", 6150, "opaque-token").unwrap();

    let (port, requests) = spawn_session_server(json!({
        "success": true,
        "message": "OK",
        "data": session_bundle_data(),
    }));

    let opts = TransportOptions {
        server_port: Some(port),
        ..TransportOptions::default()
    };
    commands::create_container(&config, "127.0.0.1", &opts, true).unwrap();

    let request = requests.recv_timeout(TEST_TIMEOUT).unwrap();
    assert_eq!(request["parameters"]["access_token"], "opaque-token");
}

#[test]
fn test_create_refused_leaves_stores_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let (port, _requests) = spawn_session_server(json!({
        "success": false,
        "message": "Unavailable",
        "data": {},
    }));

    let opts = TransportOptions {
        server_port: Some(port),
        ..TransportOptions::default()
    };

    match commands::create_container(&config, "127.0.0.1", &opts, true) {
        Err(ClientError::ResponseFailure(message)) => assert_eq!(message, "Unavailable"),
        other => panic!("unexpected result: {other:?}"),
    }

    assert_eq!(session_entry_count(&config), 0);
    assert_eq!(container_entry_count(&config), 0);
}

#[test]
fn test_create_transport_failure_leaves_stores_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    // A peer that drops the connection immediately after accepting it.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
    });

    let opts = TransportOptions {
        server_port: Some(port),
        ..TransportOptions::default()
    };

    assert!(matches!(
        commands::create_container(&config, "127.0.0.1", &opts, true),
        Err(ClientError::Transport(_))
    ));

    assert_eq!(session_entry_count(&config), 0);
    assert_eq!(container_entry_count(&config), 0);
}

#[test]
fn test_destroy_deletes_both_credential_rows() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let (port, requests) = spawn_session_server(json!({
        "success": true,
        "message": "OK",
        "data": {},
    }));

    let uuid = "00000000-0000-0000-0000-000000000001";
    let token = client_token();

    let (session_entry_id, _) =
        with_session_store(&config.session_credentials_db_file_path, |store| {
            store.add_entry("127.0.0.1", port, uuid, &token)
        })
        .unwrap();
    let (container_entry_id, _) =
        with_container_store(&config.container_credentials_db_file_path, |store| {
            store.add_entry("127.0.0.1", port, "user_00001", "pw1", 22)
        })
        .unwrap();

    commands::add_access_token(&config, "10.9.9.9", 6150, "unrelated").unwrap();

    let outcome = commands::destroy_container(
        &config,
        session_entry_id,
        &TransportOptions::default(),
        true,
    )
    .unwrap();

    assert_eq!(outcome.deleted_session_entry_id, Some(session_entry_id));
    assert_eq!(outcome.deleted_container_entry_id, Some(container_entry_id));
    assert_eq!(session_entry_count(&config), 0);
    assert_eq!(container_entry_count(&config), 0);

    // The token store is not involved in DESTROY.
    let tokens = with_token_store(&config.access_token_db_file_path, |store| {
        store.list_entries()
    })
    .unwrap();
    assert_eq!(tokens.len(), 1);

    let request = requests.recv_timeout(TEST_TIMEOUT).unwrap();
    assert_eq!(request["verb"], "DESTROY");
    assert_eq!(request["parameters"]["container_uuid"], uuid);
    assert_eq!(request["parameters"]["client_token"], token.as_str());
}

#[test]
fn test_stat_does_not_touch_stores() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let (port, _requests) = spawn_session_server(json!({
        "success": true,
        "message": "OK",
        "data": { "uptime": 42, "version": "4.1.2" },
    }));

    let opts = TransportOptions {
        server_port: Some(port),
        ..TransportOptions::default()
    };

    let response = commands::server_stat(&config, "127.0.0.1", &opts).unwrap();
    assert_eq!(response.data["uptime"], 42);

    assert_eq!(session_entry_count(&config), 0);
    assert_eq!(container_entry_count(&config), 0);
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// Minimal one-shot HTTP server: answers one POST with a canned response.
fn spawn_http_server(status_line: &'static str, body: Value) -> (u16, Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (sender, receiver) = channel();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(TEST_TIMEOUT)).unwrap();

        let mut raw = Vec::new();
        let mut buffer = [0u8; 1024];
        let request = loop {
            let n = stream.read(&mut buffer).unwrap();
            raw.extend_from_slice(&buffer[..n]);
            if let Some(header_end) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                let header = String::from_utf8_lossy(&raw[..header_end]).to_string();
                let content_length = header
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                while raw.len() < header_end + 4 + content_length {
                    let n = stream.read(&mut buffer).unwrap();
                    raw.extend_from_slice(&buffer[..n]);
                }
                break String::from_utf8_lossy(&raw).to_string();
            }
        };
        sender.send(request).unwrap();

        let payload = serde_json::to_string(&body).unwrap();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line,
            payload.len(),
            payload
        );
        stream.write_all(response.as_bytes()).unwrap();
    });

    (port, receiver)
}

#[test]
fn test_web_stat_roundtrip() {
    let (port, requests) = spawn_http_server(
        "200 OK",
        json!({
            "success": true,
            "message": "OK",
            "data": { "uptime": 42, "version": "4.1.2" },
        }),
    );

    let client = anweddol_client::web::WebClientInterface::new("127.0.0.1", port, false);
    let response = client.send_request(REQUEST_VERB_STAT, Map::new(), true).unwrap();

    assert!(response.success);
    assert_eq!(response.data["version"], "4.1.2");

    let request = requests.recv_timeout(TEST_TIMEOUT).unwrap();
    assert!(request.starts_with("POST /stat HTTP/1.1"));
    assert!(request
        .to_ascii_lowercase()
        .contains("content-type: application/json"));
}

#[test]
fn test_web_error_status_is_fatal() {
    let (port, _requests) = spawn_http_server("503 Service Unavailable", json!({}));

    let client = anweddol_client::web::WebClientInterface::new("127.0.0.1", port, false);

    match client.send_request(REQUEST_VERB_STAT, Map::new(), true) {
        Err(ClientError::Transport(message)) => assert!(message.contains("503")),
        other => panic!("unexpected result: {other:?}"),
    }
}
