// src/client.rs
// Framed TCP session transport for the Anweddol protocol
//
// Every payload in both directions is preceded by an 8-byte ASCII header
// carrying the decimal body length, right-padded with '='. Each header is
// acknowledged with a single '1'/'0' byte before the body is sent, and key
// frames get a second ack confirming the body itself was accepted.
//
// Handshake (send-first by default, the peer runs the mirror order):
//   send_public_rsa_key -> recv_public_rsa_key -> send_aes_key -> recv_aes_key

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use log::debug;
use serde_json::{Map, Value};

use crate::crypto::{AesWrapper, RsaWrapper, AES_IV_SIZE, AES_KEY_SIZE};
use crate::error::{ClientError, Result};
use crate::sanitize::{make_request, verify_response, Response};

pub const DEFAULT_SERVER_LISTEN_PORT: u16 = 6150;
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RECEIVE_FIRST: bool = false;

pub const MESSAGE_OK: u8 = b'1';
pub const MESSAGE_NOK: u8 = b'0';

pub const REQUEST_VERB_CREATE: &str = "CREATE";
pub const REQUEST_VERB_DESTROY: &str = "DESTROY";
pub const REQUEST_VERB_STAT: &str = "STAT";

pub const RESPONSE_MSG_OK: &str = "OK";
pub const RESPONSE_MSG_BAD_AUTH: &str = "Bad authentification";
pub const RESPONSE_MSG_BAD_REQ: &str = "Bad request";
pub const RESPONSE_MSG_REFUSED_REQ: &str = "Refused request";
pub const RESPONSE_MSG_UNAVAILABLE: &str = "Unavailable";
pub const RESPONSE_MSG_INTERNAL_ERROR: &str = "Internal error";

pub const FRAME_HEADER_SIZE: usize = 8;
pub const MAX_FRAME_SIZE: usize = 99_999_999;
const FRAME_PAD: u8 = b'=';

/// Encode a body length into the 8-byte `=`-padded header.
pub fn encode_frame_header(length: usize) -> Result<[u8; FRAME_HEADER_SIZE]> {
    if length == 0 || length > MAX_FRAME_SIZE {
        return Err(ClientError::Transport(format!(
            "frame length {} is out of range",
            length
        )));
    }

    let digits = length.to_string();
    let mut header = [FRAME_PAD; FRAME_HEADER_SIZE];
    header[..digits.len()].copy_from_slice(digits.as_bytes());

    Ok(header)
}

/// Parse a received header. Non-positive and malformed lengths are errors,
/// never truncated.
pub fn parse_frame_header(header: &[u8; FRAME_HEADER_SIZE]) -> Result<usize> {
    let text = std::str::from_utf8(header)
        .map_err(|_| ClientError::Transport("frame header is not ASCII".into()))?;
    let digits = text.split('=').next().unwrap_or("");

    let length: i64 = digits.parse().map_err(|_| {
        ClientError::Transport(format!("malformed frame header {:?}", text))
    })?;

    if length <= 0 {
        return Err(ClientError::Transport(format!(
            "received bad frame length: {}",
            length
        )));
    }

    Ok(length as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connected,
    HalfKeyed,
    Keyed,
}

/// One encrypted client connection to an Anweddol server.
///
/// The wrappers are owned by the connection for its whole lifetime; the
/// socket lives from `connect` to `close` and any protocol deviation closes
/// it on the way out.
pub struct ClientInterface {
    server_ip: String,
    server_port: u16,
    timeout: Option<Duration>,
    stream: Option<TcpStream>,
    state: ConnectionState,
    rsa_wrapper: RsaWrapper,
    aes_wrapper: AesWrapper,
}

impl ClientInterface {
    /// Build a client for `server_ip:server_port`. Without a caller-supplied
    /// RSA wrapper a fresh default-size pair is generated.
    pub fn new(
        server_ip: &str,
        server_port: u16,
        timeout: Option<Duration>,
        rsa_wrapper: Option<RsaWrapper>,
    ) -> Result<Self> {
        let rsa_wrapper = match rsa_wrapper {
            Some(wrapper) => wrapper,
            None => RsaWrapper::new()?,
        };

        Ok(ClientInterface {
            server_ip: server_ip.to_string(),
            server_port,
            timeout,
            stream: None,
            state: ConnectionState::Closed,
            rsa_wrapper,
            aes_wrapper: AesWrapper::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn rsa_wrapper(&self) -> &RsaWrapper {
        &self.rsa_wrapper
    }

    pub fn aes_wrapper(&self) -> &AesWrapper {
        &self.aes_wrapper
    }

    /// Dial the server and run the key exchange. With `receive_first` the
    /// order of every handshake step is mirrored; both peers must agree on
    /// the direction or neither will progress.
    pub fn connect(&mut self, receive_first: bool) -> Result<()> {
        if self.state != ConnectionState::Closed {
            return Err(ClientError::Protocol("connection is already active".into()));
        }

        let stream = TcpStream::connect((self.server_ip.as_str(), self.server_port))?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_write_timeout(self.timeout)?;

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        debug!(
            "connected to {}:{}, starting handshake (receive_first={})",
            self.server_ip, self.server_port, receive_first
        );

        if receive_first {
            self.recv_public_rsa_key()?;
            self.send_public_rsa_key()?;
            self.recv_aes_key()?;
            self.send_aes_key()?;
        } else {
            self.send_public_rsa_key()?;
            self.recv_public_rsa_key()?;
            self.send_aes_key()?;
            self.recv_aes_key()?;
        }

        debug!("handshake complete");
        Ok(())
    }

    /// Close the connection. Idempotent.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.state = ConnectionState::Closed;
    }

    // Every public protocol step runs through here so a failing call never
    // leaves a half-usable socket behind.
    fn closing_on_error<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| ClientError::Protocol("client must be connected to the server".into()))
    }

    fn require_rsa_stage(&self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(ClientError::Protocol(
                "client must be connected to the server".into(),
            ));
        }
        Ok(())
    }

    fn require_aes_stage(&self) -> Result<()> {
        match self.state {
            ConnectionState::Closed => Err(ClientError::Protocol(
                "client must be connected to the server".into(),
            )),
            ConnectionState::Connected => Err(ClientError::Protocol(
                "RSA keys have not been exchanged".into(),
            )),
            _ => Ok(()),
        }
    }

    fn require_keyed(&self) -> Result<()> {
        match self.state {
            ConnectionState::Closed => Err(ClientError::Protocol(
                "client must be connected to the server".into(),
            )),
            ConnectionState::Keyed => Ok(()),
            _ => Err(ClientError::Protocol(
                "session keys have not been exchanged".into(),
            )),
        }
    }

    fn send_ack(&mut self, ok: bool) -> Result<()> {
        let byte = [if ok { MESSAGE_OK } else { MESSAGE_NOK }];
        self.stream()?.write_all(&byte)?;
        Ok(())
    }

    fn recv_ack(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.stream()?.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    // Acks are compared by byte value.
    fn require_ok_ack(&mut self, refused: &str) -> Result<()> {
        if self.recv_ack()? != MESSAGE_OK {
            return Err(ClientError::Transport(format!("peer refused the {}", refused)));
        }
        Ok(())
    }

    fn send_frame(&mut self, body: &[u8]) -> Result<()> {
        let header = encode_frame_header(body.len())?;
        self.stream()?.write_all(&header)?;
        self.require_ok_ack("packet")?;
        self.stream()?.write_all(body)?;
        Ok(())
    }

    fn recv_frame(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.stream()?.read_exact(&mut header)?;

        let length = match parse_frame_header(&header) {
            Ok(length) => {
                self.send_ack(true)?;
                length
            }
            Err(err) => {
                let _ = self.send_ack(false);
                return Err(err);
            }
        };

        let mut body = vec![0u8; length];
        self.stream()?.read_exact(&mut body)?;
        Ok(body)
    }

    /// Send the local public key as a PEM frame.
    pub fn send_public_rsa_key(&mut self) -> Result<()> {
        self.closing_on_error(|client| {
            client.require_rsa_stage()?;

            let pem = client.rsa_wrapper.public_key_pem()?;
            client.send_frame(pem.as_bytes())?;
            client.require_ok_ack("RSA key")?;

            if client.state == ConnectionState::Connected {
                client.state = ConnectionState::HalfKeyed;
            }
            Ok(())
        })
    }

    /// Receive the peer's PEM public key and install it as the remote key.
    pub fn recv_public_rsa_key(&mut self) -> Result<()> {
        self.closing_on_error(|client| {
            client.require_rsa_stage()?;

            let body = client.recv_frame()?;
            match client.install_remote_key(&body) {
                Ok(()) => {
                    client.send_ack(true)?;
                    if client.state == ConnectionState::Connected {
                        client.state = ConnectionState::HalfKeyed;
                    }
                    Ok(())
                }
                Err(err) => {
                    let _ = client.send_ack(false);
                    Err(err)
                }
            }
        })
    }

    fn install_remote_key(&mut self, body: &[u8]) -> Result<()> {
        let pem = std::str::from_utf8(body)
            .map_err(|_| ClientError::Crypto("received RSA key is not valid UTF-8".into()))?;
        self.rsa_wrapper.set_remote_public_key_pem(pem)
    }

    /// Send the local AES key and IV, RSA-encrypted under the peer's key.
    pub fn send_aes_key(&mut self) -> Result<()> {
        self.closing_on_error(|client| {
            client.require_aes_stage()?;

            let (key, iv) = client.aes_wrapper.key();
            let mut block = Vec::with_capacity(AES_KEY_SIZE + AES_IV_SIZE);
            block.extend_from_slice(key);
            block.extend_from_slice(iv);

            let cipher = client.rsa_wrapper.encrypt(&block, false)?;
            client.send_frame(&cipher)?;
            client.require_ok_ack("AES key")?;

            client.state = ConnectionState::Keyed;
            Ok(())
        })
    }

    /// Receive the peer's AES key block and install key and IV verbatim.
    pub fn recv_aes_key(&mut self) -> Result<()> {
        self.closing_on_error(|client| {
            client.require_aes_stage()?;

            let body = client.recv_frame()?;
            match client.install_aes_key(&body) {
                Ok(()) => {
                    client.send_ack(true)?;
                    client.state = ConnectionState::Keyed;
                    Ok(())
                }
                Err(err) => {
                    let _ = client.send_ack(false);
                    Err(err)
                }
            }
        })
    }

    fn install_aes_key(&mut self, body: &[u8]) -> Result<()> {
        let block = self.rsa_wrapper.decrypt(body)?;
        if block.len() != AES_KEY_SIZE + AES_IV_SIZE {
            return Err(ClientError::Crypto(format!(
                "decrypted AES key block has length {}",
                block.len()
            )));
        }

        // The IV travels with the key; a regenerated one would silently
        // desynchronize the session.
        self.aes_wrapper
            .set_key(&block[..AES_KEY_SIZE], Some(&block[AES_KEY_SIZE..]))
    }

    /// Validate, encrypt and send a request document.
    pub fn send_request(&mut self, verb: &str, parameters: Map<String, Value>) -> Result<()> {
        self.closing_on_error(|client| {
            client.require_keyed()?;

            let document = make_request(verb, parameters)?;
            let payload = serde_json::to_string(&document)
                .map_err(|e| ClientError::Transport(e.to_string()))?;

            let cipher = client.aes_wrapper.encrypt(payload.as_bytes());
            client.send_frame(&cipher)
        })
    }

    /// Receive, decrypt and validate the response to the last request.
    pub fn recv_response(&mut self) -> Result<Response> {
        self.closing_on_error(|client| {
            client.require_keyed()?;

            let body = client.recv_frame()?;
            let payload = client.aes_wrapper.decrypt_string(&body)?;
            let document: Value = serde_json::from_str(&payload)
                .map_err(|e| ClientError::validation("response", e.to_string()))?;

            verify_response(&document)
        })
    }
}

impl Drop for ClientInterface {
    fn drop(&mut self) {
        self.close();
    }
}
