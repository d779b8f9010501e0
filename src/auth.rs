//! Per-client authentication handshake
//!
//! After a driver binds, the host runs a TLS-derived handshake against the
//! accessory over Authenticate packets. Version 1 encrypts a 48-byte
//! pre-master secret to the client's RSA key; version 2 (announced by the
//! device through mismatching header command bytes) runs an ECDH exchange on
//! P-256. Both derive a 48-byte master secret with P_SHA256, verify Finished
//! messages against the packet transcript and install a 16-byte session key
//! on the transport.
//!
//! Inbound packets only advance the state machine; the expensive RSA/ECDH
//! steps run as deferred work on the adapter's ordered queue.

use std::sync::Arc;

use log::{debug, error};
use sha2::{Digest, Sha256};

use crate::bus::GipClient;
use crate::crypto;
use crate::packet::{GIP_CMD_AUTHENTICATE, GIP_OPT_ACKNOWLEDGE, GIP_OPT_INTERNAL};
use crate::{bus::ClientWork, GipError, Result};

const AUTH_CTX_HANDSHAKE: u8 = 0x00;
const AUTH_CTX_CONTROL: u8 = 0x01;

// version 1 handshake commands
const AUTH_CMD_HOST_HELLO: u8 = 0x01;
const AUTH_CMD_CLIENT_HELLO: u8 = 0x02;
const AUTH_CMD_CLIENT_CERTIFICATE: u8 = 0x03;
const AUTH_CMD_HOST_SECRET: u8 = 0x05;
const AUTH_CMD_HOST_FINISH: u8 = 0x07;
const AUTH_CMD_CLIENT_FINISH: u8 = 0x08;

// version 2 handshake commands
const AUTH2_CMD_HOST_HELLO: u8 = 0x21;
const AUTH2_CMD_CLIENT_HELLO: u8 = 0x22;
const AUTH2_CMD_CLIENT_CERTIFICATE: u8 = 0x23;
const AUTH2_CMD_CLIENT_PUBKEY: u8 = 0x24;
const AUTH2_CMD_HOST_PUBKEY: u8 = 0x25;
const AUTH2_CMD_HOST_FINISH: u8 = 0x26;
const AUTH2_CMD_CLIENT_FINISH: u8 = 0x27;

const AUTH_CTRL_COMPLETE: u8 = 0x00;

// handshake header option bits
const AUTH_OPT_ACKNOWLEDGE: u8 = 0x01;
const AUTH_OPT_REQUEST: u8 = 0x02;
const AUTH_OPT_FROM_HOST: u8 = 0x40;

/// Trailer required for v1 clients
const AUTH_TRAILER_LEN: usize = 8;
pub const AUTH_RANDOM_LEN: usize = 32;
const AUTH_CERTIFICATE_MAX_LEN: usize = 1024;
/// DER encoded RSAPublicKey for a 2048-bit modulus
pub const AUTH_PUBKEY_LEN: usize = 270;
pub const AUTH_SECRET_LEN: usize = 48;
pub const AUTH_SESSION_KEY_LEN: usize = 16;

const HANDSHAKE_HDR_LEN: usize = 6;
const DATA_HDR_LEN: usize = 4;
const FULL_HDR_LEN: usize = HANDSHAKE_HDR_LEN + DATA_HDR_LEN;

// client packet body sizes, used to size request packets
const CLIENT_HELLO_LEN: usize = AUTH_RANDOM_LEN + 48;
const CLIENT_FINISH_LEN: usize = 32 + 32;
const CLIENT2_HELLO_LEN: usize = AUTH_RANDOM_LEN + 108 + 32;
const CLIENT2_CERT_LEN: usize = 4 + 136 + 32 + 20 + 576;
const CLIENT2_PUBKEY_LEN: usize = crypto::ECDH_PUBKEY_LEN + 64;

/// ASN.1 SEQUENCE prefix of a 2048-bit RSAPublicKey (len = 0x04 + 0x010a)
const ASN1_RSA_SEQUENCE: [u8; 4] = [0x30, 0x82, 0x01, 0x0a];

const LABEL_MASTER_SECRET: &str = "Master Secret";
const LABEL_HOST_FINISHED: &str = "Host Finished";
const LABEL_DEVICE_FINISHED: &str = "Device Finished";
const LABEL_SESSION_KEY: &str = "EXPORTER DAWN data channel session key for controller";

/// Per-client handshake state
pub struct GipAuth {
    transcript: Sha256,
    random_host: [u8; AUTH_RANDOM_LEN],
    random_client: [u8; AUTH_RANDOM_LEN],
    pubkey_client: Option<Vec<u8>>,
    pubkey_client2: Option<[u8; crypto::ECDH_PUBKEY_LEN]>,
    master_secret: [u8; AUTH_SECRET_LEN],
    last_sent_command: u8,
    failed: bool,
}

impl Default for GipAuth {
    fn default() -> Self {
        Self {
            transcript: Sha256::new(),
            random_host: [0; AUTH_RANDOM_LEN],
            random_client: [0; AUTH_RANDOM_LEN],
            pubkey_client: None,
            pubkey_client2: None,
            master_secret: [0; AUTH_SECRET_LEN],
            last_sent_command: 0,
            failed: false,
        }
    }
}

impl GipAuth {
    /// host random followed by client random, the PRF seed of the handshake
    fn randoms(&self) -> [u8; AUTH_RANDOM_LEN * 2] {
        let mut seed = [0u8; AUTH_RANDOM_LEN * 2];
        seed[..AUTH_RANDOM_LEN].copy_from_slice(&self.random_host);
        seed[AUTH_RANDOM_LEN..].copy_from_slice(&self.random_client);
        seed
    }
}

fn auth_version(command: u8) -> u8 {
    if command >= AUTH2_CMD_HOST_HELLO {
        0x02
    } else {
        0x01
    }
}

/// Build and send a host handshake packet, folding its data region into the
/// transcript.
fn send_handshake(client: &GipClient, auth: &mut GipAuth, command: u8, body: &[u8]) -> Result<()> {
    let data_len = DATA_HDR_LEN + body.len();
    let mut pkt = Vec::with_capacity(HANDSHAKE_HDR_LEN + data_len + AUTH_TRAILER_LEN);

    pkt.push(AUTH_CTX_HANDSHAKE);
    pkt.push(AUTH_OPT_ACKNOWLEDGE | AUTH_OPT_FROM_HOST);
    pkt.push(0x00);
    pkt.push(command);
    pkt.extend_from_slice(&(data_len as u16).to_be_bytes());

    pkt.push(command);
    pkt.push(auth_version(command));
    pkt.extend_from_slice(&(body.len() as u16).to_be_bytes());
    pkt.extend_from_slice(body);

    pkt.resize(pkt.len() + AUTH_TRAILER_LEN, 0);

    auth.last_sent_command = command;
    auth.transcript
        .update(&pkt[HANDSHAKE_HDR_LEN..HANDSHAKE_HDR_LEN + data_len]);

    client.send_with_flags(
        GIP_CMD_AUTHENTICATE,
        GIP_OPT_INTERNAL | GIP_OPT_ACKNOWLEDGE,
        &pkt,
    )
}

/// Ask the device to produce a handshake packet of `len` body bytes
fn request_handshake(client: &GipClient, command: u8, len: usize) -> Result<()> {
    let mut pkt = Vec::with_capacity(HANDSHAKE_HDR_LEN + AUTH_TRAILER_LEN);

    pkt.push(AUTH_CTX_HANDSHAKE);
    pkt.push(AUTH_OPT_REQUEST | AUTH_OPT_FROM_HOST);
    pkt.push(0x00);
    pkt.push(command);
    pkt.extend_from_slice(&((len + DATA_HDR_LEN) as u16).to_be_bytes());
    pkt.resize(pkt.len() + AUTH_TRAILER_LEN, 0);

    client.send_with_flags(
        GIP_CMD_AUTHENTICATE,
        GIP_OPT_INTERNAL | GIP_OPT_ACKNOWLEDGE,
        &pkt,
    )
}

/// Begin the version 1 handshake. Called by the bus once a driver has bound.
pub fn start_handshake(client: &Arc<GipClient>) -> Result<()> {
    let mut auth = client.auth.lock().unwrap();
    *auth = GipAuth::default();

    crypto::random_bytes(&mut auth.random_host);

    let mut body = [0u8; AUTH_RANDOM_LEN + 8];
    body[..AUTH_RANDOM_LEN].copy_from_slice(&auth.random_host);

    send_handshake(client, &mut auth, AUTH_CMD_HOST_HELLO, &body)
}

/// Restart the transcript and greet the device as a version 2 peer
fn send_hello2(client: &GipClient, auth: &mut GipAuth) -> Result<()> {
    // reset transcript after protocol upgrade
    auth.transcript = Sha256::new();
    crypto::random_bytes(&mut auth.random_host);

    let mut body = [0u8; AUTH_RANDOM_LEN + 4];
    body[..AUTH_RANDOM_LEN].copy_from_slice(&auth.random_host);

    send_handshake(client, auth, AUTH2_CMD_HOST_HELLO, &body)
}

fn send_finish(client: &GipClient, auth: &mut GipAuth, command: u8) -> Result<()> {
    let digest = crypto::transcript_digest(&auth.transcript);

    let mut body = [0u8; 32];
    crypto::prf(LABEL_HOST_FINISHED, &auth.master_secret, &digest, &mut body);

    send_handshake(client, auth, command, &body)
}

/// Process one inbound Authenticate payload
pub(crate) fn process_packet(client: &Arc<GipClient>, payload: &[u8]) -> Result<()> {
    let mut auth = client.auth.lock().unwrap();

    // a failed handshake is never retried
    if auth.failed {
        return Ok(());
    }

    let result = process_packet_inner(client, &mut auth, payload);
    if result.is_err() {
        auth.failed = true;
    }

    result
}

fn process_packet_inner(client: &Arc<GipClient>, auth: &mut GipAuth, payload: &[u8]) -> Result<()> {
    if payload.len() < HANDSHAKE_HDR_LEN {
        return Err(GipError::AuthProtocolError("handshake header truncated".into()));
    }

    if payload[2] != 0 {
        return Err(GipError::PeerError(payload[2]));
    }

    if payload[1] & AUTH_OPT_ACKNOWLEDGE != 0 {
        return handle_acknowledge(client, auth);
    }

    process_data(client, auth, payload)
}

/// The device acknowledged our last packet; drive the next handshake step
fn handle_acknowledge(client: &Arc<GipClient>, auth: &mut GipAuth) -> Result<()> {
    match auth.last_sent_command {
        AUTH_CMD_HOST_HELLO => {
            request_handshake(client, AUTH_CMD_CLIENT_HELLO, CLIENT_HELLO_LEN)
        }
        AUTH_CMD_HOST_SECRET => send_finish(client, auth, AUTH_CMD_HOST_FINISH),
        AUTH_CMD_HOST_FINISH => {
            request_handshake(client, AUTH_CMD_CLIENT_FINISH, CLIENT_FINISH_LEN)
        }
        AUTH2_CMD_HOST_HELLO => {
            request_handshake(client, AUTH2_CMD_CLIENT_HELLO, CLIENT2_HELLO_LEN)
        }
        AUTH2_CMD_HOST_PUBKEY => send_finish(client, auth, AUTH2_CMD_HOST_FINISH),
        AUTH2_CMD_HOST_FINISH => {
            request_handshake(client, AUTH2_CMD_CLIENT_FINISH, CLIENT_FINISH_LEN)
        }
        _ => Err(GipError::AuthProtocolError("unexpected acknowledge".into())),
    }
}

fn process_data(client: &Arc<GipClient>, auth: &mut GipAuth, payload: &[u8]) -> Result<()> {
    if payload.len() < FULL_HDR_LEN {
        return Err(GipError::AuthProtocolError("data header truncated".into()));
    }

    // mismatching command bytes announce an auth v2 client
    if payload[3] != payload[HANDSHAKE_HDR_LEN] {
        debug!("client {}: auth protocol upgrade", client.id());
        return send_hello2(client, auth);
    }

    let command = payload[HANDSHAKE_HDR_LEN];
    let body = &payload[FULL_HDR_LEN..];

    match command {
        AUTH_CMD_CLIENT_HELLO => handle_client_hello(client, auth, body)?,
        AUTH_CMD_CLIENT_CERTIFICATE => handle_client_certificate(client, auth, body)?,
        AUTH_CMD_CLIENT_FINISH | AUTH2_CMD_CLIENT_FINISH => {
            handle_client_finish(client, auth, body)?
        }
        AUTH2_CMD_CLIENT_HELLO => handle_client_hello2(client, auth, body)?,
        AUTH2_CMD_CLIENT_CERTIFICATE => handle_client_certificate2(client, body)?,
        AUTH2_CMD_CLIENT_PUBKEY => handle_client_pubkey2(client, auth, body)?,
        command => {
            return Err(GipError::AuthProtocolError(format!(
                "unexpected handshake command {command:#04x}"
            )))
        }
    }

    auth.transcript.update(&payload[HANDSHAKE_HDR_LEN..]);
    Ok(())
}

fn handle_client_hello(client: &GipClient, auth: &mut GipAuth, body: &[u8]) -> Result<()> {
    if body.len() < CLIENT_HELLO_LEN {
        return Err(GipError::AuthProtocolError("client hello truncated".into()));
    }

    auth.random_client.copy_from_slice(&body[..AUTH_RANDOM_LEN]);
    request_handshake(client, AUTH_CMD_CLIENT_CERTIFICATE, AUTH_CERTIFICATE_MAX_LEN)
}

fn handle_client_certificate(client: &GipClient, auth: &mut GipAuth, body: &[u8]) -> Result<()> {
    if body.len() > AUTH_CERTIFICATE_MAX_LEN {
        return Err(GipError::AuthProtocolError("certificate too large".into()));
    }

    // The certificates issued for accessories violate RFC 5280 (empty
    // subject, no subjectAltName), so a conforming X.509 parser rejects
    // them. Locate the RSAPublicKey SEQUENCE directly instead.
    for i in 0..body.len().saturating_sub(ASN1_RSA_SEQUENCE.len()) {
        if body[i..i + ASN1_RSA_SEQUENCE.len()] != ASN1_RSA_SEQUENCE {
            continue;
        }

        if i + AUTH_PUBKEY_LEN > body.len() {
            return Err(GipError::AuthNoKey);
        }

        auth.pubkey_client = Some(body[i..i + AUTH_PUBKEY_LEN].to_vec());
        client.queue_work(ClientWork::AuthRsaExchange(client.id()));

        return Ok(());
    }

    Err(GipError::AuthNoKey)
}

fn handle_client_finish(client: &GipClient, auth: &mut GipAuth, body: &[u8]) -> Result<()> {
    if body.len() < 32 {
        return Err(GipError::AuthProtocolError("client finish truncated".into()));
    }

    let digest = crypto::transcript_digest(&auth.transcript);
    let mut expected = [0u8; 32];
    crypto::prf(
        LABEL_DEVICE_FINISHED,
        &auth.master_secret,
        &digest,
        &mut expected,
    );

    if body[..32] != expected {
        return Err(GipError::AuthTranscriptMismatch);
    }

    client.queue_work(ClientWork::AuthComplete(client.id()));
    Ok(())
}

fn handle_client_hello2(client: &GipClient, auth: &mut GipAuth, body: &[u8]) -> Result<()> {
    if body.len() < AUTH_RANDOM_LEN {
        return Err(GipError::AuthProtocolError("client hello truncated".into()));
    }

    auth.random_client.copy_from_slice(&body[..AUTH_RANDOM_LEN]);
    request_handshake(client, AUTH2_CMD_CLIENT_CERTIFICATE, CLIENT2_CERT_LEN)
}

fn handle_client_certificate2(client: &GipClient, body: &[u8]) -> Result<()> {
    if body.len() < CLIENT2_CERT_LEN {
        return Err(GipError::AuthProtocolError("certificate truncated".into()));
    }

    // descriptive only; the key arrives in a separate packet
    debug!(
        "client {}: cert header={:?} chip={:?}",
        client.id(),
        String::from_utf8_lossy(&body[..4]),
        String::from_utf8_lossy(&body[140..172]),
    );

    request_handshake(client, AUTH2_CMD_CLIENT_PUBKEY, CLIENT2_PUBKEY_LEN)
}

fn handle_client_pubkey2(client: &GipClient, auth: &mut GipAuth, body: &[u8]) -> Result<()> {
    if body.len() < crypto::ECDH_PUBKEY_LEN {
        return Err(GipError::AuthProtocolError("client pubkey truncated".into()));
    }

    let mut pubkey = [0u8; crypto::ECDH_PUBKEY_LEN];
    pubkey.copy_from_slice(&body[..crypto::ECDH_PUBKEY_LEN]);
    auth.pubkey_client2 = Some(pubkey);

    client.queue_work(ClientWork::AuthEcdhExchange(client.id()));
    Ok(())
}

/// Deferred work: encrypt a fresh pre-master secret and send HostSecret
pub(crate) fn run_rsa_exchange(client: &Arc<GipClient>) {
    let mut auth = client.auth.lock().unwrap();
    if auth.failed {
        return;
    }

    let result = (|| -> Result<()> {
        let pubkey = auth.pubkey_client.clone().ok_or(GipError::AuthNoKey)?;

        // 48 random bytes, generated explicitly
        let mut pms = [0u8; AUTH_SECRET_LEN];
        crypto::random_bytes(&mut pms);

        let encrypted = crypto::encrypt_rsa(&pubkey, &pms)?;

        let seed = auth.randoms();
        let mut master = [0u8; AUTH_SECRET_LEN];
        crypto::prf(LABEL_MASTER_SECRET, &pms, &seed, &mut master);
        auth.master_secret = master;

        send_handshake(client, &mut auth, AUTH_CMD_HOST_SECRET, &encrypted)
    })();

    if let Err(err) = result {
        error!("client {}: RSA exchange failed: {}", client.id(), err);
        auth.failed = true;
    }
}

/// Deferred work: run the ECDH exchange and send our public key
pub(crate) fn run_ecdh_exchange(client: &Arc<GipClient>) {
    let mut auth = client.auth.lock().unwrap();
    if auth.failed {
        return;
    }

    let result = (|| -> Result<()> {
        let peer = auth.pubkey_client2.ok_or(GipError::AuthNoKey)?;
        let (own_pubkey, shared) = crypto::ecdh_exchange(&peer)?;

        let seed = auth.randoms();
        let mut master = [0u8; AUTH_SECRET_LEN];
        crypto::prf(LABEL_MASTER_SECRET, &shared, &seed, &mut master);
        auth.master_secret = master;

        send_handshake(client, &mut auth, AUTH2_CMD_HOST_PUBKEY, &own_pubkey)
    })();

    if let Err(err) = result {
        error!("client {}: ECDH exchange failed: {}", client.id(), err);
        auth.failed = true;
    }
}

/// Deferred work: derive the session key, report completion and install the
/// key on the transport
pub(crate) fn run_complete(client: &Arc<GipClient>) {
    let auth = client.auth.lock().unwrap();
    if auth.failed {
        return;
    }

    let seed = auth.randoms();
    let mut block = [0u8; 32];
    crypto::prf(LABEL_SESSION_KEY, &auth.master_secret, &seed, &mut block);

    // one PRF block, truncated explicitly
    let mut key = [0u8; AUTH_SESSION_KEY_LEN];
    key.copy_from_slice(&block[..AUTH_SESSION_KEY_LEN]);
    drop(auth);

    let control = [AUTH_CTX_CONTROL, AUTH_CTRL_COMPLETE];
    if let Err(err) = client.send_with_flags(GIP_CMD_AUTHENTICATE, GIP_OPT_INTERNAL, &control) {
        error!("client {}: completion send failed: {}", client.id(), err);
        return;
    }

    let adapter = match client.adapter() {
        Some(adapter) => adapter,
        None => return,
    };

    match adapter.ops.set_encryption_key(&key) {
        Ok(()) => debug!("client {}: session key installed", client.id()),
        Err(GipError::Unsupported) => debug!("client {}: transport has no encryption", client.id()),
        Err(err) => error!("client {}: set encryption key failed: {}", client.id(), err),
    }
}
