//! Handshake primitives: PRF, transcript hashing, RSA and ECDH
//!
//! The handshake derives its keys with the TLS 1.2 P_SHA256 construction and
//! hashes every handshake packet's data region into a running transcript.
//! Reading the transcript digest must not disturb the running state, so the
//! hasher is cloned before finalization.

use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::generic_array::GenericArray;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::{GipError, Result};

/// SHA-256 digest length
pub const DIGEST_LEN: usize = 32;

/// Uncompressed P-256 point without the SEC1 tag byte
pub const ECDH_PUBKEY_LEN: usize = 64;

type HmacSha256 = Hmac<Sha256>;

fn hmac_digest(key: &[u8], parts: &[&[u8]]) -> [u8; DIGEST_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// TLS 1.2 style P_SHA256 pseudo random function.
///
/// `A(1) = HMAC(key, label || seed)`, each output block is
/// `HMAC(key, A(i) || label || seed)` and `A(i+1) = HMAC(key, A(i))`; blocks
/// are concatenated until `out` is filled.
pub fn prf(label: &str, key: &[u8], seed: &[u8], out: &mut [u8]) {
    let mut a = hmac_digest(key, &[label.as_bytes(), seed]);
    let mut off = 0;

    while off < out.len() {
        let block = hmac_digest(key, &[&a, label.as_bytes(), seed]);
        let n = (out.len() - off).min(DIGEST_LEN);
        out[off..off + n].copy_from_slice(&block[..n]);
        off += n;

        a = hmac_digest(key, &[&a]);
    }
}

/// Digest of the running transcript, preserving its state
pub fn transcript_digest(transcript: &Sha256) -> [u8; DIGEST_LEN] {
    transcript.clone().finalize().into()
}

/// Fill a buffer with cryptographically secure random bytes
pub fn random_bytes(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

/// PKCS#1 v1.5 encrypt `plaintext` to a DER encoded RSAPublicKey
pub fn encrypt_rsa(pubkey_der: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = RsaPublicKey::from_pkcs1_der(pubkey_der)
        .map_err(|err| GipError::AuthProtocolError(format!("bad RSA public key: {err}")))?;

    key.encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
        .map_err(|err| GipError::AuthProtocolError(format!("RSA encrypt failed: {err}")))
}

/// Run one ECDH exchange against a peer's raw P-256 point.
///
/// Returns our own public point as raw coordinates and the SHA-256 of the
/// shared X coordinate.
pub fn ecdh_exchange(peer: &[u8; ECDH_PUBKEY_LEN]) -> Result<([u8; ECDH_PUBKEY_LEN], [u8; DIGEST_LEN])> {
    let point = EncodedPoint::from_untagged_bytes(GenericArray::from_slice(peer));
    let peer_key: PublicKey = Option::from(PublicKey::from_encoded_point(&point))
        .ok_or_else(|| GipError::AuthProtocolError("peer point not on curve".into()))?;

    let secret = EphemeralSecret::random(&mut OsRng);
    let shared = secret.diffie_hellman(&peer_key);

    let own = secret.public_key().to_encoded_point(false);
    let mut pubkey = [0u8; ECDH_PUBKEY_LEN];
    // skip the SEC1 uncompressed tag byte
    pubkey.copy_from_slice(&own.as_bytes()[1..1 + ECDH_PUBKEY_LEN]);

    let digest: [u8; DIGEST_LEN] = Sha256::digest(shared.raw_secret_bytes().as_slice()).into();

    Ok((pubkey, digest))
}
