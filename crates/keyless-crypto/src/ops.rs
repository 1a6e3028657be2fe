//! Operation dispatch: execute a decoded request against the keystore.
//!
//! Failure ordering is part of the wire contract: a missing required item
//! is FORMAT, an unresolvable KEY_ID is KEY_NOT_FOUND, an opcode aimed at
//! the wrong key type is BAD_OPCODE, and only then can execution itself
//! fail with CRYPTO_FAILED.

use ecdsa::signature::hazmat::PrehashSigner;
use keyless_protocol::{ErrorCode, Items, Opcode};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey};

use crate::keystore::{KeyStore, PrivateKey};

/// Execute the operation a request's items describe.
///
/// Returns the raw bytes for a RESPONSE frame, or the error code to put
/// on the wire. PING needs no key and echoes its payload (empty payload
/// echoes empty).
pub fn dispatch(store: &KeyStore, items: &Items) -> Result<Vec<u8>, ErrorCode> {
    let raw = items.opcode.ok_or(ErrorCode::Format)?;
    let opcode = Opcode::try_from(raw).map_err(|_| ErrorCode::BadOpcode)?;

    if opcode.is_response_only() {
        return Err(ErrorCode::UnexpectedOpcode);
    }
    if opcode == Opcode::Ping {
        return Ok(items.payload.clone().unwrap_or_default());
    }

    let key_id = items.key_id.as_deref().ok_or(ErrorCode::Format)?;
    let payload = items.payload.as_deref().ok_or(ErrorCode::Format)?;
    let key = store.lookup(key_id).ok_or(ErrorCode::KeyNotFound)?;

    if opcode.is_rsa_op() {
        let rsa = match key {
            PrivateKey::Rsa(rsa) => rsa,
            _ => return Err(ErrorCode::BadOpcode),
        };
        return match opcode {
            Opcode::RsaDecrypt => rsa
                .decrypt(Pkcs1v15Encrypt, payload)
                .map_err(|_| ErrorCode::CryptoFailed),
            Opcode::RsaDecryptRaw => rsa_decrypt_raw(rsa, payload),
            _ => rsa_sign(rsa, opcode, payload),
        };
    }

    if opcode.is_ecdsa_op() {
        return match key {
            PrivateKey::EcP256(ec) => ecdsa_sign_p256(ec, payload),
            PrivateKey::EcP384(ec) => ecdsa_sign_p384(ec, payload),
            PrivateKey::Rsa(_) => Err(ErrorCode::BadOpcode),
        };
    }

    Err(ErrorCode::BadOpcode)
}

/// PKCS#1 v1.5 signature over a precomputed digest, with the DigestInfo
/// prefix matching the opcode. MD5SHA1 signs the raw 36-byte
/// concatenation with no prefix (TLS 1.1-era semantics).
fn rsa_sign(key: &RsaPrivateKey, opcode: Opcode, digest: &[u8]) -> Result<Vec<u8>, ErrorCode> {
    let padding = match opcode {
        Opcode::RsaSignMd5Sha1 => Pkcs1v15Sign::new_unprefixed(),
        Opcode::RsaSignSha1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
        Opcode::RsaSignSha224 => Pkcs1v15Sign::new::<sha2::Sha224>(),
        Opcode::RsaSignSha256 => Pkcs1v15Sign::new::<sha2::Sha256>(),
        Opcode::RsaSignSha384 => Pkcs1v15Sign::new::<sha2::Sha384>(),
        Opcode::RsaSignSha512 => Pkcs1v15Sign::new::<sha2::Sha512>(),
        _ => return Err(ErrorCode::BadOpcode),
    };
    key.sign(padding, digest).map_err(|_| ErrorCode::CryptoFailed)
}

/// Raw modular exponentiation, no unpadding. The result is left-padded
/// to the modulus width so callers always get `key.size()` bytes.
fn rsa_decrypt_raw(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, ErrorCode> {
    let c = rsa::BigUint::from_bytes_be(ciphertext);
    if c >= *key.n() {
        return Err(ErrorCode::CryptoFailed);
    }
    let m = rsa::hazmat::rsa_decrypt_and_check::<rand::rngs::ThreadRng>(key, None, &c)
        .map_err(|_| ErrorCode::CryptoFailed)?;

    let bytes = m.to_bytes_be();
    let width = key.size();
    let mut out = vec![0u8; width - bytes.len()];
    out.extend_from_slice(&bytes);
    Ok(out)
}

fn ecdsa_sign_p256(key: &p256::ecdsa::SigningKey, digest: &[u8]) -> Result<Vec<u8>, ErrorCode> {
    let signature: p256::ecdsa::Signature =
        key.sign_prehash(digest).map_err(|_| ErrorCode::CryptoFailed)?;
    Ok(signature.to_der().as_bytes().to_vec())
}

fn ecdsa_sign_p384(key: &p384::ecdsa::SigningKey, digest: &[u8]) -> Result<Vec<u8>, ErrorCode> {
    let signature: p384::ecdsa::Signature =
        key.sign_prehash(digest).map_err(|_| ErrorCode::CryptoFailed)?;
    Ok(signature.to_der().as_bytes().to_vec())
}
