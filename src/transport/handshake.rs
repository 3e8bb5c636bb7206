//! Session key negotiation for the SK103 link.

use tracing::{debug, error};

use super::envelope::HEADER_LEN;
use crate::crypto::{aes256_cbc_decrypt, sha256};
use crate::error::{Error, Result};

pub const KEY_LEN: usize = 32;
pub const TOKEN_LEN: usize = 64;
const RESPONSE_LEN: usize = 64;
// envelope header plus the response counter
const PREAMBLE_LEN: usize = HEADER_LEN + 2;

/// Derives the session key from a raw handshake response envelope.
///
/// The response carries 32 encrypted bytes and their SHA-256. The session
/// key is the decrypted payload XORed with the static device key.
pub fn derive_session_key(static_key: &[u8; KEY_LEN], response: &[u8]) -> Result<[u8; KEY_LEN]> {
    let body = response.get(PREAMBLE_LEN..).unwrap_or_default();

    if body == b"ERROR" {
        return Err(Error::Authentication("appliance rejected the handshake".into()));
    }
    if body.len() != RESPONSE_LEN {
        error!("derive_session_key: unexpected response length ({})", body.len());
        return Err(Error::Authentication(format!("unexpected handshake response length {}", body.len())));
    }

    let (encrypted, signature) = body.split_at(KEY_LEN);
    let decrypted = aes256_cbc_decrypt(static_key, encrypted)?;
    if sha256(&[&decrypted[..]]) != signature {
        error!("derive_session_key: message signature does not validate");
        return Err(Error::Integrity("handshake signature mismatch".into()));
    }

    let mut session = [0u8; KEY_LEN];
    for (i, byte) in session.iter_mut().enumerate() {
        *byte = decrypted[i] ^ static_key[i];
    }
    debug!("derive_session_key: negotiated a session key");
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::envelope::tests::SESSION_KEY;

    const STATIC_KEY: &str = "101112131415161718191a1b1c1d1e1f202122232425262728292a2b2c2d2e2f";
    const RESPONSE: &str = "8370004020010000dff2bc2c251b8700c986a8e12d0550b84c34c40573746ac0f742d3937598653e988ac578a0d53d52e76963837a2b324be7250db021b6e271ff0e56a413768abd";

    fn static_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&hex::decode(STATIC_KEY).unwrap());
        key
    }

    #[test]
    fn derive_test() {
        let response = hex::decode(RESPONSE).unwrap();
        let session = derive_session_key(&static_key(), &response).unwrap();
        assert_eq!(SESSION_KEY, hex::encode(session));
    }

    #[test]
    fn tampered_signature_test() {
        let mut response = hex::decode(RESPONSE).unwrap();
        let last = response.len() - 1;
        response[last] ^= 0x80;
        let err = derive_session_key(&static_key(), &response).unwrap_err();
        assert_eq!(crate::ErrorKind::Integrity, err.kind());
    }

    #[test]
    fn short_and_error_responses_test() {
        let response = hex::decode(RESPONSE).unwrap();
        let err = derive_session_key(&static_key(), &response[..40]).unwrap_err();
        assert_eq!(crate::ErrorKind::Authentication, err.kind());

        let mut error_reply = response[..PREAMBLE_LEN].to_vec();
        error_reply.extend_from_slice(b"ERROR");
        let err = derive_session_key(&static_key(), &error_reply).unwrap_err();
        assert_eq!(crate::ErrorKind::Authentication, err.kind());

        assert!(derive_session_key(&static_key(), &[]).is_err());
    }
}
