//! Block cipher and digest helpers shared by the transports.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const BLOCK_LEN: usize = 16;

pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn check_aligned(data: &[u8]) -> Result<()> {
    if data.is_empty() || data.len() % BLOCK_LEN != 0 {
        return Err(Error::Integrity(format!("ciphertext of {} bytes is not block aligned", data.len())));
    }
    Ok(())
}

/// AES-256-CBC with an all-zero IV and no padding.
pub fn aes256_cbc_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    check_aligned(plaintext)?;
    let cipher = Aes256::new(key.into());
    let mut output = plaintext.to_vec();
    let mut previous = [0u8; BLOCK_LEN];

    for chunk in output.chunks_mut(BLOCK_LEN) {
        chunk.iter_mut().zip(previous.iter()).for_each(|(b, p)| *b ^= p);
        cipher.encrypt_block(chunk.into());
        previous.copy_from_slice(chunk);
    }

    Ok(output)
}

pub fn aes256_cbc_decrypt(key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>> {
    check_aligned(ciphertext)?;
    let cipher = Aes256::new(key.into());
    let mut output = ciphertext.to_vec();
    let mut previous = [0u8; BLOCK_LEN];

    for chunk in output.chunks_mut(BLOCK_LEN) {
        let mut current = [0u8; BLOCK_LEN];
        current.copy_from_slice(chunk);
        cipher.decrypt_block(chunk.into());
        chunk.iter_mut().zip(previous.iter()).for_each(|(b, p)| *b ^= p);
        previous = current;
    }

    Ok(output)
}

/// AES-128-ECB. Only a trailing partial block is padded, PKCS7 style, so
/// block-aligned input gains no extra block.
pub fn aes128_ecb_encrypt(key: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    let mut output = plaintext.to_vec();
    let remainder = output.len() % BLOCK_LEN;
    if remainder != 0 {
        let pad = BLOCK_LEN - remainder;
        output.resize(output.len() + pad, pad as u8);
    }

    let cipher = Aes128::new(key.into());
    for chunk in output.chunks_mut(BLOCK_LEN) {
        cipher.encrypt_block(chunk.into());
    }
    output
}

/// AES-128-ECB with full PKCS7 padding: aligned input gains a whole block.
pub fn aes128_ecb_encrypt_pkcs7(key: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    let pad = BLOCK_LEN - plaintext.len() % BLOCK_LEN;
    let mut padded = Vec::with_capacity(plaintext.len() + pad);
    padded.extend_from_slice(plaintext);
    padded.resize(plaintext.len() + pad, pad as u8);
    aes128_ecb_encrypt(key, &padded)
}

/// Decrypts without touching any padding.
pub fn aes128_ecb_decrypt(key: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>> {
    check_aligned(ciphertext)?;
    let cipher = Aes128::new(key.into());
    let mut output = ciphertext.to_vec();
    for chunk in output.chunks_mut(BLOCK_LEN) {
        cipher.decrypt_block(chunk.into());
    }
    Ok(output)
}

pub fn aes128_ecb_decrypt_pkcs7(key: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let mut output = aes128_ecb_decrypt(key, ciphertext)?;
    let pad = output.last().copied().unwrap_or(0) as usize;
    if pad == 0 || pad > BLOCK_LEN || !output[output.len() - pad..].iter().all(|b| *b as usize == pad) {
        return Err(Error::Integrity("invalid PKCS7 padding".into()));
    }
    output.truncate(output.len() - pad);
    Ok(output)
}

/// Removes PKCS7-style padding if the tail looks like it, leaving unpadded
/// data alone.
pub fn strip_padding(data: &mut Vec<u8>) {
    let Some(&last) = data.last() else { return };
    let pad = last as usize;
    if (1..=BLOCK_LEN).contains(&pad) && data.len() >= pad && data[data.len() - pad..].iter().all(|b| *b == last) {
        data.truncate(data.len() - pad);
    }
}
