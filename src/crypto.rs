use core::fmt;

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// A minimal secret container that zeroizes its contents on drop.
///
/// This is intentionally small and avoids exposing secrets via `Debug`.
#[derive(Clone)]
pub(crate) struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn to_user_key(&self) -> [u8; 20] {
        normalize_user_key(self.expose())
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<secret>")
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

pub(crate) type HmacSha1 = Hmac<Sha1>;
pub(crate) type HmacSha256 = Hmac<Sha256>;

/// Hash underlying the RAKP authentication and session integrity algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HashKind {
    Sha1,
    Sha256,
}

impl HashKind {
    /// Full digest length in bytes.
    pub(crate) fn digest_len(self) -> usize {
        match self {
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
        }
    }

    /// Truncated integrity trailer length (HMAC-SHA1-96 / HMAC-SHA256-128).
    pub(crate) fn auth_code_len(self) -> usize {
        match self {
            HashKind::Sha1 => 12,
            HashKind::Sha256 => 16,
        }
    }
}

/// Normalize a secret (password/Kg) into the fixed 20-byte RAKP user key.
///
/// IPMI implementations commonly treat the user key as a fixed-size array where
/// the provided secret is truncated and the remainder is zero-padded.
pub(crate) fn normalize_user_key(secret: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    let n = secret.len().min(out.len());
    out[..n].copy_from_slice(&secret[..n]);
    out
}

pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

pub(crate) fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<[u8; 20]> {
    let mut mac =
        <HmacSha1 as Mac>::new_from_slice(key).map_err(|_| Error::Crypto("invalid HMAC key"))?;
    mac.update(data);
    let bytes = mac.finalize().into_bytes();
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes[..]);
    Ok(out)
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| Error::Crypto("invalid HMAC key"))?;
    mac.update(data);
    let bytes = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes[..]);
    Ok(out)
}

/// HMAC with the negotiated hash, full digest length.
pub(crate) fn hmac_hash(kind: HashKind, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match kind {
        HashKind::Sha1 => Ok(hmac_sha1(key, data)?.to_vec()),
        HashKind::Sha256 => Ok(hmac_sha256(key, data)?.to_vec()),
    }
}

/// HMAC truncated to the integrity trailer length for `kind`.
pub(crate) fn hmac_truncated(kind: HashKind, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut full = hmac_hash(kind, key, data)?;
    full.truncate(kind.auth_code_len());
    Ok(full)
}

/// Derive the additional keying material K1 and K2 from the SIK.
///
/// The derivation constants are hash-length runs of 0x01 and 0x02; for SHA-1
/// that is 20 bytes of each.
pub(crate) fn derive_k1_k2(kind: HashKind, sik: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let const1 = vec![0x01u8; sik.len()];
    let const2 = vec![0x02u8; sik.len()];

    let k1 = hmac_hash(kind, sik, &const1)?;
    let k2 = hmac_hash(kind, sik, &const2)?;
    Ok((k1, k2))
}

pub(crate) fn derive_aes_key_from_k2(k2: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&k2[..16]);
    out
}

/// AES-128-CBC encryption without padding.
///
/// The caller must ensure `plaintext.len()` is a multiple of 16.
pub(crate) fn aes128_cbc_encrypt(
    key: &[u8; 16],
    iv: &[u8; 16],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    if !plaintext.len().is_multiple_of(16) {
        return Err(Error::Crypto(
            "AES-CBC plaintext length must be a multiple of 16",
        ));
    }

    let cipher = Aes128::new_from_slice(key).map_err(|_| Error::Crypto("invalid AES-128 key"))?;

    let mut out = Vec::with_capacity(plaintext.len());
    let mut prev = *iv;

    for block in plaintext.chunks(16) {
        let mut xored = [0u8; 16];
        for i in 0..16 {
            xored[i] = block[i] ^ prev[i];
        }

        let mut ga = GenericArray::clone_from_slice(&xored);
        cipher.encrypt_block(&mut ga);

        let mut ct = [0u8; 16];
        ct.copy_from_slice(&ga);
        out.extend_from_slice(&ct);
        prev = ct;
    }

    Ok(out)
}

/// AES-128-CBC decryption without padding.
///
/// The caller must ensure `ciphertext.len()` is a multiple of 16.
pub(crate) fn aes128_cbc_decrypt(
    key: &[u8; 16],
    iv: &[u8; 16],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if !ciphertext.len().is_multiple_of(16) {
        return Err(Error::Crypto(
            "AES-CBC ciphertext length must be a multiple of 16",
        ));
    }

    let cipher = Aes128::new_from_slice(key).map_err(|_| Error::Crypto("invalid AES-128 key"))?;

    let mut out = Vec::with_capacity(ciphertext.len());
    let mut prev = *iv;

    for block in ciphertext.chunks(16) {
        let mut ga = GenericArray::clone_from_slice(block);
        cipher.decrypt_block(&mut ga);

        let mut pt = [0u8; 16];
        pt.copy_from_slice(&ga);
        for i in 0..16 {
            pt[i] ^= prev[i];
        }

        out.extend_from_slice(&pt);

        let mut next_prev = [0u8; 16];
        next_prev.copy_from_slice(block);
        prev = next_prev;
    }

    Ok(out)
}
