//! Usage: Request ids and API key fingerprints for logs.

use rand::Rng;
use sha2::{Digest, Sha256};

const REQUEST_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
pub(crate) const REQUEST_ID_LEN: usize = 29;

pub(crate) fn new_request_id() -> String {
    let mut rng = rand::thread_rng();
    (0..REQUEST_ID_LEN)
        .map(|_| REQUEST_ID_ALPHABET[rng.gen_range(0..REQUEST_ID_ALPHABET.len())] as char)
        .collect()
}

/// Short, non-reversible tag for an API key; safe to log.
pub(crate) fn key_fingerprint(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    hex::encode(&digest[..6])
}
