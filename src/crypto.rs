//! Streaming decryptor (C2).
//!
//! Source objects are encrypted with AES-256-GCM using the STREAM
//! construction (`aes_gcm::aead::stream`): a 7-byte nonce prefix followed
//! by fixed-size chunks, each independently authenticated with its own
//! 16-byte tag. This lets `decrypt` consume the input incrementally and
//! forward plaintext to a `ByteSink` without ever holding the whole
//! payload in memory, per the streaming-pipeline design note in §9.

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::KeyInit;
use aes_gcm::aead::stream::{Decryptor, DecryptorBE32};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::errors::{CryptoError, Error};
use crate::objectstore::{ByteSink, ByteSource};

const NONCE_PREFIX_LEN: usize = 7;
const TAG_LEN: usize = 16;
const PLAINTEXT_CHUNK_LEN: usize = 64 * 1024;
const CIPHERTEXT_CHUNK_LEN: usize = PLAINTEXT_CHUNK_LEN + TAG_LEN;

/// Resolves the `(password, salt)` pair used to decrypt one source key.
/// Secret provisioning itself lives outside this crate (§1 scope); this
/// trait is the seam acquisition calls through.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials_for(&self, source_key: &str) -> Result<(String, String), Error>;
}

/// A `CredentialsProvider` that hands back the same password for every
/// source key alongside a fixed salt. The real secret-provisioning system
/// (per-key passwords from whatever vault the rest of the platform uses)
/// is out of scope (§1); this stands in for it so the CLI has something
/// concrete to run against, and is the only place that assumption lives
/// (see DESIGN.md).
pub struct StaticCredentialsProvider {
    password: String,
    salt: String,
}

impl StaticCredentialsProvider {
    pub fn new(password: impl Into<String>, salt: impl Into<String>) -> Self {
        StaticCredentialsProvider { password: password.into(), salt: salt.into() }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn credentials_for(&self, _source_key: &str) -> Result<(String, String), Error> {
        Ok((self.password.clone(), self.salt.clone()))
    }
}

/// Derive a 32-byte AES-256 key from a password and salt. `spec.md` does
/// not name a KDF; we use a single SHA-256 pass over `password || salt`,
/// which is sufficient given the salt is provisioned out-of-band per
/// source key and never reused across datasets (see DESIGN.md).
fn derive_key(password: &str, salt: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    hasher.finalize().into()
}

/// Decrypt at most `encrypted_length` bytes from `input`, writing
/// plaintext chunks to `output`. Never buffers more than one ciphertext
/// chunk at a time.
pub async fn decrypt(
    input: &mut dyn ByteSource,
    output: &mut dyn ByteSink,
    password: &str,
    salt: &str,
    encrypted_length: u64,
) -> Result<(), Error> {
    if password.is_empty() || salt.is_empty() {
        return Err(CryptoError::InvalidKeyMaterial.into());
    }
    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new(&key.into());

    let mut remaining = encrypted_length;
    let mut carry: Vec<u8> = Vec::new();

    let nonce_prefix = read_exact_from_stream(input, &mut carry, NONCE_PREFIX_LEN, &mut remaining).await?;
    let mut decryptor: DecryptorBE32<Aes256Gcm> = DecryptorBE32::from_aead(cipher, nonce_prefix.as_slice().into());

    loop {
        let want = if remaining == 0 { 0 } else { CIPHERTEXT_CHUNK_LEN.min(remaining as usize) };
        if want == 0 {
            break;
        }
        let is_last = remaining as usize <= CIPHERTEXT_CHUNK_LEN;
        let chunk = read_exact_from_stream(input, &mut carry, want, &mut remaining).await?;

        let plaintext = if is_last {
            decryptor
                .decrypt_last(chunk.as_slice())
                .map_err(|_| CryptoError::TagMismatch)?
        }
        else {
            decryptor
                .decrypt_next(chunk.as_slice())
                .map_err(|_| CryptoError::TagMismatch)?
        };

        output.write(&plaintext).await?;

        if is_last {
            break;
        }
    }

    output.flush().await?;
    Ok(())
}

/// Pull exactly `want` bytes out of `input` (buffering short reads in
/// `carry`), decrementing `remaining` by however much of the encrypted
/// length budget was consumed. Returns `CryptoError::Truncated` if the
/// source runs dry before `want` bytes are available.
async fn read_exact_from_stream(
    input: &mut dyn ByteSource,
    carry: &mut Vec<u8>,
    want: usize,
    remaining: &mut u64,
) -> Result<Vec<u8>, Error> {
    while carry.len() < want {
        match input.read_chunk().await? {
            Some(bytes) => carry.extend_from_slice(&bytes),
            None => {
                return Err(CryptoError::Truncated { expected: want as u64, actual: carry.len() as u64 }.into());
            }
        }
    }
    let rest = carry.split_off(want);
    let taken = std::mem::replace(carry, rest);
    *remaining = remaining.saturating_sub(taken.len() as u64);
    Ok(taken)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;

    struct VecSource {
        chunks: std::collections::VecDeque<Bytes>,
    }

    #[async_trait]
    impl ByteSource for VecSource {
        async fn read_chunk(&mut self) -> Result<Option<Bytes>, Error> {
            Ok(self.chunks.pop_front())
        }
    }

    struct VecSink {
        data: Vec<u8>,
    }

    #[async_trait]
    impl ByteSink for VecSink {
        async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
            self.data.extend_from_slice(chunk);
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), Error> {
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<(), Error> {
            Ok(())
        }
    }

    fn encrypt_all(plaintext: &[u8], password: &str, salt: &str) -> Vec<u8> {
        use aes_gcm::aead::stream::{Encryptor, EncryptorBE32};

        let key = derive_key(password, salt);
        let cipher = Aes256Gcm::new(&key.into());
        let nonce_prefix = [7u8; NONCE_PREFIX_LEN];
        let mut encryptor: EncryptorBE32<Aes256Gcm> = EncryptorBE32::from_aead(cipher, nonce_prefix.as_slice().into());

        let mut out = nonce_prefix.to_vec();
        let mut chunks: Vec<&[u8]> = plaintext.chunks(PLAINTEXT_CHUNK_LEN).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let last_index = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            if i == last_index {
                out.extend(encryptor.encrypt_last(chunk).unwrap());
            }
            else {
                out.extend(encryptor.encrypt_next(chunk).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn round_trips_small_payload() {
        let plaintext = b"REGION,FARM_ID,NAME,CHANGE_TYPE\nNORTH,F001,Alpha,I\n".to_vec();
        let ciphertext = encrypt_all(&plaintext, "pw", "salt");

        let mut source = VecSource { chunks: vec![Bytes::from(ciphertext.clone())].into() };
        let mut sink = VecSink { data: Vec::new() };

        decrypt(&mut source, &mut sink, "pw", "salt", ciphertext.len() as u64).await.unwrap();
        assert_eq!(sink.data, plaintext);
    }

    #[tokio::test]
    async fn rejects_empty_password_or_salt() {
        let mut source = VecSource { chunks: std::collections::VecDeque::new() };
        let mut sink = VecSink { data: Vec::new() };

        let result = decrypt(&mut source, &mut sink, "", "salt", 0).await;
        assert!(matches!(result, Err(Error::Crypto(CryptoError::InvalidKeyMaterial))));

        let result = decrypt(&mut source, &mut sink, "pw", "", 0).await;
        assert!(matches!(result, Err(Error::Crypto(CryptoError::InvalidKeyMaterial))));
    }

    #[tokio::test]
    async fn rejects_wrong_password() {
        let plaintext = b"hello world".to_vec();
        let ciphertext = encrypt_all(&plaintext, "pw", "salt");

        let mut source = VecSource { chunks: vec![Bytes::from(ciphertext.clone())].into() };
        let mut sink = VecSink { data: Vec::new() };

        let result = decrypt(&mut source, &mut sink, "wrong", "salt", ciphertext.len() as u64).await;
        assert!(matches!(result, Err(Error::Crypto(CryptoError::TagMismatch))));
    }

    #[tokio::test]
    async fn rejects_truncated_stream() {
        let plaintext = b"hello world".to_vec();
        let ciphertext = encrypt_all(&plaintext, "pw", "salt");
        let truncated = &ciphertext[..ciphertext.len() - 4];

        let mut source = VecSource { chunks: vec![Bytes::from(truncated.to_vec())].into() };
        let mut sink = VecSink { data: Vec::new() };

        let result = decrypt(&mut source, &mut sink, "pw", "salt", ciphertext.len() as u64).await;
        assert!(matches!(result, Err(Error::Crypto(CryptoError::Truncated { .. }))));
    }
}
