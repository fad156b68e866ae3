use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Errors from the secret codec.
#[derive(Debug, Clone, PartialEq)]
pub enum CipherError {
    InvalidKey,
    Encoding(String),
    TooShort,
    Encrypt,
    Decrypt,
    Utf8,
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherError::InvalidKey => write!(f, "invalid encryption key"),
            CipherError::Encoding(msg) => write!(f, "decode: {}", msg),
            CipherError::TooShort => write!(f, "ciphertext too short"),
            CipherError::Encrypt => write!(f, "encryption failed"),
            CipherError::Decrypt => write!(f, "open: authentication failed"),
            CipherError::Utf8 => write!(f, "decrypted value is not valid UTF-8"),
        }
    }
}

impl std::error::Error for CipherError {}

/// Symmetric encryption of stored database credentials.
pub trait EncryptionService: Send + Sync {
    fn encrypt(&self, plain: &str) -> Result<String, CipherError>;

    fn decrypt(&self, encrypted: &str) -> Result<String, CipherError>;
}

/// AES-256-GCM with a key derived from a passphrase via SHA-256.
///
/// Output is base64 of `nonce || ciphertext`, with a fresh random nonce per call.
#[derive(Clone)]
pub struct AesGcmEncryptionService {
    cipher: Aes256Gcm,
}

impl AesGcmEncryptionService {
    pub fn new(passphrase: &str) -> Result<Self, CipherError> {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        let key = hasher.finalize();
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CipherError::InvalidKey)?;
        Ok(Self { cipher })
    }
}

impl EncryptionService for AesGcmEncryptionService {
    fn encrypt(&self, plain: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    fn decrypt(&self, encrypted: &str) -> Result<String, CipherError> {
        let raw = STANDARD
            .decode(encrypted)
            .map_err(|e| CipherError::Encoding(e.to_string()))?;
        if raw.len() < NONCE_LEN {
            return Err(CipherError::TooShort);
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Decrypt)?;
        String::from_utf8(plain).map_err(|_| CipherError::Utf8)
    }
}
