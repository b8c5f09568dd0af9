/// Confidentiality and integrity envelope for inter-node messages.
///
/// Every payload exchanged between peers is wrapped in an authenticated
/// encryption envelope derived from a pre-shared master key. Nodes holding a
/// different key fail verification on every message and silently fail to
/// converge, which is the cluster's isolation property.
///
/// # Wire format
///
/// ```json
/// { "encrypted": true,
///   "algorithm": "aes-256-gcm",
///   "salt": "<base64>", "iv": "<base64>",
///   "authTag": "<base64>", "ciphertext": "<base64>",
///   "isBuffer": false }
/// ```
///
/// or `{ "encrypted": false, "data": <payload> }` when encryption is
/// disabled. All binary fields are base64-encoded.
///
/// # Key derivation
///
/// A fresh random 128-bit salt is drawn per message and stretched with
/// PBKDF2-HMAC-SHA256 (configurable iteration count, default 10 000) into a
/// 256-bit AES-GCM key. The 96-bit nonce is random per message and the
/// 128-bit GCM tag is carried separately in `authTag`.
use crate::config::SecurityConfig;
use crate::error::{MeshError, MeshResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The only cipher suite currently supported.
pub const AES_256_GCM: &str = "aes-256-gcm";

/// Salt length in bytes (128 bits, fresh per message).
const SALT_LEN: usize = 16;

/// Nonce length in bytes (96 bits, the AES-GCM standard).
const NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes (128 bits).
const TAG_LEN: usize = 16;

/// A payload on its way into (or out of) an envelope.
///
/// Structured objects are JSON-serialized, strings travel as UTF-8, and raw
/// byte buffers are flagged with `isBuffer` so the receiver can hand them
/// back without a decode guess.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Arbitrary structured data.
    Json(JsonValue),
    /// A plain UTF-8 string.
    Text(String),
    /// A raw byte buffer.
    Bytes(Vec<u8>),
}

impl Payload {
    /// Interpret this payload as structured JSON.
    ///
    /// Text and buffer payloads are not valid protocol events.
    pub fn into_json(self) -> MeshResult<JsonValue> {
        match self {
            Payload::Json(value) => Ok(value),
            Payload::Text(_) => Err(MeshError::Protocol(
                "expected structured payload, got text".to_string(),
            )),
            Payload::Bytes(_) => Err(MeshError::Protocol(
                "expected structured payload, got buffer".to_string(),
            )),
        }
    }
}

/// An encrypted envelope as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedEnvelope {
    /// Always `true` for sealed envelopes.
    pub encrypted: bool,
    /// Cipher suite identifier (currently always `aes-256-gcm`).
    pub algorithm: String,
    /// Per-message KDF salt, base64.
    pub salt: String,
    /// AES-GCM nonce, base64.
    pub iv: String,
    /// GCM authentication tag, base64.
    pub auth_tag: String,
    /// Ciphertext, base64.
    pub ciphertext: String,
    /// Hint that the plaintext is a raw byte buffer.
    #[serde(default)]
    pub is_buffer: bool,
}

/// A plaintext envelope, used when encryption is disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlainEnvelope {
    /// Always `false` for plain envelopes.
    pub encrypted: bool,
    /// The payload, unchanged.
    pub data: JsonValue,
}

/// The envelope wrapping every inter-node message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CipherEnvelope {
    /// Authenticated ciphertext.
    Sealed(SealedEnvelope),
    /// Passthrough payload (encryption disabled).
    Plain(PlainEnvelope),
}

impl CipherEnvelope {
    /// Wrap a payload without encryption.
    pub fn plain(data: JsonValue) -> Self {
        CipherEnvelope::Plain(PlainEnvelope {
            encrypted: false,
            data,
        })
    }

    /// True if this envelope carries ciphertext.
    pub fn is_sealed(&self) -> bool {
        matches!(self, CipherEnvelope::Sealed(_))
    }
}

/// Symmetric authenticated encryption of peer messages.
///
/// One instance is shared by a node for its lifetime; all state is the
/// configuration, so encrypt/decrypt/mac are `&self` and thread-safe.
pub struct SecurityEnvelope {
    master_key: String,
    algorithm: String,
    kdf_iterations: u32,
    key_length: usize,
}

impl SecurityEnvelope {
    /// Build an envelope from validated security configuration.
    pub fn new(config: &SecurityConfig) -> MeshResult<Self> {
        let master_key = config
            .master_key
            .clone()
            .ok_or_else(|| MeshError::config("security.master_key is required"))?;
        Ok(Self {
            master_key,
            algorithm: config.algorithm.clone(),
            kdf_iterations: config.kdf_iterations,
            key_length: config.key_length,
        })
    }

    /// Encrypt a payload into a self-describing envelope.
    pub fn encrypt(&self, payload: &Payload) -> MeshResult<CipherEnvelope> {
        let (plaintext, is_buffer) = match payload {
            Payload::Json(value) => (serde_json::to_vec(value)?, false),
            Payload::Text(text) => (text.as_bytes().to_vec(), false),
            Payload::Bytes(bytes) => (bytes.clone(), true),
        };

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| MeshError::Decrypt(format!("invalid derived key: {}", e)))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        // The aead crate returns ciphertext || tag; the tag travels in its
        // own envelope field.
        let mut sealed = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| MeshError::Decrypt(format!("encryption failed: {}", e)))?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(CipherEnvelope::Sealed(SealedEnvelope {
            encrypted: true,
            algorithm: self.algorithm.clone(),
            salt: BASE64.encode(salt),
            iv: BASE64.encode(nonce_bytes),
            auth_tag: BASE64.encode(tag),
            ciphertext: BASE64.encode(sealed),
            is_buffer,
        }))
    }

    /// Decrypt and verify an envelope.
    ///
    /// A `Plain` envelope passes its payload through unchanged. Any
    /// verification failure (wrong key, tampered ciphertext, tag, salt, or
    /// iv, or missing fields) yields `MeshError::Decrypt`.
    pub fn decrypt(&self, envelope: &CipherEnvelope) -> MeshResult<Payload> {
        let sealed = match envelope {
            CipherEnvelope::Plain(plain) => return Ok(Payload::Json(plain.data.clone())),
            CipherEnvelope::Sealed(sealed) => sealed,
        };

        if sealed.algorithm != self.algorithm {
            return Err(MeshError::Decrypt(format!(
                "unsupported algorithm '{}'",
                sealed.algorithm
            )));
        }

        let salt = decode_field(&sealed.salt, "salt")?;
        let nonce_bytes = decode_field(&sealed.iv, "iv")?;
        let tag = decode_field(&sealed.auth_tag, "authTag")?;
        let mut combined = decode_field(&sealed.ciphertext, "ciphertext")?;
        if nonce_bytes.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(MeshError::Decrypt("malformed envelope fields".to_string()));
        }
        combined.extend_from_slice(&tag);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| MeshError::Decrypt(format!("invalid derived key: {}", e)))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, combined.as_slice())
            .map_err(|_| MeshError::Decrypt("authentication failed".to_string()))?;

        if sealed.is_buffer {
            return Ok(Payload::Bytes(plaintext));
        }
        // Structured payloads were JSON-serialized; anything that does not
        // parse is handed back as the original string.
        match serde_json::from_slice::<JsonValue>(&plaintext) {
            Ok(value) => Ok(Payload::Json(value)),
            Err(_) => String::from_utf8(plaintext)
                .map(Payload::Text)
                .map_err(|_| MeshError::Decrypt("plaintext is not UTF-8".to_string())),
        }
    }

    /// Compute an HMAC-SHA256 tag over the canonical JSON form of `data`.
    pub fn mac(&self, data: &JsonValue) -> String {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.master_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(canonical_json(data).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify an HMAC tag in constant time.
    pub fn verify_mac(&self, data: &JsonValue, tag: &str) -> bool {
        let Ok(tag_bytes) = hex::decode(tag) else {
            return false;
        };
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.master_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(canonical_json(data).as_bytes());
        mac.verify_slice(&tag_bytes).is_ok()
    }

    /// Generate 128 random bits, hex-encoded. Used for message ids,
    /// handshake challenges, and sync ids.
    pub fn generate_secure_id() -> String {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    fn derive_key(&self, salt: &[u8]) -> Vec<u8> {
        let mut key = vec![0u8; self.key_length];
        pbkdf2_hmac::<Sha256>(
            self.master_key.as_bytes(),
            salt,
            self.kdf_iterations,
            &mut key,
        );
        key
    }
}

fn decode_field(value: &str, name: &str) -> MeshResult<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|_| MeshError::Decrypt(format!("invalid base64 in '{}'", name)))
}

/// Render JSON with object keys sorted recursively.
///
/// Both ends of a MAC exchange must hash the same bytes, so map ordering
/// cannot be left to the serializer.
fn canonical_json(value: &JsonValue) -> String {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string serializes"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        JsonValue::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => other.to_string(),
    }
}
