//! # ejson Documents
//!
//! Encrypts secret values of a JSON document in the `ejson` format, which the
//! gomplate `ejson` data source in the manifests decrypts in-cluster.
//!
//! The document names its recipient in `_public_key` (hex). Every string value
//! whose key does not start with `_` is replaced by
//! `EJ[1:<ephemeral public key>:<nonce>:<box>]`, each part base64 encoded.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crypto_box::aead::{Aead, AeadCore};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::rngs::OsRng;
use serde_json::{Map, Value};

const PUBLIC_KEY_FIELD: &str = "_public_key";
const BOX_PREFIX: &str = "EJ[1:";
const NONCE_SIZE: usize = 24;

/// Hex encoded Curve25519 key pair, as `ejson keygen` prints it
#[derive(Clone, PartialEq, Eq)]
pub struct Keypair {
    pub public: String,
    pub private: String,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

pub fn generate_keypair() -> Keypair {
    let secret = SecretKey::generate(&mut OsRng);
    Keypair {
        public: hex::encode(secret.public_key().as_bytes()),
        private: hex::encode(secret.to_bytes()),
    }
}

/// Encrypt every secret value of `document` for its `_public_key`
///
/// Values that are already encrypted are left as they are.
pub fn encrypt_document(document: &str) -> Result<String> {
    let mut doc: Value = serde_json::from_str(document).context("Document is not valid JSON")?;
    let Value::Object(fields) = &mut doc else {
        anyhow::bail!("Document is not a JSON object");
    };
    let recipient = fields
        .get(PUBLIC_KEY_FIELD)
        .and_then(Value::as_str)
        .with_context(|| format!("Document has no {PUBLIC_KEY_FIELD}"))?;
    let sealer = Sealer::new(&PublicKey::from(decode_key(recipient)?));

    seal_object(fields, &sealer)?;
    serde_json::to_string_pretty(&doc).context("Failed to serialize encrypted document")
}

/// Decrypt every encrypted value of `document` with a hex private key
pub fn decrypt_document(document: &str, private_key: &str) -> Result<String> {
    let mut doc: Value = serde_json::from_str(document).context("Document is not valid JSON")?;
    let secret = SecretKey::from(decode_key(private_key)?);
    open_value(&mut doc, &secret)?;
    serde_json::to_string_pretty(&doc).context("Failed to serialize decrypted document")
}

fn decode_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key.trim()).context("Key is not hex encoded")?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|e| anyhow!("Key must be 32 bytes, got {}: {e}", bytes.len()))
}

/// One ephemeral key per document
struct Sealer {
    public: [u8; 32],
    salsa: SalsaBox,
}

impl Sealer {
    fn new(recipient: &PublicKey) -> Self {
        let ephemeral = SecretKey::generate(&mut OsRng);
        Self {
            public: *ephemeral.public_key().as_bytes(),
            salsa: SalsaBox::new(recipient, &ephemeral),
        }
    }

    fn seal(&self, plaintext: &str) -> Result<String> {
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let sealed = self
            .salsa
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Failed to encrypt value: {e}"))?;
        Ok(format!(
            "{BOX_PREFIX}{}:{}:{}]",
            STANDARD.encode(self.public),
            STANDARD.encode(nonce.as_slice()),
            STANDARD.encode(sealed)
        ))
    }
}

fn seal_object(fields: &mut Map<String, Value>, sealer: &Sealer) -> Result<()> {
    for (key, value) in fields.iter_mut() {
        if key.starts_with('_') {
            continue;
        }
        seal_value(value, sealer)?;
    }
    Ok(())
}

fn seal_value(value: &mut Value, sealer: &Sealer) -> Result<()> {
    match value {
        Value::String(plain) if !plain.starts_with(BOX_PREFIX) => {
            *plain = sealer.seal(plain)?;
        }
        Value::Object(fields) => seal_object(fields, sealer)?,
        Value::Array(items) => {
            for item in items {
                seal_value(item, sealer)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn open_value(value: &mut Value, secret: &SecretKey) -> Result<()> {
    match value {
        Value::String(sealed) if sealed.starts_with(BOX_PREFIX) => {
            *sealed = open(sealed, secret)?;
        }
        Value::Object(fields) => {
            for item in fields.values_mut() {
                open_value(item, secret)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                open_value(item, secret)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn open(sealed: &str, secret: &SecretKey) -> Result<String> {
    let body = sealed
        .strip_prefix(BOX_PREFIX)
        .and_then(|rest| rest.strip_suffix(']'))
        .context("Malformed encrypted value")?;
    let mut parts = body.split(':').map(|part| STANDARD.decode(part));
    let (Some(public), Some(nonce), Some(payload), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        anyhow::bail!("Encrypted value must have three parts");
    };
    let public = <[u8; 32]>::try_from(public?.as_slice())
        .map_err(|e| anyhow!("Encrypter key must be 32 bytes: {e}"))?;
    let nonce = nonce?;
    anyhow::ensure!(nonce.len() == NONCE_SIZE, "Nonce must be {NONCE_SIZE} bytes");

    let salsa = SalsaBox::new(&PublicKey::from(public), secret);
    let plain = salsa
        .decrypt(crypto_box::aead::Nonce::<SalsaBox>::from_slice(&nonce), payload?.as_slice())
        .map_err(|e| anyhow!("Failed to decrypt value: {e}"))?;
    String::from_utf8(plain).context("Decrypted value is not UTF-8")
}
