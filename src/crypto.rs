//! # Onion Layer Cryptography
//!
//! Each onion layer is a hybrid ciphertext:
//!
//! - **Body**: AES-128-CBC with PKCS#7 padding under a fresh random key and IV
//! - **Key wrap**: the key and the IV are each encrypted to the relay's RSA
//!   public key (PKCS#1 v1.5) and carried in the envelope's `encryption` field
//!
//! The plaintext body is a small JSON document:
//!
//! ```text
//! {"complete": true,  "message": "..."}          // final hop
//! {"complete": false, "next_cmp": "<envelope>"}  // relay hop
//! ```
//!
//! ## Security Properties
//!
//! - A relay can open only the layer sealed to its own key
//! - The inner envelope is opaque until its own relay opens it, so a hop
//!   learns its successor and nothing further along the route
//! - Any failure (unwrap, unpad, parse) is reported as one [`OnionError`];
//!   callers never see partial plaintext

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{CryptoRng, RngCore};
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::envelope::{
    Encryption, Envelope, decode_blob, decode_envelope_bounded, encode_blob, encode_envelope,
};
use crate::identity::Keypair;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES-128 key length in bytes.
pub const LAYER_KEY_LEN: usize = 16;

/// CBC initialization vector length in bytes.
pub const LAYER_IV_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnionError {
    /// This node has no private key to open layers with.
    NoKeypair,
    /// The layer arrived without wrapped key material.
    MissingKeyMaterial,
    /// A base64 field could not be decoded.
    Encoding(&'static str),
    /// RSA unwrap of the key or IV failed.
    KeyUnwrap,
    /// Unwrapped key or IV has the wrong length.
    KeyLength { key: usize, iv: usize },
    /// AES decryption or padding check failed.
    Decrypt,
    /// Plaintext is not a well-formed layer.
    Malformed(String),
    /// Sealing failed (only raised while building onions).
    Seal(String),
}

impl std::fmt::Display for OnionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnionError::NoKeypair => write!(f, "no private key provisioned"),
            OnionError::MissingKeyMaterial => write!(f, "layer has no wrapped key material"),
            OnionError::Encoding(field) => write!(f, "{} is not valid base64", field),
            OnionError::KeyUnwrap => write!(f, "failed to unwrap layer key"),
            OnionError::KeyLength { key, iv } => {
                write!(f, "unwrapped key/iv have wrong length ({}/{})", key, iv)
            }
            OnionError::Decrypt => write!(f, "layer decryption failed"),
            OnionError::Malformed(reason) => write!(f, "malformed layer: {}", reason),
            OnionError::Seal(reason) => write!(f, "failed to seal layer: {}", reason),
        }
    }
}

impl std::error::Error for OnionError {}

/// What one layer reveals once opened.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerContents {
    /// This node is the final destination.
    Final { message: String },
    /// Forward the enclosed envelope.
    Relay { next: Box<Envelope> },
}

#[derive(Serialize, Deserialize)]
struct LayerBody {
    complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next_cmp: Option<String>,
}

/// Open the layer addressed to `keypair`'s owner. An enclosed envelope
/// longer than `limit` bytes is rejected as malformed.
pub fn open_layer(
    keypair: &Keypair,
    blob: &str,
    encryption: &Encryption,
    limit: usize,
) -> Result<LayerContents, OnionError> {
    let ciphertext = decode_blob(blob).map_err(|_| OnionError::Encoding("TOR"))?;
    let wrapped_key = decode_blob(&encryption.key).map_err(|_| OnionError::Encoding("key"))?;
    let wrapped_iv = decode_blob(&encryption.iv).map_err(|_| OnionError::Encoding("iv"))?;

    let key = keypair.decrypt(&wrapped_key).map_err(|_| OnionError::KeyUnwrap)?;
    let iv = keypair.decrypt(&wrapped_iv).map_err(|_| OnionError::KeyUnwrap)?;

    let plaintext = Aes128CbcDec::new_from_slices(&key, &iv)
        .map_err(|_| OnionError::KeyLength {
            key: key.len(),
            iv: iv.len(),
        })?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| OnionError::Decrypt)?;

    let body: LayerBody = serde_json::from_slice(&plaintext)
        .map_err(|e| OnionError::Malformed(e.to_string()))?;

    if body.complete {
        let message = body
            .message
            .ok_or_else(|| OnionError::Malformed("final layer without message".into()))?;
        return Ok(LayerContents::Final { message });
    }

    let next_cmp = body
        .next_cmp
        .ok_or_else(|| OnionError::Malformed("relay layer without next_cmp".into()))?;
    let next = decode_envelope_bounded(&next_cmp, limit).map_err(|e| OnionError::Malformed(e.to_string()))?;
    Ok(LayerContents::Relay { next: Box::new(next) })
}

/// Seal `contents` to `recipient`. Returns the base64 blob and its wrapped
/// key material.
pub fn seal_layer<R: RngCore + CryptoRng>(
    rng: &mut R,
    recipient: &RsaPublicKey,
    contents: &LayerContents,
) -> Result<(String, Encryption), OnionError> {
    let body = match contents {
        LayerContents::Final { message } => LayerBody {
            complete: true,
            message: Some(message.clone()),
            next_cmp: None,
        },
        LayerContents::Relay { next } => LayerBody {
            complete: false,
            message: None,
            next_cmp: Some(encode_envelope(next).map_err(|e| OnionError::Seal(e.to_string()))?),
        },
    };
    let plaintext = serde_json::to_vec(&body).map_err(|e| OnionError::Seal(e.to_string()))?;

    let mut key = [0u8; LAYER_KEY_LEN];
    let mut iv = [0u8; LAYER_IV_LEN];
    rng.fill_bytes(&mut key);
    rng.fill_bytes(&mut iv);

    let ciphertext = Aes128CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

    let wrapped_key = recipient
        .encrypt(rng, Pkcs1v15Encrypt, &key)
        .map_err(|e| OnionError::Seal(e.to_string()))?;
    let wrapped_iv = recipient
        .encrypt(rng, Pkcs1v15Encrypt, &iv)
        .map_err(|e| OnionError::Seal(e.to_string()))?;

    Ok((
        encode_blob(&ciphertext),
        Encryption {
            key: encode_blob(&wrapped_key),
            iv: encode_blob(&wrapped_iv),
        },
    ))
}
