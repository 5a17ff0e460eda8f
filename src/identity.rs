//! # Node Identity and Key Material
//!
//! This module defines the identity types every simulated node carries:
//!
//! - [`Contact`]: a node's name plus its (optional) transport address
//! - [`Keypair`]: the RSA private key used to open onion layers addressed to
//!   this node
//!
//! ## Identity Model
//!
//! Nodes are identified by **name**. The name is what envelopes are addressed
//! to, what traceroute prints, and what advertise records in its visited list.
//! The address is carried for the transport's benefit and is never used for
//! routing decisions inside this crate.
//!
//! ## Key Provisioning
//!
//! Keys are provisioned externally: either generated in-process
//! ([`Keypair::generate`]) or loaded from a PKCS#8 PEM document
//! ([`Keypair::from_pkcs8_pem`]). Only the public half ever leaves the node.

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

/// RSA modulus size used for freshly generated node keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// A node's name and optional transport address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub addr: Option<String>,
}

impl Contact {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: Some(addr.into()),
        }
    }

    /// A contact whose address is not yet known (advertise fills these in
    /// from the member list, which only carries names).
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: None,
        }
    }

    #[inline]
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.addr {
            Some(addr) => write!(f, "{}@{}", self.name, addr),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Clone)]
pub struct Keypair {
    private_key: RsaPrivateKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS random source.
    ///
    /// # Errors
    /// Returns the underlying RSA error if prime generation fails.
    pub fn generate() -> Result<Self, rsa::Error> {
        Self::generate_with_rng(&mut OsRng, DEFAULT_KEY_BITS)
    }

    /// Generate a keypair from a caller-supplied RNG.
    ///
    /// Tests pass a seeded `StdRng` and a small modulus so runs are
    /// reproducible and fast.
    pub fn generate_with_rng<R: RngCore + CryptoRng>(
        rng: &mut R,
        bits: usize,
    ) -> Result<Self, rsa::Error> {
        let private_key = RsaPrivateKey::new(rng, bits)?;
        Ok(Self { private_key })
    }

    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, rsa::pkcs8::Error> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)?;
        Ok(Self { private_key })
    }

    pub fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.private_key)
    }

    /// Unwrap a value that was encrypted to this node's public key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, rsa::Error> {
        self.private_key.decrypt(Pkcs1v15Encrypt, ciphertext)
    }

    /// Short fingerprint of the public key, used only for logging.
    pub fn fingerprint(&self) -> String {
        use rsa::traits::PublicKeyParts;

        let public = self.public_key();
        let mut hasher = blake3::Hasher::new();
        hasher.update(&public.n().to_bytes_be());
        hasher.update(&public.e().to_bytes_be());
        hex::encode(&hasher.finalize().as_bytes()[..8])
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}
