//! Operator-supplied trust material.
//!
//! A [`KeyRing`] holds OpenPGP public keys (binary or ASCII-armored, as
//! exported by `gpg --export`) and bare RSA public keys (PEM, PKCS#1 or
//! SPKI). It answers the two questions signature verification asks:
//! "which key made this detached signature" and "which RSA keys do I trust".

use std::fmt;
use std::fs;
use std::path::Path;

use pgp::types::{PublicKeyTrait, PublicParams};
use pgp::{Deserializable, SignedPublicKey, StandaloneSignature};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};

use crate::hash::HashKind;
use crate::{FitError, Result};

const PGP_ARMOR_PREFIX: &[u8] = b"-----BEGIN PGP";
const PEM_RSA_PUBLIC: &str = "-----BEGIN RSA PUBLIC KEY-----";
const PEM_PUBLIC: &str = "-----BEGIN PUBLIC KEY-----";

/// Key files larger than this are rejected before reading.
pub const MAX_KEY_FILE_SIZE: u64 = 1 << 20;

/// Public key material held by a [`KeyRing`].
#[derive(Clone)]
pub enum KeyMaterial {
    Pgp(Box<SignedPublicKey>),
    Rsa(RsaPublicKey),
}

/// A named key. The name is what verification reports as the signer.
#[derive(Clone)]
pub struct KeyEntry {
    pub name: String,
    pub key: KeyMaterial,
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.key {
            KeyMaterial::Pgp(_) => "pgp",
            KeyMaterial::Rsa(_) => "rsa",
        };
        write!(f, "{} ({kind})", self.name)
    }
}

#[derive(Clone, Default)]
pub struct KeyRing {
    entries: Vec<KeyEntry>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every key file in `paths`. The file stem names the key.
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut ring = KeyRing::new();
        for path in paths {
            ring.add_file(path.as_ref())?;
        }
        Ok(ring)
    }

    pub fn add_file(&mut self, path: &Path) -> Result<()> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let size = fs::metadata(path)?.len();
        if size > MAX_KEY_FILE_SIZE {
            return Err(FitError::TooLarge {
                what: "key file",
                size,
                max: MAX_KEY_FILE_SIZE,
            });
        }
        let bytes = fs::read(path).map_err(|e| FitError::BadKey {
            name: path.display().to_string(),
            cause: e.to_string(),
        })?;
        self.add_bytes(&name, &bytes)
    }

    /// Add keys from an in-memory file image. PEM RSA keys are recognised
    /// by their armor line; everything else is parsed as OpenPGP.
    pub fn add_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let bad_key = |cause: String| FitError::BadKey {
            name: name.to_string(),
            cause,
        };

        if let Ok(text) = std::str::from_utf8(bytes) {
            if text.contains(PEM_RSA_PUBLIC) {
                let key = RsaPublicKey::from_pkcs1_pem(text.trim())
                    .map_err(|e| bad_key(format!("PKCS#1 RSA public key: {e}")))?;
                self.add_rsa(name, key);
                return Ok(());
            }
            if text.contains(PEM_PUBLIC) {
                let key = RsaPublicKey::from_public_key_pem(text.trim())
                    .map_err(|e| bad_key(format!("SPKI RSA public key: {e}")))?;
                self.add_rsa(name, key);
                return Ok(());
            }
        }

        let keys: Vec<SignedPublicKey> = if bytes.starts_with(PGP_ARMOR_PREFIX) {
            let (keys, _headers) = SignedPublicKey::from_armor_many(bytes)
                .map_err(|e| bad_key(format!("armored OpenPGP key: {e}")))?;
            keys.collect::<std::result::Result<_, _>>()
                .map_err(|e| bad_key(format!("armored OpenPGP key: {e}")))?
        } else {
            SignedPublicKey::from_bytes_many(bytes)
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| bad_key(format!("OpenPGP key: {e}")))?
        };
        if keys.is_empty() {
            return Err(bad_key("no keys found".into()));
        }

        let many = keys.len() > 1;
        for (i, key) in keys.into_iter().enumerate() {
            key.verify()
                .map_err(|e| bad_key(format!("OpenPGP self-signature: {e}")))?;
            let entry_name = if many {
                format!("{name}#{i}")
            } else {
                name.to_string()
            };
            self.add_pgp(&entry_name, key);
        }
        Ok(())
    }

    pub fn add_pgp(&mut self, name: &str, key: SignedPublicKey) {
        self.entries.push(KeyEntry {
            name: name.to_string(),
            key: KeyMaterial::Pgp(Box::new(key)),
        });
    }

    pub fn add_rsa(&mut self, name: &str, key: RsaPublicKey) {
        self.entries.push(KeyEntry {
            name: name.to_string(),
            key: KeyMaterial::Rsa(key),
        });
    }

    pub fn entries(&self) -> &[KeyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Short human-readable listing used in error messages.
    pub fn description(&self) -> String {
        format!("key ring {:?}", self.entries)
    }

    /// Check a detached OpenPGP signature over `data`.
    ///
    /// Returns the name of the key-ring entry whose primary key or subkey
    /// produced the signature.
    pub fn check_detached_signature(&self, data: &[u8], signature: &[u8]) -> Result<String> {
        let sig = if signature.starts_with(PGP_ARMOR_PREFIX) {
            StandaloneSignature::from_armor_single(signature)
                .map(|(sig, _headers)| sig)
        } else {
            StandaloneSignature::from_bytes(signature)
        }
        .map_err(|e| FitError::Other(format!("cannot parse detached signature: {e}")))?;

        for entry in &self.entries {
            let KeyMaterial::Pgp(key) = &entry.key else {
                continue;
            };
            if sig.verify(key.as_ref(), data).is_ok() {
                return Ok(entry.name.clone());
            }
            if key
                .public_subkeys
                .iter()
                .any(|subkey| sig.verify(subkey, data).is_ok())
            {
                return Ok(entry.name.clone());
            }
        }
        Err(FitError::Other(format!(
            "signature not made by any key in {}",
            self.description()
        )))
    }

    /// Every RSA public key in the ring, bare PEM keys and RSA OpenPGP
    /// primary keys and subkeys alike, in ring order.
    pub fn rsa_public_keys(&self) -> Vec<(&str, RsaPublicKey)> {
        let mut keys = Vec::new();
        for entry in &self.entries {
            match &entry.key {
                KeyMaterial::Rsa(key) => keys.push((entry.name.as_str(), key.clone())),
                KeyMaterial::Pgp(key) => {
                    let params = std::iter::once(key.primary_key.public_params())
                        .chain(key.public_subkeys.iter().map(|s| s.key.public_params()));
                    for p in params {
                        if let Some(rsa_key) = rsa_from_pgp(p) {
                            keys.push((entry.name.as_str(), rsa_key));
                        }
                    }
                }
            }
        }
        keys
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

fn rsa_from_pgp(params: &PublicParams) -> Option<RsaPublicKey> {
    match params {
        PublicParams::RSA { n, e } => RsaPublicKey::new(
            BigUint::from_bytes_be(n.as_bytes()),
            BigUint::from_bytes_be(e.as_bytes()),
        )
        .ok(),
        _ => None,
    }
}

fn pkcs1v15_scheme(kind: HashKind) -> Pkcs1v15Sign {
    match kind {
        HashKind::Sha1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
        HashKind::Sha224 => Pkcs1v15Sign::new::<sha2::Sha224>(),
        HashKind::Sha256 => Pkcs1v15Sign::new::<sha2::Sha256>(),
        HashKind::Sha384 => Pkcs1v15Sign::new::<sha2::Sha384>(),
        HashKind::Sha512 => Pkcs1v15Sign::new::<sha2::Sha512>(),
        HashKind::Sha512_224 => Pkcs1v15Sign::new::<sha2::Sha512_224>(),
        HashKind::Sha512_256 => Pkcs1v15Sign::new::<sha2::Sha512_256>(),
        HashKind::Sha3_224 => Pkcs1v15Sign::new::<sha3::Sha3_224>(),
        HashKind::Sha3_256 => Pkcs1v15Sign::new::<sha3::Sha3_256>(),
        HashKind::Sha3_384 => Pkcs1v15Sign::new::<sha3::Sha3_384>(),
        HashKind::Sha3_512 => Pkcs1v15Sign::new::<sha3::Sha3_512>(),
    }
}

/// RSA PKCS#1 v1.5 check of `signature` over a precomputed `digest`.
pub fn verify_pkcs1v15(
    key: &RsaPublicKey,
    kind: HashKind,
    digest: &[u8],
    signature: &[u8],
) -> Result<()> {
    key.verify(pkcs1v15_scheme(kind), digest, signature)
        .map_err(|e| FitError::Other(format!("RSA {kind} signature check failed: {e}")))
}
