//! Hash algorithm registry.
//!
//! FIT `algo` properties name the digest as the first comma-separated token
//! (`"sha256,rsa4096"`). [`parse_hash_algorithm`] maps such a string onto a
//! [`HashKind`] through a fixed, case-insensitive name table.

use std::io::{self, Read, Write};

use sha2::Digest;

use crate::{is_printable, FitError, Result};

/// Digest algorithms understood by signature and file-hash verification.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Sha512_224,
    Sha512_256,
    Sha3_224,
    Sha3_256,
    Sha3_384,
    Sha3_512,
}

/// Registry entries as `(NAME, kind)`. Names are upper case; lookups
/// upper-case the candidate first.
pub const HASH_REGISTRY: &[(&str, HashKind)] = &[
    ("SHA1", HashKind::Sha1),
    ("SHA224", HashKind::Sha224),
    ("SHA256", HashKind::Sha256),
    ("SHA384", HashKind::Sha384),
    ("SHA512", HashKind::Sha512),
    ("SHA512_224", HashKind::Sha512_224),
    ("SHA512_256", HashKind::Sha512_256),
    ("SHA3_224", HashKind::Sha3_224),
    ("SHA3_256", HashKind::Sha3_256),
    ("SHA3_384", HashKind::Sha3_384),
    ("SHA3_512", HashKind::Sha3_512),
];

impl HashKind {
    /// Look up by name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        HASH_REGISTRY
            .iter()
            .find(|(n, _)| *n == upper)
            .map(|&(_, kind)| kind)
    }

    /// Registry name.
    pub fn name(self) -> &'static str {
        HASH_REGISTRY
            .iter()
            .find(|&&(_, kind)| kind == self)
            .map(|&(n, _)| n)
            .unwrap_or("UNKNOWN")
    }

    /// Digest length in bytes.
    pub fn output_size(self) -> usize {
        match self {
            HashKind::Sha1 => 20,
            HashKind::Sha224 | HashKind::Sha512_224 | HashKind::Sha3_224 => 28,
            HashKind::Sha256 | HashKind::Sha512_256 | HashKind::Sha3_256 => 32,
            HashKind::Sha384 | HashKind::Sha3_384 => 48,
            HashKind::Sha512 | HashKind::Sha3_512 => 64,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashKind::Sha1 => sha1::Sha1::digest(data).to_vec(),
            HashKind::Sha224 => sha2::Sha224::digest(data).to_vec(),
            HashKind::Sha256 => sha2::Sha256::digest(data).to_vec(),
            HashKind::Sha384 => sha2::Sha384::digest(data).to_vec(),
            HashKind::Sha512 => sha2::Sha512::digest(data).to_vec(),
            HashKind::Sha512_224 => sha2::Sha512_224::digest(data).to_vec(),
            HashKind::Sha512_256 => sha2::Sha512_256::digest(data).to_vec(),
            HashKind::Sha3_224 => sha3::Sha3_224::digest(data).to_vec(),
            HashKind::Sha3_256 => sha3::Sha3_256::digest(data).to_vec(),
            HashKind::Sha3_384 => sha3::Sha3_384::digest(data).to_vec(),
            HashKind::Sha3_512 => sha3::Sha3_512::digest(data).to_vec(),
        }
    }

    /// Digest everything `reader` yields without buffering it whole.
    pub fn digest_reader<R: Read>(self, reader: &mut R) -> io::Result<Vec<u8>> {
        match self {
            HashKind::Sha1 => stream::<sha1::Sha1, R>(reader),
            HashKind::Sha224 => stream::<sha2::Sha224, R>(reader),
            HashKind::Sha256 => stream::<sha2::Sha256, R>(reader),
            HashKind::Sha384 => stream::<sha2::Sha384, R>(reader),
            HashKind::Sha512 => stream::<sha2::Sha512, R>(reader),
            HashKind::Sha512_224 => stream::<sha2::Sha512_224, R>(reader),
            HashKind::Sha512_256 => stream::<sha2::Sha512_256, R>(reader),
            HashKind::Sha3_224 => stream::<sha3::Sha3_224, R>(reader),
            HashKind::Sha3_256 => stream::<sha3::Sha3_256, R>(reader),
            HashKind::Sha3_384 => stream::<sha3::Sha3_384, R>(reader),
            HashKind::Sha3_512 => stream::<sha3::Sha3_512, R>(reader),
        }
    }
}

impl std::fmt::Display for HashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn stream<D: Digest + Write, R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut hasher = D::new();
    io::copy(reader, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

/// Compute the digest of `data` with `kind`.
pub fn digest(kind: HashKind, data: &[u8]) -> Vec<u8> {
    kind.digest(data)
}

/// Resolve a FIT `algo` string to a hash kind.
///
/// Control and invisible format characters are dropped first, then the
/// string is split on `,` and each token is tried in order, as is. The first
/// token naming a registered hash wins, even if a later token would also
/// match.
pub fn parse_hash_algorithm(algo: &str) -> Result<HashKind> {
    let cleaned: String = algo.chars().filter(|&c| is_printable(c)).collect();
    cleaned
        .split(',')
        .find_map(HashKind::from_name)
        .ok_or(FitError::UnrecognizedAlgorithm(cleaned))
}
