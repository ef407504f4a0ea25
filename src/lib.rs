//! # fitload
//!
//! Verify and boot kernels packed in U-Boot FIT (Flattened Image Tree) images.
//!
//! The pipeline is:
//!
//! - **Parse** the `.itb` device tree blob ([`dtb`])
//! - **Select** a configuration under `/configurations` ([`fit::FitImage::resolve_config`])
//! - **Extract** the kernel / initramfs `data` from `/images/<name>`
//! - **Verify** the image's `signature*` nodes against an operator key ring
//!   ([`signature`], [`keyring`], [`hash`]). PGP detached signatures and
//!   RSA PKCS#1 v1.5 are both checked in pure Rust
//! - **Place** the verified bytes into kexec segments and hand off ([`kexec`])
//!
//! Plain files signed with a sibling `.sig` or pinned by a SHA-256/512 digest
//! are handled by [`vfile`].
//!
//! ## Example
//!
//! ```no_run
//! use fitload::fit::{FitImage, LoadOptions};
//! use fitload::kexec::RecordingLoader;
//! use fitload::keyring::KeyRing;
//!
//! let mut image = FitImage::new("image.itb")?;
//! image.set_key_ring(Some(KeyRing::from_files(&["boot-key.gpg"])?));
//! image.set_cmdline("console=ttyS0");
//! image.resolve_config()?;
//!
//! let mut loader = RecordingLoader::default();
//! image.load_with(&mut loader, &LoadOptions::default())?;
//! # Ok::<(), fitload::FitError>(())
//! ```

pub mod dtb;
pub mod fit;
pub mod hash;
pub mod kexec;
pub mod keyring;
pub mod signature;
pub mod vfile;

use std::io;

use thiserror::Error;

pub use vfile::Checked;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FitError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bad device tree: {0}")]
    BadTree(String),

    #[error("device tree too small ({size} bytes, need at least {min})")]
    TooSmall { size: usize, min: usize },

    #[error("{what} too large ({size} bytes, limit {max})")]
    TooLarge {
        what: &'static str,
        size: u64,
        max: u64,
    },

    #[error("configuration '{0}' not found under /configurations")]
    ConfigMiss(String),

    #[error("no configuration selected and /configurations has no 'default' property")]
    ConfigDefaultMissing,

    #[error("image has no /configurations node")]
    NoConfigurations,

    #[error("configuration '{0}' has no 'kernel' property")]
    ConfigNoKernel(String),

    #[error("image '{0}' not found under /images")]
    ImageNotFound(String),

    #[error("image '{0}' has no 'data' property")]
    ImageNoData(String),

    #[error("no valid signatures")]
    NoValidSignatures,

    #[error("too many signature nodes ({count}, limit {max})")]
    TooManySignatures { count: usize, max: usize },

    #[error("unrecognized hash algorithm '{0}'")]
    UnrecognizedAlgorithm(String),

    #[error("{path}: unsigned: {cause}")]
    Unsigned { path: String, cause: String },

    #[error("signature does not match any key in {key_ring}")]
    WrongSigner { key_ring: String },

    #[error("no key ring supplied, refusing to trust signed data")]
    NoKeyRing,

    #[error("{path}: invalid hash: {cause}")]
    InvalidHash { path: String, cause: String },

    #[error("{path}: hash mismatch (want {want}, got {got})")]
    HashMismatch {
        path: String,
        want: String,
        got: String,
    },

    #[error("bad key '{name}': {cause}")]
    BadKey { name: String, cause: String },

    #[error("root filesystem images are not yet supported (rootfs '{0}')")]
    UnsupportedRootfs(String),

    #[error("no kernel image selected; resolve a configuration first")]
    NoKernelSelected,

    #[error("load already attempted on this image")]
    AlreadyAttempted,

    #[error("segment {new} overlaps {existing}")]
    SegmentOverlap { new: String, existing: String },

    #[error("kexec load failed: {0}")]
    LoaderFailure(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FitError>;

impl FitError {
    /// True for the verification failures a caller may choose to
    /// warn about and boot through.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            FitError::Unsigned { .. }
                | FitError::WrongSigner { .. }
                | FitError::NoKeyRing
                | FitError::NoValidSignatures
                | FitError::InvalidHash { .. }
                | FitError::HashMismatch { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Property text helpers
// ---------------------------------------------------------------------------

/// False for control characters and the invisible Unicode format (`Cf`)
/// characters such as zero-width spaces and bidi marks.
pub fn is_printable(c: char) -> bool {
    !c.is_control()
        && !matches!(c,
            '\u{00ad}'
            | '\u{0600}'..='\u{0605}'
            | '\u{061c}'
            | '\u{06dd}'
            | '\u{070f}'
            | '\u{180e}'
            | '\u{200b}'..='\u{200f}'
            | '\u{202a}'..='\u{202e}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{206f}'
            | '\u{feff}'
            | '\u{fff9}'..='\u{fffb}'
            | '\u{110bd}'
            | '\u{e0001}'
            | '\u{e0020}'..='\u{e007f}')
}

/// Decode a property value as text, dropping every non-printable character.
///
/// Tree properties carry NUL terminators and, in damaged images, arbitrary
/// control bytes; both are removed.
pub fn printable(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .chars()
        .filter(|&c| is_printable(c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printable_strips_nul_and_control() {
        assert_eq!(printable(b"sha256,rsa2048\0"), "sha256,rsa2048");
        assert_eq!(printable(b"\x01sha\x7f256\n"), "sha256");
        assert_eq!(printable(b""), "");
        assert_eq!(printable("kernel\u{200b}@0\u{feff}".as_bytes()), "kernel@0");
        assert_eq!(printable(b"a b"), "a b");
    }

    #[test]
    fn test_verification_failures_are_classified() {
        assert!(FitError::NoKeyRing.is_verification_failure());
        assert!(FitError::WrongSigner {
            key_ring: "ring".into()
        }
        .is_verification_failure());
        assert!(!FitError::ConfigMiss("x".into()).is_verification_failure());
        assert!(!FitError::NoKernelSelected.is_verification_failure());
    }
}
