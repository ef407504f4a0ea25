//! Verified file access.
//!
//! Every check here hands back the data it examined together with the
//! outcome, as a [`Checked`]. A failed check does not throw the bytes (or
//! the file handle) away: the caller decides whether to abort, which is the
//! default through [`Checked::into_verified`], or to warn and carry on with
//! [`Checked::or_warn`].
//!
//! File handles are always rewound to offset 0 before they are returned, on
//! success and failure alike, so the caller can read the file from the start.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::hash::HashKind;
use crate::keyring::KeyRing;
use crate::{FitError, Result};

/// Signed files are read whole for verification; larger ones are refused.
pub const MAX_SIGNED_FILE_SIZE: u64 = 1 << 30;

/// Detached signatures larger than this are not signatures.
pub const MAX_SIGNATURE_SIZE: u64 = 64 << 10;

/// Data paired with the result of verifying it.
#[must_use = "a verification result must be inspected"]
#[derive(Debug)]
pub struct Checked<T> {
    data: T,
    error: Option<FitError>,
}

impl<T> Checked<T> {
    pub fn verified(data: T) -> Self {
        Self { data, error: None }
    }

    pub fn rejected(data: T, error: FitError) -> Self {
        Self {
            data,
            error: Some(error),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.error.is_none()
    }

    /// The examined data, whatever the outcome.
    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn error(&self) -> Option<&FitError> {
        self.error.as_ref()
    }

    pub fn into_parts(self) -> (T, Option<FitError>) {
        (self.data, self.error)
    }

    /// Fail closed: the data only if verification succeeded.
    pub fn into_verified(self) -> Result<T> {
        match self.error {
            None => Ok(self.data),
            Some(e) => Err(e),
        }
    }

    /// Warn and continue: log any failure and return the data regardless.
    pub fn or_warn(self) -> T {
        if let Some(e) = &self.error {
            warn!("continuing with unverified data: {e}");
        }
        self.data
    }
}

fn rewind(file: &mut File) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    Ok(())
}

/// Path of the detached signature conventionally stored next to `path`.
pub fn sig_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".sig");
    PathBuf::from(s)
}

/// Open `path` and check it against the detached signature at `path.sig`.
pub fn open_signed_sig_file(key_ring: Option<&KeyRing>, path: &Path) -> Result<Checked<File>> {
    open_signed_file(key_ring, path, &sig_path(path))
}

/// Open `path` and check it against the detached OpenPGP signature in
/// `signature_path`.
///
/// Only a failure to open `path` itself is an `Err`; every verification
/// failure comes back as a rejected [`Checked`] holding the open handle.
pub fn open_signed_file(
    key_ring: Option<&KeyRing>,
    path: &Path,
    signature_path: &Path,
) -> Result<Checked<File>> {
    let mut file = File::open(path)?;
    let outcome = check_signed(&mut file, key_ring, path, signature_path);
    rewind(&mut file)?;
    Ok(match outcome {
        Ok(signer) => {
            debug!("{}: signed by {signer}", path.display());
            Checked::verified(file)
        }
        Err(e) => Checked::rejected(file, e),
    })
}

fn check_signed(
    file: &mut File,
    key_ring: Option<&KeyRing>,
    path: &Path,
    signature_path: &Path,
) -> Result<String> {
    let key_ring = key_ring.ok_or(FitError::NoKeyRing)?;
    let unsigned = |cause: String| FitError::Unsigned {
        path: path.display().to_string(),
        cause,
    };

    let sig_len = fs::metadata(signature_path)
        .map_err(|e| unsigned(format!("{}: {e}", signature_path.display())))?
        .len();
    if sig_len > MAX_SIGNATURE_SIZE {
        return Err(unsigned(format!(
            "{}: {sig_len} bytes is too large for a signature",
            signature_path.display()
        )));
    }
    let signature =
        fs::read(signature_path).map_err(|e| unsigned(format!("{}: {e}", signature_path.display())))?;

    let len = file.metadata()?.len();
    if len > MAX_SIGNED_FILE_SIZE {
        return Err(FitError::TooLarge {
            what: "signed file",
            size: len,
            max: MAX_SIGNED_FILE_SIZE,
        });
    }
    let mut data = Vec::with_capacity(len as usize);
    file.read_to_end(&mut data)?;

    key_ring
        .check_detached_signature(&data, &signature)
        .map_err(|e| unsigned(e.to_string()))
}

/// Open `path` and compare its SHA-256 digest with `want`.
pub fn open_hashed_file256(path: &Path, want: &[u8]) -> Result<Checked<File>> {
    open_hashed_file(path, HashKind::Sha256, want)
}

/// Open `path` and compare its SHA-512 digest with `want`.
pub fn open_hashed_file512(path: &Path, want: &[u8]) -> Result<Checked<File>> {
    open_hashed_file(path, HashKind::Sha512, want)
}

/// Open `path` and compare its `kind` digest with the precomputed `want`.
pub fn open_hashed_file(path: &Path, kind: HashKind, want: &[u8]) -> Result<Checked<File>> {
    let mut file = File::open(path)?;
    let outcome = check_hashed(&mut file, path, kind, want);
    rewind(&mut file)?;
    Ok(match outcome {
        Ok(()) => Checked::verified(file),
        Err(e) => Checked::rejected(file, e),
    })
}

fn check_hashed(file: &mut File, path: &Path, kind: HashKind, want: &[u8]) -> Result<()> {
    if want.len() != kind.output_size() {
        return Err(FitError::InvalidHash {
            path: path.display().to_string(),
            cause: format!(
                "{kind} digest must be {} bytes, got {}",
                kind.output_size(),
                want.len()
            ),
        });
    }
    let got = kind.digest_reader(file)?;
    if got != want {
        return Err(FitError::HashMismatch {
            path: path.display().to_string(),
            want: hex::encode(want),
            got: hex::encode(got),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KERNEL0: &[u8] = include_bytes!("../testdata/kernel0.bin");
    const KERNEL0_SIG: &[u8] = include_bytes!("../testdata/kernel0.key0.pgp.sig");
    const KEY0: &[u8] = include_bytes!("../testdata/key0.gpg");
    const KEY1: &[u8] = include_bytes!("../testdata/key1.gpg");

    fn ring(name: &str, bytes: &[u8]) -> KeyRing {
        let mut r = KeyRing::new();
        r.add_bytes(name, bytes).unwrap();
        r
    }

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    fn read_all(mut f: File) -> Vec<u8> {
        let mut v = Vec::new();
        f.read_to_end(&mut v).unwrap();
        v
    }

    #[test]
    fn test_sig_path_appends_suffix() {
        assert_eq!(sig_path(Path::new("/boot/kernel")), PathBuf::from("/boot/kernel.sig"));
        assert_eq!(sig_path(Path::new("a.bin")), PathBuf::from("a.bin.sig"));
    }

    #[test]
    fn test_signed_file_verifies_and_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "kernel", KERNEL0);
        write_file(dir.path(), "kernel.sig", KERNEL0_SIG);

        let checked = open_signed_sig_file(Some(&ring("key0", KEY0)), &path).unwrap();
        assert!(checked.is_verified());
        assert_eq!(read_all(checked.into_verified().unwrap()), KERNEL0);
    }

    #[test]
    fn test_signed_file_wrong_key_keeps_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "kernel", KERNEL0);
        write_file(dir.path(), "kernel.sig", KERNEL0_SIG);

        let checked = open_signed_sig_file(Some(&ring("key1", KEY1)), &path).unwrap();
        assert!(matches!(checked.error(), Some(FitError::Unsigned { .. })));
        let (file, err) = checked.into_parts();
        assert!(err.is_some());
        assert_eq!(read_all(file), KERNEL0);
    }

    #[test]
    fn test_signed_file_missing_sig_is_unsigned() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "kernel", KERNEL0);

        let checked = open_signed_sig_file(Some(&ring("key0", KEY0)), &path).unwrap();
        match checked.error() {
            Some(FitError::Unsigned { path: p, cause }) => {
                assert!(p.ends_with("kernel"));
                assert!(cause.contains("kernel.sig"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(read_all(checked.or_warn()), KERNEL0);
    }

    #[test]
    fn test_signed_file_without_key_ring_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "kernel", KERNEL0);
        write_file(dir.path(), "kernel.sig", KERNEL0_SIG);

        let checked = open_signed_sig_file(None, &path).unwrap();
        assert!(matches!(checked.error(), Some(FitError::NoKeyRing)));
        assert!(matches!(checked.into_verified(), Err(FitError::NoKeyRing)));
    }

    #[test]
    fn test_missing_data_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let r = open_signed_sig_file(Some(&ring("key0", KEY0)), &dir.path().join("nope"));
        assert!(matches!(r, Err(FitError::Io(_))));
    }

    #[test]
    fn test_hashed_file_match_and_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "kernel1", include_bytes!("../testdata/kernel1.bin"));

        let want256 =
            hex::decode("109ba3e2a170957465ee0be64af7af44b90dd1dae27ed97b046e1034dd5c012f").unwrap();
        let checked = open_hashed_file256(&path, &want256).unwrap();
        assert!(checked.is_verified());
        assert_eq!(read_all(checked.into_verified().unwrap()).len(), 100);

        let want512 = hex::decode(
            "54f8bfa998e8bf3665495bccfee174e196cb5e988842dd5330f4f8a37e3714b1\
             bbfea11b2b3a96e6c77ac98a7d59cf459278f1f4d1b5eec73d93ddfd09caf96e",
        )
        .unwrap();
        assert!(open_hashed_file512(&path, &want512).unwrap().is_verified());

        let mut wrong = want256.clone();
        wrong[0] ^= 0xff;
        let checked = open_hashed_file256(&path, &wrong).unwrap();
        assert!(matches!(checked.error(), Some(FitError::HashMismatch { .. })));
        // Handle is rewound even though hashing consumed it.
        assert_eq!(read_all(checked.or_warn()).len(), 100);
    }

    #[test]
    fn test_hashed_file_bad_digest_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "data", b"abc");
        let checked = open_hashed_file512(&path, &[0u8; 32]).unwrap();
        assert!(matches!(checked.error(), Some(FitError::InvalidHash { .. })));
    }
}
