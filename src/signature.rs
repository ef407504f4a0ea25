//! FIT image signatures.
//!
//! Each `/images/<name>` node may carry `signature*` children:
//!
//! ```text
//! signature-1 {
//!     algo = "sha256,rsa2048";
//!     value = <...>;
//!     signer-name = "...";      (optional)
//!     key-name-hint = "...";    (optional)
//! };
//! ```
//!
//! `algo` decides the kind: anything mentioning `pgp` is a detached OpenPGP
//! signature over the image data, anything mentioning `rsa` is a raw PKCS#1
//! v1.5 signature over the digest named by the algo string.

use log::{debug, warn};

use crate::dtb::DtNode;
use crate::hash::{parse_hash_algorithm, HashKind};
use crate::keyring::{verify_pkcs1v15, KeyRing};
use crate::vfile::Checked;
use crate::{printable, FitError, Result};

pub const FIT_SIG_NODENAME: &str = "signature";
pub const FIT_VALUE_PROP: &str = "value";
pub const FIT_ALGO_PROP: &str = "algo";
pub const FIT_SIGNER_NAME_PROP: &str = "signer-name";
pub const FIT_KEY_HINT_PROP: &str = "key-name-hint";

/// Upper bound on signature nodes considered for one image.
pub const MAX_SIGNATURE_NODES: usize = 64;

/// `signature`, `signature-1`, `Signature@2`, ...
pub fn is_signature_node(node: &DtNode) -> bool {
    node.name
        .get(..FIT_SIG_NODENAME.len())
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case(FIT_SIG_NODENAME))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    Pgp {
        name: String,
        signer: String,
        key_name_hint: String,
        signature: Vec<u8>,
    },
    Rsa {
        name: String,
        signer: String,
        key_name_hint: String,
        hash: HashKind,
        signature: Vec<u8>,
    },
}

impl Signature {
    /// Node name the signature was parsed from.
    pub fn name(&self) -> &str {
        match self {
            Signature::Pgp { name, .. } | Signature::Rsa { name, .. } => name,
        }
    }

    pub fn signer(&self) -> &str {
        match self {
            Signature::Pgp { signer, .. } | Signature::Rsa { signer, .. } => signer,
        }
    }

    pub fn key_name_hint(&self) -> &str {
        match self {
            Signature::Pgp { key_name_hint, .. } | Signature::Rsa { key_name_hint, .. } => {
                key_name_hint
            }
        }
    }

    /// Check `data` against this signature. Returns the name of the key
    /// ring entry that made it.
    pub fn verify(&self, data: &[u8], key_ring: &KeyRing) -> Result<String> {
        match self {
            Signature::Pgp {
                name, signature, ..
            } => key_ring
                .check_detached_signature(data, signature)
                .map_err(|e| FitError::Unsigned {
                    path: name.clone(),
                    cause: e.to_string(),
                }),
            Signature::Rsa {
                name,
                hash,
                signature,
                ..
            } => {
                let digest = hash.digest(data);
                for (key_name, key) in key_ring.rsa_public_keys() {
                    match verify_pkcs1v15(&key, *hash, &digest, signature) {
                        Ok(()) => return Ok(key_name.to_string()),
                        Err(e) => debug!("{name}: key {key_name}: {e}"),
                    }
                }
                Err(FitError::WrongSigner {
                    key_ring: key_ring.description(),
                })
            }
        }
    }
}

/// Build signatures from candidate nodes, skipping unusable ones.
pub fn parse_signatures(nodes: &[&DtNode]) -> Result<Vec<Signature>> {
    if nodes.len() > MAX_SIGNATURE_NODES {
        return Err(FitError::TooManySignatures {
            count: nodes.len(),
            max: MAX_SIGNATURE_NODES,
        });
    }

    let mut sigs = Vec::with_capacity(nodes.len());
    for node in nodes {
        let name = node.name.clone();
        let Some(value) = node.property(FIT_VALUE_PROP) else {
            warn!("{name}: no '{FIT_VALUE_PROP}' property, skipping");
            continue;
        };
        let Some(algo) = node.property(FIT_ALGO_PROP) else {
            warn!("{name}: no '{FIT_ALGO_PROP}' property, skipping");
            continue;
        };
        let algo = printable(algo);
        let signer = node.property(FIT_SIGNER_NAME_PROP).map(printable).unwrap_or_default();
        let key_name_hint = node.property(FIT_KEY_HINT_PROP).map(printable).unwrap_or_default();
        let signature = value.to_vec();

        if algo.contains("pgp") {
            sigs.push(Signature::Pgp {
                name,
                signer,
                key_name_hint,
                signature,
            });
        } else if algo.contains("rsa") {
            match parse_hash_algorithm(&algo) {
                Ok(hash) => sigs.push(Signature::Rsa {
                    name,
                    signer,
                    key_name_hint,
                    hash,
                    signature,
                }),
                Err(e) => warn!("{name}: {e}, skipping"),
            }
        } else {
            warn!("{name}: unsupported algo '{algo}', skipping");
        }
    }

    if sigs.is_empty() {
        return Err(FitError::NoValidSignatures);
    }
    Ok(sigs)
}

/// Try each signature in order until one verifies `data`.
///
/// The data is returned either way. On failure the error is the one from
/// the last signature tried.
pub fn verify_signatures<T: AsRef<[u8]>>(
    signatures: &[Signature],
    data: T,
    key_ring: Option<&KeyRing>,
) -> Checked<T> {
    let Some(key_ring) = key_ring else {
        return Checked::rejected(data, FitError::NoKeyRing);
    };

    let mut last_err = FitError::NoValidSignatures;
    for sig in signatures {
        match sig.verify(data.as_ref(), key_ring) {
            Ok(key) => {
                debug!(
                    "{}: verified with key {key} (signer '{}', key hint '{}')",
                    sig.name(),
                    sig.signer(),
                    sig.key_name_hint()
                );
                return Checked::verified(data);
            }
            Err(e) => {
                debug!(
                    "{}: signer '{}', key hint '{}': {e}",
                    sig.name(),
                    sig.signer(),
                    sig.key_name_hint()
                );
                last_err = e;
            }
        }
    }
    Checked::rejected(data, last_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KERNEL0: &[u8] = include_bytes!("../testdata/kernel0.bin");
    const RAMDISK0: &[u8] = include_bytes!("../testdata/ramdisk0.bin");
    const KEY0: &[u8] = include_bytes!("../testdata/key0.gpg");
    const KEY1: &[u8] = include_bytes!("../testdata/key1.gpg");
    const RSA0: &[u8] = include_bytes!("../testdata/rsa0.pub.pem");
    const RSA1: &[u8] = include_bytes!("../testdata/rsa1.pub.pem");

    fn sig_node(name: &str, algo: Option<&str>, value: Option<&[u8]>) -> DtNode {
        let mut n = DtNode::new(name);
        if let Some(algo) = algo {
            n.set_property_str(FIT_ALGO_PROP, algo);
        }
        if let Some(value) = value {
            n.set_property(FIT_VALUE_PROP, value.to_vec());
        }
        n
    }

    fn ring(keys: &[(&str, &[u8])]) -> KeyRing {
        let mut r = KeyRing::new();
        for (name, bytes) in keys {
            r.add_bytes(name, bytes).unwrap();
        }
        r
    }

    fn rsa_kernel_sig() -> Signature {
        let node = sig_node(
            "signature-1",
            Some("sha256,rsa2048"),
            Some(include_bytes!("../testdata/kernel0.rsa0.sha256.sig")),
        );
        parse_signatures(&[&node]).unwrap().remove(0)
    }

    #[test]
    fn test_signature_node_names() {
        assert!(is_signature_node(&DtNode::new("signature")));
        assert!(is_signature_node(&DtNode::new("signature-1")));
        assert!(is_signature_node(&DtNode::new("SIGNATURE@2")));
        assert!(!is_signature_node(&DtNode::new("sig")));
        assert!(!is_signature_node(&DtNode::new("hash-1")));
    }

    #[test]
    fn test_incomplete_nodes_are_skipped() {
        let no_value = sig_node("signature-1", Some("sha256,rsa2048"), None);
        let no_algo = sig_node("signature-2", None, Some(b"abc"));
        let mut good = sig_node("signature-3", Some("sha256,rsa2048\0"), Some(b"abc"));
        good.set_property_str(FIT_SIGNER_NAME_PROP, "mkimage");
        good.set_property_str(FIT_KEY_HINT_PROP, "dev");

        let sigs = parse_signatures(&[&no_value, &no_algo, &good]).unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(
            sigs[0],
            Signature::Rsa {
                name: "signature-3".into(),
                signer: "mkimage".into(),
                key_name_hint: "dev".into(),
                hash: HashKind::Sha256,
                signature: b"abc".to_vec(),
            }
        );
    }

    #[test]
    fn test_classification_by_algo() {
        let pgp = sig_node("signature-1", Some("pgp"), Some(b"x"));
        let bad_hash = sig_node("signature-2", Some("md5,rsa2048"), Some(b"x"));
        let other = sig_node("signature-3", Some("sha256,ecdsa256"), Some(b"x"));

        let sigs = parse_signatures(&[&pgp, &bad_hash, &other]).unwrap();
        assert_eq!(sigs.len(), 1);
        assert!(matches!(&sigs[0], Signature::Pgp { name, signer, .. }
            if name == "signature-1" && signer.is_empty()));

        assert!(matches!(
            parse_signatures(&[&bad_hash, &other]),
            Err(FitError::NoValidSignatures)
        ));
    }

    #[test]
    fn test_empty_input_has_no_valid_signatures() {
        assert!(matches!(parse_signatures(&[]), Err(FitError::NoValidSignatures)));
    }

    #[test]
    fn test_too_many_nodes_rejected() {
        let node = sig_node("signature", Some("pgp"), Some(b"x"));
        let nodes = vec![&node; MAX_SIGNATURE_NODES + 1];
        assert!(matches!(
            parse_signatures(&nodes),
            Err(FitError::TooManySignatures { count, max })
                if count == MAX_SIGNATURE_NODES + 1 && max == MAX_SIGNATURE_NODES
        ));
        assert!(parse_signatures(&nodes[..MAX_SIGNATURE_NODES]).is_ok());
    }

    #[test]
    fn test_rsa_right_and_wrong_key() {
        let sig = rsa_kernel_sig();
        assert_eq!(sig.verify(KERNEL0, &ring(&[("rsa0", RSA0)])).unwrap(), "rsa0");
        assert_eq!(
            sig.verify(KERNEL0, &ring(&[("rsa1", RSA1), ("rsa0", RSA0)])).unwrap(),
            "rsa0"
        );
        assert!(matches!(
            sig.verify(KERNEL0, &ring(&[("rsa1", RSA1)])),
            Err(FitError::WrongSigner { key_ring }) if key_ring.contains("rsa1")
        ));
        assert!(matches!(
            sig.verify(RAMDISK0, &ring(&[("rsa0", RSA0)])),
            Err(FitError::WrongSigner { .. })
        ));
    }

    #[test]
    fn test_pgp_wrong_key_is_unsigned() {
        let node = sig_node(
            "signature-1",
            Some("pgp"),
            Some(include_bytes!("../testdata/kernel0.key0.pgp.sig")),
        );
        let sigs = parse_signatures(&[&node]).unwrap();
        assert_eq!(sigs[0].verify(KERNEL0, &ring(&[("key0", KEY0)])).unwrap(), "key0");
        assert!(matches!(
            sigs[0].verify(KERNEL0, &ring(&[("key1", KEY1)])),
            Err(FitError::Unsigned { path, .. }) if path == "signature-1"
        ));
    }

    #[test]
    fn test_first_success_wins_and_last_error_reported() {
        let pgp_key1 = sig_node(
            "signature-1",
            Some("pgp"),
            Some(include_bytes!("../testdata/ramdisk0.key1.pgp.sig")),
        );
        let rsa1 = sig_node(
            "signature-2",
            Some("sha512,rsa2048"),
            Some(include_bytes!("../testdata/ramdisk0.rsa1.sha512.sig")),
        );
        let sigs = parse_signatures(&[&pgp_key1, &rsa1]).unwrap();

        let checked = verify_signatures(&sigs, RAMDISK0, Some(&ring(&[("rsa1", RSA1)])));
        assert!(checked.is_verified());

        let checked = verify_signatures(&sigs, RAMDISK0.to_vec(), Some(&ring(&[("key0", KEY0)])));
        assert!(matches!(checked.error(), Some(FitError::WrongSigner { .. })));
        assert_eq!(checked.data().as_slice(), RAMDISK0);
    }

    #[test]
    fn test_no_key_ring_or_no_signatures() {
        let sigs = vec![rsa_kernel_sig()];
        let checked = verify_signatures(&sigs, KERNEL0, None);
        assert!(matches!(checked.error(), Some(FitError::NoKeyRing)));

        let checked = verify_signatures(&[], KERNEL0, Some(&ring(&[("rsa0", RSA0)])));
        assert!(matches!(checked.error(), Some(FitError::NoValidSignatures)));
    }

    #[test]
    fn test_verification_is_idempotent() {
        let sigs = vec![rsa_kernel_sig()];
        let r = ring(&[("rsa0", RSA0)]);
        for _ in 0..3 {
            assert!(verify_signatures(&sigs, KERNEL0, Some(&r)).is_verified());
        }
        let r = ring(&[("rsa1", RSA1)]);
        for _ in 0..3 {
            assert!(!verify_signatures(&sigs, KERNEL0, Some(&r)).is_verified());
        }
    }
}
