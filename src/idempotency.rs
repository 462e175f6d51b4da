use sha2::{Digest, Sha256};

/// Hex sha256 over a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest over an ordered list of parts joined by `|`.
///
/// Used to fingerprint a run's inputs (sorted Bronze file list) so two manifests can be
/// compared for "same inputs" without listing every file.
pub fn compute_inputs_digest<S: AsRef<str>>(parts: &[S]) -> String {
    let mut s = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            s.push('|');
        }
        s.push_str(part.as_ref());
    }
    sha256_hex(s.as_bytes())
}
