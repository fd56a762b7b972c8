use sha2::{Digest, Sha256};

pub const ARTIFACT_EXTENSION: &str = "mind";

/// Deterministic storage path for a compiled artifact:
/// `{prefix}/{sanitized_id}--{hash8(bytes)}.mind`.
///
/// Uploading identical bytes for the same job lands on the same object.
pub fn artifact_object_path(prefix: &str, job_id: &str, artifact: &[u8]) -> String {
    let name = format!(
        "{}--{}.{ARTIFACT_EXTENSION}",
        sanitize_id(job_id),
        short_hash(artifact)
    );
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name
    } else {
        format!("{prefix}/{name}")
    }
}

/// Keeps ASCII alphanumerics and `-`; any other run of characters becomes one `_`.
fn sanitize_id(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_underscore = false;
    for c in input.chars() {
        let keep = c.is_ascii_alphanumeric() || c == '-';
        if keep {
            out.push(c);
            prev_underscore = false;
        } else if !prev_underscore {
            out.push('_');
            prev_underscore = true;
        }
    }
    let mut trimmed = out.trim_matches('_').to_string();
    if trimmed.is_empty() {
        trimmed = "target".to_string();
    }
    trimmed.truncate(64);
    trimmed
}

fn short_hash(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    let mut hex = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        use std::fmt::Write;
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}
