pub fn u8s_from_str(input: &str) -> [u8; 32] {
    blake3::hash(input.as_bytes()).into()
}

/// Derives an independent child seed for a named consumer. Adding a consumer
/// never shifts the seeds of the others.
pub fn derive_seed(seed: &[u8; 32], label: &str) -> [u8; 32] {
    blake3::keyed_hash(seed, label.as_bytes()).into()
}
