use sha2::{Digest, Sha256};

const HASH_LEN: usize = 8;

/// Short identity hash for a pod: first 8 hex chars of
/// SHA-256("<namespace>/<pod_name>/<container_name>").
pub fn pod_hash(namespace: &str, pod_name: &str, container_name: &str) -> String {
    short_hash(&format!("{}/{}/{}", namespace, pod_name, container_name))
}

/// Short identity hash for a snapshot id.
pub fn snapshot_hash(id: &str) -> String {
    short_hash(id)
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..HASH_LEN].to_string()
}
