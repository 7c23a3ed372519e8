// Node identity and id derivation.
//
// A node id is the truncated sha256 of a stable seed (host + executable by
// default). Plugin ids are derived from the same base so a plugin keeps its
// id across restarts of the same installation.

use std::collections::HashMap;

use callscript::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const ID_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct NodeIdentity {
    id: String,
    hash_base: String,
}

impl NodeIdentity {
    pub fn from_seed(seed: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        let id = format!("{:x}", hasher.finalize())[..ID_LEN].to_string();
        Self {
            id,
            hash_base: seed.to_string(),
        }
    }

    /// Stable per-installation identity unless a seed override is given.
    pub fn derive(seed_override: Option<&str>) -> Self {
        if let Some(seed) = seed_override {
            return Self::from_seed(seed);
        }
        let exe = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let host = std::env::var("HOSTNAME").unwrap_or_default();
        let user = std::env::var("USER").unwrap_or_default();
        Self::from_seed(&format!("{}|{}|{}", host, user, exe))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deterministic plugin id for a locally owned plugin.
    pub fn plugin_id(&self, plugin_name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.hash_base.as_bytes());
        hasher.update(plugin_name.as_bytes());
        format!("{:x}", hasher.finalize())[..ID_LEN].to_string()
    }
}

/// Request id from a call signature.
///
/// The normal form hashes function name and arguments together with a random
/// component, so identical concurrent calls still get distinct ids. Debug
/// mode trades that for a human-readable prefix.
pub fn request_id(
    function: &str,
    args: &[Value],
    kwargs: &HashMap<String, Value>,
    debug: bool,
) -> String {
    let mut rendered = String::from(function);
    for arg in args {
        rendered.push_str(&arg.to_string());
    }
    if args.is_empty() {
        rendered.push_str("NOARGS");
    }
    let mut keys: Vec<&String> = kwargs.keys().collect();
    keys.sort();
    for key in keys {
        rendered.push_str(key);
        rendered.push_str(&kwargs[key].to_string());
    }
    if kwargs.is_empty() {
        rendered.push_str("NOKWARGS");
    }

    if debug {
        let short: String = rendered.chars().take(24).collect();
        return format!("{}:{}", short, &Uuid::new_v4().simple().to_string()[..4]);
    }

    let mut hasher = Sha256::new();
    hasher.update(rendered.as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    format!("{:x}", hasher.finalize())[..2 * ID_LEN].to_string()
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn hex_decode(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_ids_are_stable_and_distinct() {
        let node = NodeIdentity::from_seed("test-node");
        assert_eq!(node.id().len(), ID_LEN);
        assert_eq!(node.plugin_id("math"), node.plugin_id("math"));
        assert_ne!(node.plugin_id("math"), node.plugin_id("data"));
        assert_ne!(
            node.plugin_id("math"),
            NodeIdentity::from_seed("other").plugin_id("math")
        );
    }

    #[test]
    fn request_ids_do_not_collide_for_identical_calls() {
        let args = vec![Value::Int(1)];
        let kwargs = HashMap::new();
        let a = request_id("f", &args, &kwargs, false);
        let b = request_id("f", &args, &kwargs, false);
        assert_ne!(a, b);
    }

    #[test]
    fn debug_request_ids_are_readable() {
        let id = request_id("double", &[Value::Int(21)], &HashMap::new(), true);
        assert!(id.starts_with("double21"));
    }

    #[test]
    fn hex_roundtrip() {
        let bytes = vec![0u8, 16, 255];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
        assert!(hex_decode("abc").is_none());
    }
}
