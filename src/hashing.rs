//! Hashing System - SHA-256 for Recipes and Plans
//!
//! Same recipe, same hash. Field order in the source file never matters.

use sha2::{Sha256, Digest};
use serde::Serialize;
use serde_json::{Value, to_string};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    to_string(&sort_value(&v))
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

/// Content hash of a recipe
pub fn compute_recipe_hash<T: Serialize>(recipe: &T) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(recipe)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// job_hash = sha256(recipe_id:recipe_version:canonical_payload:engine_version)
pub fn compute_job_hash(
    recipe_id: &str,
    recipe_version: &str,
    payload: &impl Serialize,
    engine_version: &str,
) -> Result<String, serde_json::Error> {
    let canonical_payload = canonical_json(payload)?;
    let combined = format!(
        "{}:{}:{}:{}",
        recipe_id, recipe_version, canonical_payload, engine_version
    );
    Ok(sha256_hex(combined.as_bytes()))
}

/// Hash of the rendered build files, exactly as they reach the engine.
///
/// Separates the two files so moving a line from one to the other changes the hash.
pub fn compute_render_hash(dockerfile: &str, dockerignore: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [dockerfile, dockerignore] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub(crate) mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}
