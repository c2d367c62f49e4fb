//! Structural cache keys

use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::Xxh3;

use crate::payload::Payload;
use crate::registry::ModelId;

/// Fingerprint of (model id, input content)
///
/// Two keys built from distinct allocations with identical contents compare
/// and hash equal. The hash is computed once at construction.
#[derive(Debug, Clone)]
pub struct CacheKey {
    model_id: ModelId,
    input: Payload,
    fingerprint: u64,
}

impl CacheKey {
    pub fn new(model_id: ModelId, input: &Payload) -> Self {
        let fingerprint = fingerprint(&model_id, input);
        Self {
            model_id,
            input: input.clone(),
            fingerprint,
        }
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
            && self.model_id == other.model_id
            && self.input.content_eq(&other.input)
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fingerprint);
    }
}

fn fingerprint(model_id: &ModelId, input: &Payload) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(model_id.as_str().as_bytes());
    hasher.update(&[0xff, input.kind() as u8]);
    match input {
        Payload::Floats(values) => {
            for v in values.iter() {
                hasher.update(&v.to_bits().to_le_bytes());
            }
        }
        Payload::Bytes(bytes) => hasher.update(bytes),
        Payload::Text(text) => hasher.update(text.as_bytes()),
        Payload::Structured(value) => hasher.update(value.to_string().as_bytes()),
    }
    hasher.digest()
}
