//! Canonical JSON encoding and run digests.
//!
//! All persisted payloads and digest inputs use the same canonical form:
//! object keys sorted lexicographically at every level, no insignificant
//! whitespace, standard JSON number formatting. Two serializations of the
//! same data are byte-identical, which is what makes run digests portable
//! across stores and platforms.

use crate::core::error::PortunusError;
use crate::core::event::{Event, Run};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// Identifier of the digest recipe, recorded alongside every digest.
pub const DIGEST_METHOD_ID: &str = "sha256/canonical-json/v1";

/// Provenance of a run's content: the digest and how it was computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub digest: String,
    pub method_id: String,
}

/// Serialize a JSON value canonically: sorted keys, compact separators.
pub fn canonical_string(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

fn write_canonical(out: &mut String, value: &JsonValue) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json Display for strings handles escaping.
                out.push_str(&JsonValue::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(out, &map[*key]);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Digest over `canonical(run)` followed by `canonical(events)`.
///
/// Events must already be in ascending `seq` order; the store and export
/// paths guarantee this.
pub fn run_digest(run: &Run, events: &[Event]) -> Result<String, PortunusError> {
    let run_value = serde_json::to_value(run)
        .map_err(|e| PortunusError::Config(format!("Unable to serialize run: {e}")))?;
    let events_value = serde_json::to_value(events)
        .map_err(|e| PortunusError::Config(format!("Unable to serialize events: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(canonical_string(&run_value).as_bytes());
    hasher.update(canonical_string(&events_value).as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn provenance_for(run: &Run, events: &[Event]) -> Result<Provenance, PortunusError> {
    Ok(Provenance {
        digest: run_digest(run, events)?,
        method_id: DIGEST_METHOD_ID.to_string(),
    })
}
