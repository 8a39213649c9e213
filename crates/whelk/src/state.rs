//! Interpreter state capture and restore.
//!
//! Top-level variables survive across invocations by round-tripping through a
//! versioned JSON image. The image is opaque to callers: it is produced after
//! a run, threaded back in before the next one, and never inspected in
//! between. Encoding is whole-or-nothing: a single unserializable variable
//! fails the dump rather than silently dropping it.

use rhai::{Dynamic, Scope};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version tag written into every state image. Bumped whenever the image
/// layout changes incompatibly.
pub const STATE_VERSION: u32 = 1;

/// A state image failed to encode or decode.
#[derive(Debug, Error)]
pub enum StateError {
    /// The blob is not a well-formed state image.
    #[error("malformed state image: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The blob was produced by an incompatible layout version.
    #[error("state image version {found} is not supported (expected {expected})")]
    VersionMismatch {
        /// Version found in the blob.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },
    /// A variable's value could not be converted.
    #[error("variable `{name}` cannot be carried across runs: {reason}")]
    Value {
        /// The variable's name.
        name: String,
        /// Why the conversion failed.
        reason: String,
    },
}

/// Serialized form of one top-level variable.
#[derive(Debug, Serialize, Deserialize)]
struct VarSlot {
    name: String,
    constant: bool,
    value: serde_json::Value,
}

/// Serialized form of a whole interpreter scope.
#[derive(Debug, Serialize, Deserialize)]
struct StateImage {
    version: u32,
    vars: Vec<VarSlot>,
}

/// Encode every top-level variable of `scope` into a state blob.
pub fn encode_scope(scope: &Scope<'_>) -> Result<String, StateError> {
    let mut vars = Vec::with_capacity(scope.len());
    for (name, constant, value) in scope.iter() {
        // A function pointer would serialize to its bare name and come back
        // as a plain string, silently changing the variable's type. Fail the
        // dump so the caller's carry-forward fallback kicks in.
        if value.is::<rhai::FnPtr>() {
            return Err(StateError::Value {
                name: name.to_string(),
                reason: "function pointers are not serializable".to_string(),
            });
        }
        let json = serde_json::to_value(&value).map_err(|e| StateError::Value {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        vars.push(VarSlot {
            name: name.to_string(),
            constant,
            value: json,
        });
    }
    let image = StateImage {
        version: STATE_VERSION,
        vars,
    };
    Ok(serde_json::to_string(&image)?)
}

/// Decode a state blob back into an interpreter scope.
pub fn decode_scope(blob: &str) -> Result<Scope<'static>, StateError> {
    let image: StateImage = serde_json::from_str(blob)?;
    if image.version != STATE_VERSION {
        return Err(StateError::VersionMismatch {
            found: image.version,
            expected: STATE_VERSION,
        });
    }
    let mut scope = Scope::new();
    for slot in image.vars {
        let value: Dynamic =
            rhai::serde::to_dynamic(&slot.value).map_err(|e| StateError::Value {
                name: slot.name.clone(),
                reason: e.to_string(),
            })?;
        if slot.constant {
            scope.push_constant_dynamic(slot.name, value);
        } else {
            scope.push_dynamic(slot.name, value);
        }
    }
    Ok(scope)
}
