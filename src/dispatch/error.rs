//! Structured dispatch errors.
//!
//! Every failure the dispatcher reports is a plain `{code, message, data}`
//! object, so it serializes across the transport boundary unchanged and can
//! be embedded verbatim as a batch item result. The codes are fixed
//! contract values, not HTTP statuses, though they rhyme with them.

use serde::Serialize;
use serde_json::{Value, json};

/// Missing or malformed action/parameters.
pub const CODE_INVALID_REQUEST: u16 = 400;
/// Action name outside the supported set.
pub const CODE_UNKNOWN_ACTION: u16 = 404;
/// Action name recognized but absent from the handler registry; distinct
/// from `CODE_UNKNOWN_ACTION` so registry drift is diagnosable.
pub const CODE_UNKNOWN_HANDLER: u16 = 405;
/// Mutation refused by the gate. Reported as a soft result, not an error,
/// so batches keep going; the code appears inside that result object.
pub const CODE_MUTATION_BLOCKED: u16 = 423;
/// Unexpected internal failure (filesystem, serialization).
pub const CODE_INTERNAL: u16 = 500;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DispatchError {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

pub type DispatchResult = Result<Value, DispatchError>;

impl DispatchError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: CODE_INVALID_REQUEST,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn unknown_action(action: &str) -> Self {
        Self {
            code: CODE_UNKNOWN_ACTION,
            message: format!("unknown action '{action}'"),
            data: json!({ "action": action }),
        }
    }

    pub fn unknown_handler(action: &str) -> Self {
        Self {
            code: CODE_UNKNOWN_HANDLER,
            message: format!("no handler registered for action '{action}'"),
            data: json!({ "action": action }),
        }
    }

    pub fn internal(err: &anyhow::Error) -> Self {
        Self {
            code: CODE_INTERNAL,
            message: format!("{err:#}"),
            data: Value::Null,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "code": self.code,
            "message": self.message,
            "data": self.data,
        })
    }
}

/// Soft result for a gated mutation; batches continue past it.
pub fn mutation_blocked(reason: &str) -> Value {
    json!({
        "error": "mutation_blocked",
        "code": CODE_MUTATION_BLOCKED,
        "reason": reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_serialize_as_plain_objects() {
        let err = DispatchError::unknown_action("bogus");
        let value = err.to_value();
        assert_eq!(value["code"], CODE_UNKNOWN_ACTION);
        assert_eq!(value["data"]["action"], "bogus");
        assert!(value["message"].as_str().unwrap().contains("bogus"));
    }

    #[test]
    fn codes_are_distinct() {
        let codes = [
            CODE_INVALID_REQUEST,
            CODE_UNKNOWN_ACTION,
            CODE_UNKNOWN_HANDLER,
            CODE_MUTATION_BLOCKED,
            CODE_INTERNAL,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in codes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
