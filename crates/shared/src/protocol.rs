use serde::{Deserialize, Serialize};

use crate::{
    domain::{FactoryId, Root},
    error::ApiError,
};

/// A factory bound as it arrives on the wire: clients send either numbers or
/// the raw contents of a text input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BoundInput {
    Int(i64),
    Float(f64),
    Text(String),
}

impl BoundInput {
    /// Integer-prefix coercion: leading whitespace and an optional sign are
    /// accepted, then as many decimal digits as are present. Anything after
    /// the digits is ignored. Returns `None` when no digits can be read.
    /// Out-of-range magnitudes saturate at the `i64` limits.
    pub fn coerce(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Float(value) if value.is_finite() => Some(value.trunc() as i64),
            Self::Float(_) => None,
            Self::Text(raw) => parse_int_prefix(raw),
        }
    }
}

impl From<i64> for BoundInput {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for BoundInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

fn parse_int_prefix(raw: &str) -> Option<i64> {
    let trimmed = raw.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let mut seen_digit = false;
    let mut value: i64 = 0;
    for byte in digits.bytes().take_while(u8::is_ascii_digit) {
        seen_digit = true;
        let digit = i64::from(byte - b'0');
        value = value
            .checked_mul(10)
            .and_then(|v| {
                if negative {
                    v.checked_sub(digit)
                } else {
                    v.checked_add(digit)
                }
            })
            .unwrap_or(if negative { i64::MIN } else { i64::MAX });
    }

    seen_digit.then_some(value)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFactoryRequest {
    pub name: String,
    pub lower_bound: BoundInput,
    pub upper_bound: BoundInput,
    pub num_children: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditFactoryRequest {
    pub id: FactoryId,
    pub name: String,
    pub lower_bound: BoundInput,
    pub upper_bound: BoundInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFactoryRequest {
    pub id: FactoryId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenFactoryNodesRequest {
    pub id: FactoryId,
    pub num_children: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientRequest {
    AddFactory(AddFactoryRequest),
    EditFactory(EditFactoryRequest),
    DeleteFactory(DeleteFactoryRequest),
    RegenFactoryNodes(RegenFactoryNodesRequest),
}

impl ClientRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddFactory(_) => "addFactory",
            Self::EditFactory(_) => "editFactory",
            Self::DeleteFactory(_) => "deleteFactory",
            Self::RegenFactoryNodes(_) => "regenFactoryNodes",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ServerEvent {
    Tree { root: Root },
    ValidationError(String),
    Error(ApiError),
}
