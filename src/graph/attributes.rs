use crate::error::{Result, SybilError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{Display, EnumString};

pub type AttrMap = BTreeMap<String, AttrValue>;

/// Attribute attached to a graph node or edge.
///
/// The set of variants is closed so every value has a total conversion to and from
/// the scalar-only persisted format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Integer(i64),
    Float(f64),
    Text(String),
    TextList(Vec<String>),
}

/// Declared type of an attribute key in a persisted graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttrKind {
    Integer,
    Float,
    Text,
    TextList,
}

/// Value as it is written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    pub fn kind(&self) -> AttrKind {
        match self {
            AttrValue::Integer(_) => AttrKind::Integer,
            AttrValue::Float(_) => AttrKind::Float,
            AttrValue::Text(_) => AttrKind::Text,
            AttrValue::TextList(_) => AttrKind::TextList,
        }
    }

    /// Lists become their canonical JSON text. Non-finite floats have no portable form.
    pub fn to_scalar(&self, key: &str) -> Result<Scalar> {
        match self {
            AttrValue::Integer(value) => Ok(Scalar::Integer(*value)),
            AttrValue::Float(value) if value.is_finite() => Ok(Scalar::Float(*value)),
            AttrValue::Float(value) => {
                Err(SybilError::Serialization { key: key.to_string(), reason: format!("non-finite float {value}") })
            }
            AttrValue::Text(value) => Ok(Scalar::Text(value.clone())),
            AttrValue::TextList(values) => serde_json::to_string(values)
                .map(Scalar::Text)
                .map_err(|e| SybilError::Serialization { key: key.to_string(), reason: e.to_string() }),
        }
    }

    pub fn from_scalar(kind: AttrKind, scalar: Scalar, key: &str) -> Result<Self> {
        let mismatch = |found: &Scalar| SybilError::GraphLoad {
            path: String::new(),
            reason: format!("attribute `{key}` declared {kind} but found {found:?}"),
        };
        match (kind, scalar) {
            (AttrKind::Integer, Scalar::Integer(value)) => Ok(AttrValue::Integer(value)),
            (AttrKind::Float, Scalar::Float(value)) => Ok(AttrValue::Float(value)),
            // integral floats may come back as integers
            (AttrKind::Float, Scalar::Integer(value)) => Ok(AttrValue::Float(value as f64)),
            (AttrKind::Text, Scalar::Text(value)) => Ok(AttrValue::Text(value)),
            (AttrKind::TextList, Scalar::Text(value)) => serde_json::from_str(&value)
                .map(AttrValue::TextList)
                .map_err(|e| SybilError::GraphLoad { path: String::new(), reason: format!("attribute `{key}`: {e}") }),
            (_, other) => Err(mismatch(&other)),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AttrValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(value) => Some(*value),
            AttrValue::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text_list(&self) -> Option<&[String]> {
        match self {
            AttrValue::TextList(values) => Some(values),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_list_round_trip() {
        let value = AttrValue::TextList(vec!["0xaa".to_string(), "0xbb".to_string()]);
        let scalar = value.to_scalar("members").unwrap();
        assert_eq!(scalar, Scalar::Text("[\"0xaa\",\"0xbb\"]".to_string()));
        assert_eq!(AttrValue::from_scalar(AttrKind::TextList, scalar, "members").unwrap(), value);
    }

    #[test]
    fn test_non_finite_float_is_rejected() {
        let result = AttrValue::Float(f64::NAN).to_scalar("score");
        assert!(matches!(result, Err(SybilError::Serialization { .. })));
    }

    #[test]
    fn test_kind_mismatch_is_load_error() {
        let result = AttrValue::from_scalar(AttrKind::Integer, Scalar::Text("x".into()), "count");
        assert!(matches!(result, Err(SybilError::GraphLoad { .. })));
    }

    #[test]
    fn test_integral_float_survives_json() {
        let scalar = AttrValue::Float(10.0).to_scalar("mean").unwrap();
        let json = serde_json::to_string(&scalar).unwrap();
        let back: Scalar = serde_json::from_str(&json).unwrap();
        assert_eq!(AttrValue::from_scalar(AttrKind::Float, back, "mean").unwrap(), AttrValue::Float(10.0));
    }
}
