use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Stable identity of a selectable strategy.
///
/// Ordering is lexicographic; ties in selection go to the lowest id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArmId(String);

impl ArmId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArmId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A selected strategy plus the parameters active at selection time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    pub id: ArmId,
    pub params: Map<String, JsonValue>,
}

impl Arm {
    pub fn new(id: ArmId, params: Map<String, JsonValue>) -> Self {
        Self { id, params }
    }

    /// JSON form stored in `params_json` columns.
    pub fn params_json(&self) -> JsonValue {
        JsonValue::Object(self.params.clone())
    }
}
