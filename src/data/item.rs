//! Items: the units of data flowing along connections

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::ErrorKind;

/// Reference to a binary payload held by the binary data provider
///
/// Items never carry raw bytes across the engine boundary, only this handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryRef {
    /// Provider-specific identifier
    pub id: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub size: u64,
}

/// Provenance link from an output item back to the input item it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairedItem {
    /// Index of the input item on the producing node's input port
    pub item: usize,
    /// Input port of the producing node
    #[serde(default)]
    pub input: usize,
}

impl PairedItem {
    pub fn new(item: usize) -> Self {
        Self { item, input: 0 }
    }

    pub fn on_input(item: usize, input: usize) -> Self {
        Self { item, input }
    }
}

/// Error attached to an item produced by a "continue on fail" node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    /// Node whose invocation failed
    pub node: String,
}

/// One unit of data: a JSON record plus optional binary references and provenance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub json: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub binary: BTreeMap<String, BinaryRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paired_item: Vec<PairedItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl Item {
    /// Build an item from any JSON value; non-objects are wrapped as `{"value": ...}`
    pub fn new(json: Value) -> Self {
        let json = match json {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            json,
            ..Default::default()
        }
    }

    /// Items from a JSON array, or a single item from any other value
    pub fn from_values(values: Value) -> Vec<Self> {
        match values {
            Value::Array(values) => values.into_iter().map(Self::new).collect(),
            Value::Null => Vec::new(),
            other => vec![Self::new(other)],
        }
    }

    pub fn paired_to(mut self, item: usize) -> Self {
        self.paired_item = vec![PairedItem::new(item)];
        self
    }

    pub fn with_pairing(mut self, paired: Vec<PairedItem>) -> Self {
        self.paired_item = paired;
        self
    }

    pub fn with_binary(mut self, key: impl Into<String>, reference: BinaryRef) -> Self {
        self.binary.insert(key.into(), reference);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.json.get(key)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Item JSON as a `Value`, the shape expressions and scripts see
    pub fn json_value(&self) -> Value {
        Value::Object(self.json.clone())
    }

    /// Full item (json + binary) as a `Value`, without provenance
    pub fn to_scope_value(&self) -> Value {
        serde_json::json!({
            "json": self.json,
            "binary": self.binary,
        })
    }
}

/// Output of one invocation: one ordered item list per output port
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeOutput(pub Vec<Vec<Item>>);

impl NodeOutput {
    /// All items on output 0
    pub fn single(items: Vec<Item>) -> Self {
        Self(vec![items])
    }

    pub fn ports(ports: Vec<Vec<Item>>) -> Self {
        Self(ports)
    }

    /// `count` empty ports
    pub fn empty(count: usize) -> Self {
        Self(vec![Vec::new(); count])
    }

    pub fn port(&self, index: usize) -> &[Item] {
        self.0.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn port_count(&self) -> usize {
        self.0.len()
    }

    pub fn item_count(&self) -> usize {
        self.0.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Vec::is_empty)
    }

    /// First port that received any item, falling back to port 0
    pub fn first_non_empty(&self) -> &[Item] {
        self.0
            .iter()
            .find(|port| !port.is_empty())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Grow to at least `count` ports
    pub fn pad_to(&mut self, count: usize) {
        while self.0.len() < count {
            self.0.push(Vec::new());
        }
    }

    /// Append another output port-by-port
    pub fn extend(&mut self, other: NodeOutput) {
        self.pad_to(other.0.len());
        for (port, items) in other.0.into_iter().enumerate() {
            self.0[port].extend(items);
        }
    }
}
