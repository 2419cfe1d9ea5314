//! Graph deltas: the unit of change between extraction and the graph store.
//!
//! A [`GraphDelta`] is built once through [`DeltaBuilder`] and never mutated
//! afterwards. Identity inside a delta follows the store's identity rules:
//! nodes by natural key (and label), relationships by
//! `(from_key, relation_type, to_key)`. Repeated specs are merged, later
//! properties winning.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// A scalar property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl PropertyValue {
    /// Whether this value equals `text` as written in a URL or on a command
    /// line. Numbers compare numerically, booleans as `true`/`false`.
    pub fn matches_text(&self, text: &str) -> bool {
        match self {
            PropertyValue::Text(v) => v == text,
            PropertyValue::Int(v) => text.trim().parse::<i64>().map_or(false, |t| t == *v),
            PropertyValue::Float(v) => text.trim().parse::<f64>().map_or(false, |t| t == *v),
            PropertyValue::Bool(v) => text.parse::<bool>().map_or(false, |t| t == *v),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        PropertyValue::Int(v as i64)
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

/// Overwrite `target` with every field of `incoming` (last write wins per field).
pub fn merge_properties(target: &mut Properties, incoming: &Properties) {
    for (name, value) in incoming {
        target.insert(name.clone(), value.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub natural_key: String,
    pub label: String,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipSpec {
    pub from_key: String,
    pub to_key: String,
    pub relation_type: String,
    #[serde(default)]
    pub properties: Properties,
}

impl RelationshipSpec {
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.from_key, &self.relation_type, &self.to_key)
    }
}

/// Serialized form accepted from callers; normalized through [`DeltaBuilder`].
#[derive(Debug, Default, Deserialize)]
struct DeltaParts {
    #[serde(default)]
    nodes: Vec<NodeSpec>,
    #[serde(default)]
    relationships: Vec<RelationshipSpec>,
}

impl From<DeltaParts> for GraphDelta {
    fn from(parts: DeltaParts) -> Self {
        let mut builder = DeltaBuilder::new();
        for node in parts.nodes {
            builder.add_node(node);
        }
        for rel in parts.relationships {
            builder.add_relationship(rel);
        }
        builder.build()
    }
}

/// Nodes and relationships to upsert in one transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "DeltaParts")]
pub struct GraphDelta {
    nodes: Vec<NodeSpec>,
    relationships: Vec<RelationshipSpec>,
}

impl GraphDelta {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> DeltaBuilder {
        DeltaBuilder::new()
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn relationships(&self) -> &[RelationshipSpec] {
        &self.relationships
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }

    pub fn node(&self, natural_key: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.natural_key == natural_key)
    }

    /// Structural checks that do not need the store.
    ///
    /// Endpoint resolution of relationships is left to the store, because an
    /// endpoint may already exist there.
    pub fn validate(&self) -> Result<(), IngestError> {
        let mut labels: HashMap<&str, &str> = HashMap::new();
        for node in &self.nodes {
            if node.natural_key.trim().is_empty() {
                return Err(violation("node natural_key must not be empty"));
            }
            if !is_identifier(&node.label) {
                return Err(violation(format!(
                    "invalid label '{}' for node {}",
                    node.label, node.natural_key
                )));
            }
            if let Some(previous) = labels.insert(&node.natural_key, &node.label) {
                if previous != node.label {
                    return Err(violation(format!(
                        "natural key {} used with labels {} and {}",
                        node.natural_key, previous, node.label
                    )));
                }
            }
            validate_properties(&node.properties, &node.natural_key)?;
        }
        for rel in &self.relationships {
            if rel.from_key.trim().is_empty() || rel.to_key.trim().is_empty() {
                return Err(violation("relationship endpoints must not be empty"));
            }
            if !is_identifier(&rel.relation_type) {
                return Err(violation(format!(
                    "invalid relation type '{}'",
                    rel.relation_type
                )));
            }
            validate_properties(&rel.properties, &rel.relation_type)?;
        }
        Ok(())
    }
}

fn violation(message: impl Into<String>) -> IngestError {
    IngestError::ConstraintViolation(message.into())
}

fn validate_properties(props: &Properties, owner: &str) -> Result<(), IngestError> {
    for (name, value) in props {
        if name.trim().is_empty() {
            return Err(violation(format!("empty property name on {}", owner)));
        }
        if let PropertyValue::Float(f) = value {
            if !f.is_finite() {
                return Err(violation(format!(
                    "property {} on {} is not a finite number",
                    name, owner
                )));
            }
        }
    }
    Ok(())
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Accumulates specs and merges duplicates.
#[derive(Debug, Default)]
pub struct DeltaBuilder {
    nodes: Vec<NodeSpec>,
    node_index: HashMap<(String, String), usize>,
    relationships: Vec<RelationshipSpec>,
    rel_index: HashMap<(String, String, String), usize>,
}

impl DeltaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node<I, K, V>(mut self, natural_key: &str, label: &str, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        self.add_node(NodeSpec {
            natural_key: natural_key.to_string(),
            label: label.to_string(),
            properties: collect_properties(properties),
        });
        self
    }

    pub fn relationship<I, K, V>(
        mut self,
        from_key: &str,
        relation_type: &str,
        to_key: &str,
        properties: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        self.add_relationship(RelationshipSpec {
            from_key: from_key.to_string(),
            to_key: to_key.to_string(),
            relation_type: relation_type.to_string(),
            properties: collect_properties(properties),
        });
        self
    }

    pub fn add_node(&mut self, spec: NodeSpec) {
        let id = (spec.natural_key.clone(), spec.label.clone());
        match self.node_index.get(&id) {
            Some(&i) => merge_properties(&mut self.nodes[i].properties, &spec.properties),
            None => {
                self.node_index.insert(id, self.nodes.len());
                self.nodes.push(spec);
            }
        }
    }

    pub fn add_relationship(&mut self, spec: RelationshipSpec) {
        let id = (
            spec.from_key.clone(),
            spec.relation_type.clone(),
            spec.to_key.clone(),
        );
        match self.rel_index.get(&id) {
            Some(&i) => merge_properties(&mut self.relationships[i].properties, &spec.properties),
            None => {
                self.rel_index.insert(id, self.relationships.len());
                self.relationships.push(spec);
            }
        }
    }

    pub fn build(self) -> GraphDelta {
        GraphDelta {
            nodes: self.nodes,
            relationships: self.relationships,
        }
    }
}

fn collect_properties<I, K, V>(properties: I) -> Properties
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<PropertyValue>,
{
    properties
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Outcome of applying one delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReport {
    pub nodes_created: u64,
    pub nodes_updated: u64,
    pub relationships_created: u64,
    pub relationships_updated: u64,
    /// Transaction attempts the writer needed (conflict retries included).
    pub attempts: u32,
}

/// Empty property list, for specs without properties.
pub fn no_props() -> Vec<(String, PropertyValue)> {
    Vec::new()
}
