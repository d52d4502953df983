//! In-memory annotation graph
//!
//! The storage core treats the graph mostly as an opaque value: it needs to
//! serialize it, read its schema generation and remember which on-disk version
//! it was loaded from. The annotation content itself (layers, spans, features)
//! is produced and interpreted by the rest of the platform.

use std::collections::BTreeMap;
use serde::ser::{Error as _, SerializeStruct};
use serde::{Deserialize, Serialize, Serializer};
use crate::types::storage::FileVersion;

/// Identifier of an annotation within its graph
pub type AnnotationId = u64;

/// Feature value attached to an annotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    /// Boolean flag
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value; must be finite to be persisted
    Float(#[serde(serialize_with = "serialize_finite")] f64),
    /// Free text or tag
    Text(String),
    /// Link to another annotation in the same graph
    Ref(AnnotationId),
}

/// One span annotation on a layer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Annotation {
    /// Identifier, unique within the graph
    pub id: AnnotationId,
    /// Layer (annotation type) name
    pub layer: String,
    /// Begin character offset
    pub begin: u32,
    /// End character offset (exclusive)
    pub end: u32,
    /// Feature values by feature name
    pub features: BTreeMap<String, FeatureValue>,
}

/// Bookkeeping that is not part of the annotation content
#[derive(Debug, Clone, Default)]
pub struct GraphMetadata {
    /// On-disk version this graph was loaded from or last written as
    pub version: Option<FileVersion>,
}

/// All annotations one data owner holds over one document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnotationGraph {
    schema_generation: u64,
    next_id: AnnotationId,
    annotations: Vec<Annotation>,
    #[serde(skip)]
    metadata: GraphMetadata,
}

// A span that ends before it begins has no valid encoding. Rejecting it here
// means encoders fail part-way through the stream, like any other
// serialization failure would.
impl Serialize for Annotation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.end < self.begin {
            return Err(S::Error::custom(format!(
                "annotation {} on layer '{}' ends at {} before it begins at {}",
                self.id, self.layer, self.end, self.begin
            )));
        }
        let mut state = serializer.serialize_struct("Annotation", 5)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("layer", &self.layer)?;
        state.serialize_field("begin", &self.begin)?;
        state.serialize_field("end", &self.end)?;
        state.serialize_field("features", &self.features)?;
        state.end()
    }
}

// JSON has no encoding for NaN or infinity and would write `null`, which no
// longer decodes as a float. Every codec rejects them so files stay portable.
fn serialize_finite<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if !value.is_finite() {
        return Err(S::Error::custom(format!("feature value {} is not a finite number", value)));
    }
    serializer.serialize_f64(*value)
}

impl AnnotationGraph {
    /// Create an empty graph built against the given schema generation
    pub fn new(schema_generation: u64) -> Self {
        Self {
            schema_generation,
            ..Self::default()
        }
    }

    /// Schema generation this graph was built against
    pub fn schema_generation(&self) -> u64 {
        self.schema_generation
    }

    /// Record that the graph now conforms to another schema generation
    pub fn set_schema_generation(&mut self, generation: u64) {
        self.schema_generation = generation;
    }

    /// On-disk version this graph corresponds to, if it has been persisted
    pub fn version(&self) -> Option<&FileVersion> {
        self.metadata.version.as_ref()
    }

    pub(crate) fn set_version(&mut self, version: FileVersion) {
        self.metadata.version = Some(version);
    }

    /// Add a span annotation and return its identifier
    pub fn add_annotation(&mut self, layer: impl Into<String>, begin: u32, end: u32) -> AnnotationId {
        let id = self.next_id;
        self.next_id += 1;
        self.annotations.push(Annotation {
            id,
            layer: layer.into(),
            begin,
            end,
            features: BTreeMap::new(),
        });
        id
    }

    /// Set a feature on an annotation; returns false if the annotation does not exist
    pub fn set_feature(&mut self, id: AnnotationId, name: impl Into<String>, value: FeatureValue) -> bool {
        match self.annotations.iter_mut().find(|a| a.id == id) {
            Some(annotation) => {
                annotation.features.insert(name.into(), value);
                true
            }
            None => false,
        }
    }

    /// Remove an annotation
    pub fn remove_annotation(&mut self, id: AnnotationId) -> Option<Annotation> {
        let index = self.annotations.iter().position(|a| a.id == id)?;
        Some(self.annotations.remove(index))
    }

    /// Look up an annotation
    pub fn annotation(&self, id: AnnotationId) -> Option<&Annotation> {
        self.annotations.iter().find(|a| a.id == id)
    }

    /// All annotations in insertion order
    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Annotations on one layer
    pub fn select<'a>(&'a self, layer: &'a str) -> impl Iterator<Item = &'a Annotation> + 'a {
        self.annotations.iter().filter(move |a| a.layer == layer)
    }

    /// Drop every annotation on a layer; returns how many were removed
    pub fn remove_layer(&mut self, layer: &str) -> usize {
        let before = self.annotations.len();
        self.annotations.retain(|a| a.layer != layer);
        before - self.annotations.len()
    }

    /// Number of annotations
    pub fn len(&self) -> usize {
        self.annotations.len()
    }

    /// True if the graph holds no annotations
    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }
}

/// Content equality; the on-disk version is bookkeeping and not compared.
impl PartialEq for AnnotationGraph {
    fn eq(&self, other: &Self) -> bool {
        self.schema_generation == other.schema_generation
            && self.next_id == other.next_id
            && self.annotations == other.annotations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_ids_are_never_reused() {
        let mut graph = AnnotationGraph::new(1);
        let a = graph.add_annotation("pos", 0, 3);
        graph.remove_annotation(a);
        let b = graph.add_annotation("pos", 4, 7);
        assert_ne!(a, b);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn features_and_layers() {
        let mut graph = AnnotationGraph::new(3);
        let token = graph.add_annotation("token", 0, 5);
        let ne = graph.add_annotation("named-entity", 0, 5);
        assert!(graph.set_feature(ne, "value", FeatureValue::Text("PER".into())));
        assert!(graph.set_feature(ne, "head", FeatureValue::Ref(token)));
        assert!(!graph.set_feature(99, "value", FeatureValue::Bool(true)));

        assert_eq!(graph.select("named-entity").count(), 1);
        assert_eq!(graph.remove_layer("token"), 1);
        assert_eq!(graph.annotation(ne).unwrap().features.len(), 2);
    }

    #[test]
    fn inverted_span_refuses_to_serialize() {
        let mut graph = AnnotationGraph::new(1);
        graph.add_annotation("pos", 0, 3);
        graph.add_annotation("pos", 9, 4);
        let err = serde_json::to_vec(&graph).unwrap_err();
        assert!(err.to_string().contains("ends at 4 before it begins at 9"));
    }

    #[test]
    fn non_finite_features_refuse_to_serialize() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut graph = AnnotationGraph::new(1);
            let id = graph.add_annotation("pos", 0, 3);
            graph.set_feature(id, "score", FeatureValue::Float(value));
            let err = serde_json::to_vec(&graph).unwrap_err();
            assert!(err.to_string().contains("is not a finite number"), "{}", value);
            assert!(bincode::serialize(&graph).is_err(), "{}", value);
        }
    }

    #[test]
    fn equality_ignores_disk_version() {
        let mut a = AnnotationGraph::new(1);
        a.add_annotation("pos", 0, 1);
        let mut b = a.clone();
        b.set_version(FileVersion {
            timestamp: crate::types::storage::Timestamp::from_nanos(5),
            size: 10,
            digest: None,
        });
        assert_eq!(a, b);
    }
}
