//! Model registry.
//!
//! The registry maps model names to their schemas and owns the relationship
//! edge table derived from them. It is built once through
//! [`RegistryBuilder`] and is read-only afterwards.

use crate::{error::Result, Error, FieldValue, ModelName, Record, RecordRef, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Name under which the primary key is addressed in predicates.
pub const ID_FIELD: &str = "id";

/// Field types supported in schemas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "of", rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Date,
    /// Case of the named enum
    Enum(String),
    /// Primary key of a record of the named model
    Reference(ModelName),
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Date => write!(f, "Date"),
            FieldType::Enum(name) => write!(f, "Enum({name})"),
            FieldType::Reference(model) => write!(f, "Reference({model})"),
        }
    }
}

/// Definition of a field in a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }
}

/// A declared enumeration and its cases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumDef {
    pub name: String,
    pub cases: Vec<String>,
}

impl EnumDef {
    pub fn new<I, S>(name: impl Into<String>, cases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            cases: cases.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, case: &str) -> bool {
        self.cases.iter().any(|c| c == case)
    }
}

/// A secondary index declared on a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub fields: Vec<String>,
}

/// Kind of link between two models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    /// This model holds a foreign key to `target`
    BelongsTo,
    /// One `target` record holds a foreign key to this model
    HasOne,
    /// Many `target` records hold a foreign key to this model
    HasMany,
    /// `target` is the join model whose `foreign_key` points at this model
    ManyToMany,
}

/// A relationship declared on a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub name: String,
    pub kind: RelationKind,
    pub target: ModelName,
    /// Explicit foreign key field; defaults to `<parentModel>Id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
}

impl Relationship {
    pub fn new(name: impl Into<String>, kind: RelationKind, target: impl Into<ModelName>) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            foreign_key: None,
        }
    }

    pub fn belongs_to(name: impl Into<String>, target: impl Into<ModelName>) -> Self {
        Self::new(name, RelationKind::BelongsTo, target)
    }

    pub fn has_one(name: impl Into<String>, target: impl Into<ModelName>) -> Self {
        Self::new(name, RelationKind::HasOne, target)
    }

    pub fn has_many(name: impl Into<String>, target: impl Into<ModelName>) -> Self {
        Self::new(name, RelationKind::HasMany, target)
    }

    pub fn many_to_many(name: impl Into<String>, join_model: impl Into<ModelName>) -> Self {
        Self::new(name, RelationKind::ManyToMany, join_model)
    }

    pub fn with_foreign_key(mut self, field: impl Into<String>) -> Self {
        self.foreign_key = Some(field.into());
        self
    }
}

/// Schema of a single model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSchema {
    /// Model name
    pub name: ModelName,
    /// Wire name of the primary key; the key is not part of `fields`
    pub primary_key: String,
    /// Field definitions
    pub fields: Vec<FieldDef>,
    pub relationships: Vec<Relationship>,
    pub indexes: Vec<IndexDef>,
}

impl ModelSchema {
    /// Create a new model schema keyed by `id`.
    pub fn new(name: impl Into<ModelName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            primary_key: ID_FIELD.to_string(),
            fields,
            relationships: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = field.into();
        self
    }

    pub fn with_relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn with_index<I, S>(mut self, name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes.push(IndexDef {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Look up a field definition.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A parent-to-child link used for cascade deletes and sync ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    /// Model whose records point at the parent
    pub child: ModelName,
    /// Field on `child` holding the parent's key
    pub foreign_key: String,
}

/// Collects models and enums, then derives the immutable registry.
#[derive(Debug, Clone)]
pub struct RegistryBuilder {
    version: SchemaVersion,
    models: Vec<ModelSchema>,
    enums: Vec<EnumDef>,
}

impl RegistryBuilder {
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            models: Vec::new(),
            enums: Vec::new(),
        }
    }

    /// Add a model. Models are kept in declaration order.
    pub fn with_model(mut self, model: ModelSchema) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_enum(mut self, def: EnumDef) -> Self {
        self.enums.push(def);
        self
    }

    /// Validate the declarations and derive the edge table.
    pub fn build(self) -> Result<ModelRegistry> {
        let mut index = HashMap::with_capacity(self.models.len());
        for (i, model) in self.models.iter().enumerate() {
            if index.insert(model.name.clone(), i).is_some() {
                return Err(Error::InvalidSchema(format!(
                    "duplicate model {}",
                    model.name
                )));
            }
        }

        let mut enums = HashMap::with_capacity(self.enums.len());
        for def in self.enums {
            enums.insert(def.name.clone(), def);
        }

        for model in &self.models {
            let mut seen = BTreeSet::new();
            for field in &model.fields {
                if field.name == model.primary_key {
                    return Err(Error::InvalidSchema(format!(
                        "{}.{} shadows the primary key",
                        model.name, field.name
                    )));
                }
                if !seen.insert(field.name.as_str()) {
                    return Err(Error::InvalidSchema(format!(
                        "duplicate field {}.{}",
                        model.name, field.name
                    )));
                }
                match &field.field_type {
                    FieldType::Enum(name) if !enums.contains_key(name) => {
                        return Err(Error::InvalidSchema(format!(
                            "{}.{} uses unknown enum {name}",
                            model.name, field.name
                        )));
                    }
                    FieldType::Reference(target) if !index.contains_key(target) => {
                        return Err(Error::InvalidSchema(format!(
                            "{}.{} references unknown model {target}",
                            model.name, field.name
                        )));
                    }
                    _ => {}
                }
            }
        }

        let mut children: Vec<BTreeSet<Edge>> = vec![BTreeSet::new(); self.models.len()];
        for model in &self.models {
            for rel in &model.relationships {
                let target_idx = *index.get(&rel.target).ok_or_else(|| {
                    Error::InvalidSchema(format!(
                        "{}.{} targets unknown model {}",
                        model.name, rel.name, rel.target
                    ))
                })?;
                let parent_idx = index[&model.name];

                // (parent index, child model, parent model name for the default key)
                let (parent, child, parent_name) = match rel.kind {
                    RelationKind::BelongsTo => (target_idx, &model.name, &rel.target),
                    RelationKind::HasOne | RelationKind::HasMany | RelationKind::ManyToMany => {
                        (parent_idx, &rel.target, &model.name)
                    }
                };
                let foreign_key = rel
                    .foreign_key
                    .clone()
                    .unwrap_or_else(|| default_foreign_key(parent_name));

                let child_schema = &self.models[index[child]];
                if child_schema.field(&foreign_key).is_none() {
                    return Err(Error::InvalidSchema(format!(
                        "{}.{}: {} has no foreign key field {}",
                        model.name, rel.name, child, foreign_key
                    )));
                }

                children[parent].insert(Edge {
                    child: child.clone(),
                    foreign_key,
                });
            }
        }

        let children: Vec<Vec<Edge>> = children.into_iter().map(Vec::from_iter).collect();
        let layers = sync_layers(&self.models, &index, &children);

        Ok(ModelRegistry {
            version: self.version,
            models: self.models,
            index,
            enums,
            children,
            layers,
        })
    }
}

/// Read-only registry of model schemas.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    version: SchemaVersion,
    models: Vec<ModelSchema>,
    index: HashMap<ModelName, usize>,
    enums: HashMap<String, EnumDef>,
    /// Outgoing parent-to-child edges, indexed like `models`
    children: Vec<Vec<Edge>>,
    layers: Vec<Vec<ModelName>>,
}

impl ModelRegistry {
    pub fn builder(version: SchemaVersion) -> RegistryBuilder {
        RegistryBuilder::new(version)
    }

    /// Schema version for snapshot compatibility checks.
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Get a model schema by name.
    pub fn model(&self, name: &str) -> Option<&ModelSchema> {
        self.index.get(name).map(|&i| &self.models[i])
    }

    /// Get a model schema or fail with [`Error::ModelNotFound`].
    pub fn require(&self, name: &str) -> Result<&ModelSchema> {
        self.model(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All models in declaration order.
    pub fn models(&self) -> impl Iterator<Item = &ModelSchema> {
        self.models.iter()
    }

    pub fn enum_def(&self, name: &str) -> Option<&EnumDef> {
        self.enums.get(name)
    }

    /// Edges to the models whose records depend on records of `model`.
    pub fn children_of(&self, model: &str) -> &[Edge] {
        self.index
            .get(model)
            .map(|&i| self.children[i].as_slice())
            .unwrap_or(&[])
    }

    /// Records that `record` points at through its reference fields.
    pub fn parents_of(&self, record: &Record) -> Vec<RecordRef> {
        let Some(schema) = self.model(&record.model) else {
            return Vec::new();
        };
        schema
            .fields
            .iter()
            .filter_map(|field| match &field.field_type {
                FieldType::Reference(target) => record
                    .reference(&field.name)
                    .map(|key| RecordRef::new(target.clone(), key)),
                _ => None,
            })
            .collect()
    }

    /// Models grouped so that every parent appears in an earlier layer than
    /// its children. Models caught in a dependency cycle share the last layer.
    pub fn sync_layers(&self) -> &[Vec<ModelName>] {
        &self.layers
    }

    /// Validate a locally produced record against its model.
    pub fn validate(&self, record: &Record) -> Result<()> {
        let schema = self.require(&record.model)?;

        for field in &schema.fields {
            match record.fields.get(&field.name) {
                None if field.required => {
                    return Err(Error::MissingRequiredField(field.name.clone()))
                }
                None => {}
                Some(value) => self.check_value(&field.name, &field.field_type, value)?,
            }
        }

        if let Some(unknown) = record
            .fields
            .keys()
            .find(|name| schema.field(name).is_none())
        {
            return Err(Error::UnknownField {
                model: schema.name.clone(),
                field: unknown.clone(),
            });
        }

        Ok(())
    }

    /// Decode wire fields of `model` into typed values.
    ///
    /// Fields unknown to the local schema are ignored. With `require_all`
    /// unset, missing required fields are tolerated (tombstone payloads).
    pub fn decode_fields(
        &self,
        model: &str,
        object: &serde_json::Map<String, serde_json::Value>,
        require_all: bool,
    ) -> Result<BTreeMap<String, FieldValue>> {
        let schema = self.require(model)?;
        let mut fields = BTreeMap::new();

        for field in &schema.fields {
            let decoded = match object.get(&field.name) {
                Some(raw) => FieldValue::decode(&field.name, &field.field_type, raw)?,
                None => None,
            };
            match decoded {
                Some(value) => {
                    self.check_value(&field.name, &field.field_type, &value)?;
                    fields.insert(field.name.clone(), value);
                }
                None if field.required && require_all => {
                    return Err(Error::MissingRequiredField(field.name.clone()));
                }
                None => {}
            }
        }

        Ok(fields)
    }

    /// Encode typed fields and the key into the wire object for `model`.
    pub fn encode_fields(
        &self,
        model: &str,
        key: &str,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let schema = self.require(model)?;
        let mut object = serde_json::Map::with_capacity(fields.len() + 1);
        object.insert(
            schema.primary_key.clone(),
            serde_json::Value::String(key.to_string()),
        );
        for (name, value) in fields {
            object.insert(name.clone(), value.to_json());
        }
        Ok(object)
    }

    fn check_value(&self, field: &str, field_type: &FieldType, value: &FieldValue) -> Result<()> {
        if !value.matches_type(field_type) {
            return Err(Error::TypeMismatch {
                field: field.to_string(),
                expected: field_type.to_string(),
                got: value.type_name().to_string(),
            });
        }

        if let (FieldType::Enum(enum_name), FieldValue::Enum(case)) = (field_type, value) {
            let known = self
                .enums
                .get(enum_name)
                .map(|def| def.contains(case))
                .unwrap_or(false);
            if !known {
                return Err(Error::UnknownEnumCase {
                    enum_name: enum_name.clone(),
                    value: case.clone(),
                });
            }
        }

        Ok(())
    }
}

/// `Post` -> `postId`
fn default_foreign_key(parent: &str) -> String {
    let mut chars = parent.chars();
    match chars.next() {
        Some(first) => format!("{}{}Id", first.to_lowercase(), chars.as_str()),
        None => "Id".to_string(),
    }
}

fn sync_layers(
    models: &[ModelSchema],
    index: &HashMap<ModelName, usize>,
    children: &[Vec<Edge>],
) -> Vec<Vec<ModelName>> {
    // parents[i] = distinct parent indices of model i, self edges ignored
    let mut parents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); models.len()];
    for (parent, edges) in children.iter().enumerate() {
        for edge in edges {
            let child = index[&edge.child];
            if child != parent {
                parents[child].insert(parent);
            }
        }
    }

    let mut placed = vec![false; models.len()];
    let mut layers = Vec::new();

    loop {
        let layer: Vec<usize> = (0..models.len())
            .filter(|&i| !placed[i] && parents[i].iter().all(|&p| placed[p]))
            .collect();
        if layer.is_empty() {
            break;
        }
        for &i in &layer {
            placed[i] = true;
        }
        layers.push(layer.into_iter().map(|i| models[i].name.clone()).collect());
    }

    let cyclic: Vec<ModelName> = (0..models.len())
        .filter(|&i| !placed[i])
        .map(|i| models[i].name.clone())
        .collect();
    if !cyclic.is_empty() {
        layers.push(cyclic);
    }

    layers
}
