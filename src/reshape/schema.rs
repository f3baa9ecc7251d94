//! Data set schemas and target schema derivation
//!
//! Only the fields the stacker reads are typed; everything else the host
//! sends (formulas, range maps, categories, ...) rides along in the
//! flattened `properties`/`extra` maps so cloned definitions keep it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::plan::StackingPlan;
use crate::error::{Result, StackerError};

/// Suffix appended to the source name to name the stacked data set
pub const STACKED_SUFFIX: &str = "_stacked";

/// Identity fields the host assigns and a clone must not carry over
const IDENTITY_FIELDS: [&str; 2] = ["id", "guid"];

/// One entry of `get dataContextList`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetSummary {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub id: Option<i64>,
}

impl DataSetSummary {
    /// Title if the host gave one, otherwise the name
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSchema {
    pub name: String,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl AttributeSchema {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Map::new(),
        }
    }

    /// Copy of this definition with host-assigned identity removed
    pub fn without_identity(&self) -> Self {
        let mut copy = self.clone();
        for field in IDENTITY_FIELDS {
            copy.properties.remove(field);
        }
        copy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Enclosing collection. The host reports it by id; definitions sent to
    /// the host name it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Value>,
    #[serde(default)]
    pub attrs: Vec<AttributeSchema>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            parent: None,
            labels: None,
            attrs: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attrs.iter().find(|a| a.name == name)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attrs.iter().map(|a| a.name.as_str())
    }
}

/// Shape of `get dataContext[NAME]` and of `create dataContext` values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub collections: Vec<CollectionSchema>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DataSetSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            collections: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Innermost collection, the one whose rows get stacked
    pub fn last_collection(&self) -> Option<&CollectionSchema> {
        self.collections.last()
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.iter().find(|c| c.name == name)
    }
}

/// Name of the data set produced by stacking `source`
pub fn stacked_name(source: &str) -> String {
    format!("{}{}", source, STACKED_SUFFIX)
}

/// Build the schema of the stacked data set.
///
/// Every source collection is cloned with identity fields stripped and is
/// linked by name to the collection before it. The last one keeps only the
/// plan's parent attributes and gains a child collection holding the
/// category attribute followed by the value attributes.
pub fn derive_target_schema(source: &DataSetSchema, plan: &StackingPlan) -> Result<DataSetSchema> {
    let last = source.last_collection().ok_or_else(|| {
        StackerError::Schema(format!("data set '{}' has no collections", source.name))
    })?;
    let last_ix = source.collections.len() - 1;

    let mut collections: Vec<CollectionSchema> = Vec::with_capacity(source.collections.len() + 1);
    let mut previous: Option<&str> = None;
    for (ix, collection) in source.collections.iter().enumerate() {
        let attrs = collection
            .attrs
            .iter()
            .filter(|attr| ix != last_ix || plan.parent_attributes.contains(&attr.name))
            .map(AttributeSchema::without_identity)
            .collect();
        collections.push(CollectionSchema {
            name: collection.name.clone(),
            title: collection.title.clone(),
            parent: previous.map(|name| Value::String(name.to_string())),
            labels: collection.labels.clone(),
            attrs,
            extra: Map::new(),
        });
        previous = Some(&collection.name);
    }

    let mut child = CollectionSchema::new(plan.child_collection());
    child.parent = Some(Value::String(last.name.clone()));
    child.attrs = std::iter::once(&plan.category_attribute)
        .chain(plan.value_attributes.iter())
        .map(AttributeSchema::named)
        .collect();
    collections.push(child);

    Ok(DataSetSchema {
        name: stacked_name(&source.name),
        title: None,
        collections,
        extra: Map::new(),
    })
}
