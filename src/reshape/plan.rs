//! Compiled stacking plan
//!
//! A [`StackingPlan`] is what the engine needs from a pivot layout: which
//! attributes stay on the parent, which new attributes the child collection
//! gets, and for each category value which source attribute feeds which new
//! attribute.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Copy `from` (source attribute) into `to` (new value attribute)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMapping {
    pub from: String,
    pub to: String,
}

impl AttributeMapping {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackingPlan {
    /// Name of the new attribute holding the category value
    pub category_attribute: String,
    /// Attributes of the source's last collection kept on the parent
    pub parent_attributes: Vec<String>,
    /// New attributes of the child collection, left to right
    pub value_attributes: Vec<String>,
    /// One child row per category value, top to bottom
    pub category_values: Vec<String>,
    /// Indexed like `category_values`
    pub mappings: Vec<Vec<AttributeMapping>>,
}

impl StackingPlan {
    /// Name of the child collection
    pub fn child_collection(&self) -> String {
        format!("{}s", self.category_attribute)
    }

    /// Source attributes moved into child rows, in grid order
    pub fn stacked_attributes(&self) -> impl Iterator<Item = &str> {
        self.mappings
            .iter()
            .flatten()
            .map(|mapping| mapping.from.as_str())
    }

    /// Values for the parent row built from one source row.
    ///
    /// Attributes the source row lacks are left out.
    pub fn parent_values(&self, source: &Map<String, Value>) -> Map<String, Value> {
        self.parent_attributes
            .iter()
            .filter_map(|name| source.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    /// Values for each child row built from one source row.
    ///
    /// Always exactly one row per category value; a mapped attribute missing
    /// from the source row is absent from the child row rather than skipping it.
    pub fn child_values(&self, source: &Map<String, Value>) -> Vec<Map<String, Value>> {
        self.category_values
            .iter()
            .enumerate()
            .map(|(ix, category)| {
                let mut values = Map::new();
                values.insert(
                    self.category_attribute.clone(),
                    Value::String(category.clone()),
                );
                for mapping in self.mappings.get(ix).into_iter().flatten() {
                    if let Some(value) = source.get(&mapping.from) {
                        values.insert(mapping.to.clone(), value.clone());
                    }
                }
                values
            })
            .collect()
    }
}
