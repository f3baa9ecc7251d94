//! Test data builders for creating test objects

use codap_stacker::host::InMemoryHost;
use codap_stacker::reshape::{
    AttributeSchema, CollectionSchema, DataSetSchema, LayoutRow, LayoutSpec,
};
use serde_json::{Map, Value};

/// Builder for source data sets, optionally seeded into a host
pub struct DataSetBuilder {
    schema: DataSetSchema,
    rows: Vec<Map<String, Value>>,
}

impl DataSetBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            schema: DataSetSchema::new(name),
            rows: Vec::new(),
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.schema.title = Some(title.to_string());
        self
    }

    /// Append a collection; the last one added holds the rows
    pub fn collection(mut self, name: &str, attrs: &[&str]) -> Self {
        let mut collection = CollectionSchema::new(name);
        collection.attrs = attrs.iter().copied().map(AttributeSchema::named).collect();
        self.schema.collections.push(collection);
        self
    }

    /// Append a row to the last collection
    pub fn row(mut self, values: Value) -> Self {
        if let Value::Object(map) = values {
            self.rows.push(map);
        }
        self
    }

    pub fn schema(&self) -> DataSetSchema {
        self.schema.clone()
    }

    /// Add the data set and its rows to `host`
    pub fn seed(self, host: &InMemoryHost) -> DataSetSchema {
        let name = self.schema.name.clone();
        let collection = self
            .schema
            .last_collection()
            .map(|c| c.name.clone())
            .expect("data set needs a collection");
        host.add_data_set(self.schema.clone());
        for row in self.rows {
            host.add_case(&name, &collection, None, Value::Object(row))
                .expect("seed row");
        }
        host.data_set(&name).expect("seeded data set")
    }
}

/// Builder for layout files
pub struct LayoutBuilder {
    spec: LayoutSpec,
}

impl LayoutBuilder {
    pub fn new(category: &str) -> Self {
        Self {
            spec: LayoutSpec {
                category: category.to_string(),
                columns: Vec::new(),
                rows: Vec::new(),
            },
        }
    }

    pub fn column(mut self, name: &str) -> Self {
        self.spec.columns.push(name.to_string());
        self
    }

    /// Add a category value; `cells` lists one source attribute per column
    pub fn row(mut self, value: &str, cells: &[Option<&str>]) -> Self {
        self.spec.rows.push(LayoutRow {
            value: value.to_string(),
            cells: cells.iter().map(|c| c.map(str::to_string)).collect(),
        });
        self
    }

    pub fn build(self) -> LayoutSpec {
        self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_set_builder() {
        let host = InMemoryHost::new();
        let schema = DataSetBuilder::new("src")
            .collection("people", &["name", "x"])
            .row(json!({"name": "a", "x": 1}))
            .seed(&host);

        assert_eq!(schema.collections[0].attribute_names().count(), 2);
        assert_eq!(host.cases("src", "people").len(), 1);
    }
}
