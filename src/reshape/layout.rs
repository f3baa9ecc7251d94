//! Pivot layout grid
//!
//! The layout is what the user builds by dragging attributes out of the
//! source stack into a grid. Columns are the new value attributes, rows are
//! the category values, and each cell holds at most one source attribute.
//!
//! The grid always ends with one empty row and one empty column. Dropping an
//! attribute into the trailing column adds a column; dropping into the trailing
//! row adds a row and names its category value after the attribute.
//!
//! ```text
//!              | value0    | value1 (trailing)
//!  ------------+-----------+-----------------
//!  pop2000     | pop2000   |
//!  type1 (tr.) |           |
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::plan::{AttributeMapping, StackingPlan};
use super::schema::DataSetSchema;
use crate::error::{Result, StackerError};

/// Default header of the category column
pub const DEFAULT_CATEGORY_NAME: &str = "category";

/// Grid size, trailing row and column included
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub rows: usize,
    pub cols: usize,
}

/// Cell coordinate; ordered top to bottom, then left to right
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellRef {
    pub row: usize,
    pub col: usize,
}

impl CellRef {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl std::fmt::Display for CellRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Where an attribute currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Stack(usize),
    Cell(CellRef),
}

#[derive(Serialize, Deserialize)]
struct PlacedCell {
    row: usize,
    col: usize,
    attribute: String,
}

mod cell_list {
    use super::{CellRef, PlacedCell};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        cells: &BTreeMap<CellRef, String>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<PlacedCell> = cells
            .iter()
            .map(|(at, attribute)| PlacedCell {
                row: at.row,
                col: at.col,
                attribute: attribute.clone(),
            })
            .collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<CellRef, String>, D::Error> {
        let list = Vec::<PlacedCell>::deserialize(deserializer)?;
        Ok(list
            .into_iter()
            .map(|cell| (CellRef::new(cell.row, cell.col), cell.attribute))
            .collect())
    }
}

/// The user's stacking layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotLayout {
    category_name: String,
    columns: Vec<String>,
    rows: Vec<String>,
    #[serde(with = "cell_list")]
    cells: BTreeMap<CellRef, String>,
    source_stack: Vec<String>,
}

impl PivotLayout {
    /// Empty 1x1 grid with every attribute on the source stack
    pub fn new<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            category_name: DEFAULT_CATEGORY_NAME.to_string(),
            columns: vec![default_column_name(0)],
            rows: vec![default_row_name(0)],
            cells: BTreeMap::new(),
            source_stack: attributes.into_iter().map(Into::into).collect(),
        }
    }

    /// Layout seeded from the attributes of the source's last collection
    pub fn for_source(source: &DataSetSchema) -> Self {
        let attributes = source
            .last_collection()
            .map(|c| c.attribute_names().map(str::to_string).collect::<Vec<_>>())
            .unwrap_or_default();
        Self::new(attributes)
    }

    pub fn extent(&self) -> Extent {
        Extent {
            rows: self.rows.len(),
            cols: self.columns.len(),
        }
    }

    pub fn category_name(&self) -> &str {
        &self.category_name
    }

    /// Column headers, trailing column included
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Row headers, trailing row included
    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    pub fn source_stack(&self) -> &[String] {
        &self.source_stack
    }

    pub fn cell(&self, at: CellRef) -> Option<&str> {
        self.cells.get(&at).map(String::as_str)
    }

    /// Occupied cells in grid order
    pub fn cells(&self) -> impl Iterator<Item = (CellRef, &str)> {
        self.cells.iter().map(|(at, attr)| (*at, attr.as_str()))
    }

    pub fn locate(&self, attribute: &str) -> Option<Placement> {
        if let Some(ix) = self.source_stack.iter().position(|a| a == attribute) {
            return Some(Placement::Stack(ix));
        }
        self.cells
            .iter()
            .find(|(_, a)| a.as_str() == attribute)
            .map(|(at, _)| Placement::Cell(*at))
    }

    fn check_bounds(&self, at: CellRef) -> Result<()> {
        let extent = self.extent();
        if at.row >= extent.rows || at.col >= extent.cols {
            return Err(StackerError::Layout(format!(
                "cell {} is outside the {}x{} grid",
                at, extent.rows, extent.cols
            )));
        }
        Ok(())
    }

    /// Drop an attribute into a cell, taking it from the stack or from
    /// another cell. Returns the grid size afterwards.
    pub fn place(&mut self, attribute: &str, at: CellRef) -> Result<Extent> {
        self.check_bounds(at)?;
        if let Some(current) = self.cells.get(&at) {
            return Err(StackerError::Layout(format!(
                "cell {} already holds '{}'",
                at, current
            )));
        }

        match self.locate(attribute) {
            Some(Placement::Stack(ix)) => {
                self.source_stack.remove(ix);
            }
            Some(Placement::Cell(from)) => {
                self.cells.remove(&from);
            }
            None => {
                return Err(StackerError::Layout(format!(
                    "unknown attribute '{}'",
                    attribute
                )))
            }
        }
        self.cells.insert(at, attribute.to_string());

        let extent = self.extent();
        if at.col + 1 == extent.cols {
            self.grow_column();
        }
        if at.row + 1 == extent.rows {
            self.grow_row();
            self.rows[at.row] = attribute.to_string();
        }
        Ok(self.extent())
    }

    /// Put an attribute back at the end of the source stack
    pub fn return_to_stack(&mut self, attribute: &str) -> Result<()> {
        match self.locate(attribute) {
            Some(Placement::Cell(at)) => {
                self.cells.remove(&at);
            }
            Some(Placement::Stack(ix)) => {
                self.source_stack.remove(ix);
            }
            None => {
                return Err(StackerError::Layout(format!(
                    "unknown attribute '{}'",
                    attribute
                )))
            }
        }
        self.source_stack.push(attribute.to_string());
        Ok(())
    }

    /// Append an empty trailing row
    pub fn grow_row(&mut self) -> Extent {
        self.rows.push(default_row_name(self.rows.len()));
        self.extent()
    }

    /// Append an empty trailing column
    pub fn grow_column(&mut self) -> Extent {
        self.columns.push(default_column_name(self.columns.len()));
        self.extent()
    }

    pub fn rename_category(&mut self, name: impl Into<String>) {
        self.category_name = name.into();
    }

    pub fn rename_row(&mut self, row: usize, name: impl Into<String>) -> Result<()> {
        let slot = self
            .rows
            .get_mut(row)
            .ok_or_else(|| StackerError::Layout(format!("no row {}", row)))?;
        *slot = name.into();
        Ok(())
    }

    pub fn rename_column(&mut self, col: usize, name: impl Into<String>) -> Result<()> {
        let slot = self
            .columns
            .get_mut(col)
            .ok_or_else(|| StackerError::Layout(format!("no column {}", col)))?;
        *slot = name.into();
        Ok(())
    }

    /// Check the grid invariants that `place` maintains but a deserialized
    /// layout may not: at least one row and one column, every occupied cell
    /// inside the filled area, and every attribute in exactly one place.
    pub fn validate(&self) -> Result<()> {
        if self.rows.is_empty() || self.columns.is_empty() {
            return Err(StackerError::Layout(
                "the grid needs at least one row and one column".to_string(),
            ));
        }

        let Extent { rows, cols } = self.extent();
        let stray = self
            .cells
            .iter()
            .find(|(at, _)| at.row + 1 >= rows || at.col + 1 >= cols);
        if let Some((at, attr)) = stray {
            return Err(StackerError::Layout(format!(
                "'{}' sits at {}, outside the filled part of the {}x{} grid",
                attr, at, rows, cols
            )));
        }

        let mut seen = HashSet::new();
        let repeated = self
            .source_stack
            .iter()
            .chain(self.cells.values())
            .find(|attr| !seen.insert(attr.as_str()));
        if let Some(attr) = repeated {
            return Err(StackerError::Layout(format!(
                "'{}' is placed more than once",
                attr
            )));
        }
        Ok(())
    }

    /// Compile the layout against the source schema.
    ///
    /// Rows and columns come out in grid order with the trailing row and
    /// column left out. Every attribute in the layout must belong to the
    /// source's last collection.
    pub fn compile(&self, source: &DataSetSchema) -> Result<StackingPlan> {
        self.validate()?;
        let category = self.category_name.trim();
        if category.is_empty() {
            return Err(StackerError::Layout(
                "the category attribute needs a name".to_string(),
            ));
        }

        let (value_attributes, category_values) =
            match (self.columns.split_last(), self.rows.split_last()) {
                (Some((_, columns)), Some((_, rows))) => (columns.to_vec(), rows.to_vec()),
                _ => {
                    return Err(StackerError::Layout(
                        "the grid needs at least one row and one column".to_string(),
                    ))
                }
            };
        if let Some(ix) = value_attributes.iter().position(|c| c.trim().is_empty()) {
            return Err(StackerError::Layout(format!("value column {} has no name", ix)));
        }
        if category_values.is_empty() {
            return Err(StackerError::Layout(
                "drop at least one attribute into the grid".to_string(),
            ));
        }

        let last = source.last_collection().ok_or_else(|| {
            StackerError::Schema(format!("data set '{}' has no collections", source.name))
        })?;
        let unknown = self
            .source_stack
            .iter()
            .chain(self.cells.values())
            .find(|attr| last.attribute(attr).is_none());
        if let Some(attr) = unknown {
            return Err(StackerError::Schema(format!(
                "'{}' is not an attribute of collection '{}'",
                attr, last.name
            )));
        }

        let mappings = (0..category_values.len())
            .map(|row| {
                value_attributes
                    .iter()
                    .enumerate()
                    .filter_map(|(col, to)| {
                        let from = self.cells.get(&CellRef::new(row, col))?;
                        Some(AttributeMapping::new(from.clone(), to.clone()))
                    })
                    .collect()
            })
            .collect();

        Ok(StackingPlan {
            category_attribute: category.to_string(),
            parent_attributes: self.source_stack.clone(),
            value_attributes,
            category_values,
            mappings,
        })
    }
}

fn default_column_name(col: usize) -> String {
    format!("value{}", col)
}

fn default_row_name(row: usize) -> String {
    format!("type{}", row)
}

/// Declarative layout, e.g. read from a JSON file by the command line.
///
/// ```json
/// {
///   "category": "year",
///   "columns": ["population"],
///   "rows": [
///     {"value": "2000", "cells": ["pop2000"]},
///     {"value": "2010", "cells": ["pop2010"]}
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutSpec {
    #[serde(default = "default_category")]
    pub category: String,
    pub columns: Vec<String>,
    pub rows: Vec<LayoutRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutRow {
    pub value: String,
    /// Source attribute per column; `null` leaves the cell empty
    #[serde(default)]
    pub cells: Vec<Option<String>>,
}

fn default_category() -> String {
    DEFAULT_CATEGORY_NAME.to_string()
}

impl LayoutSpec {
    /// Replay the spec onto a fresh layout over the given source
    pub fn build(&self, source: &DataSetSchema) -> Result<PivotLayout> {
        let mut layout = PivotLayout::for_source(source);
        while layout.extent().cols <= self.columns.len() {
            layout.grow_column();
        }
        while layout.extent().rows <= self.rows.len() {
            layout.grow_row();
        }

        for (row, spec_row) in self.rows.iter().enumerate() {
            if spec_row.cells.len() > self.columns.len() {
                return Err(StackerError::Layout(format!(
                    "row '{}' has more cells than there are columns",
                    spec_row.value
                )));
            }
            for (col, cell) in spec_row.cells.iter().enumerate() {
                if let Some(attribute) = cell {
                    layout.place(attribute, CellRef::new(row, col))?;
                }
            }
            layout.rename_row(row, spec_row.value.clone())?;
        }
        for (col, name) in self.columns.iter().enumerate() {
            layout.rename_column(col, name.clone())?;
        }
        layout.rename_category(self.category.clone());
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reshape::schema::{AttributeSchema, CollectionSchema};

    fn source() -> DataSetSchema {
        let mut collection = CollectionSchema::new("countries");
        collection.attrs = ["country", "pop2000", "pop2010", "area"]
            .into_iter()
            .map(AttributeSchema::named)
            .collect();
        let mut schema = DataSetSchema::new("census");
        schema.collections.push(collection);
        schema
    }

    #[test]
    fn test_new_layout_is_one_by_one() {
        let layout = PivotLayout::for_source(&source());
        assert_eq!(layout.extent(), Extent { rows: 1, cols: 1 });
        assert_eq!(layout.columns(), ["value0"]);
        assert_eq!(layout.rows(), ["type0"]);
        assert_eq!(layout.category_name(), "category");
        assert_eq!(layout.source_stack().len(), 4);
    }

    #[test]
    fn test_drop_into_trailing_cell_grows_both() {
        let mut layout = PivotLayout::for_source(&source());
        let extent = layout.place("pop2000", CellRef::new(0, 0)).unwrap();

        assert_eq!(extent, Extent { rows: 2, cols: 2 });
        assert_eq!(layout.rows(), ["pop2000", "type1"]);
        assert_eq!(layout.columns(), ["value0", "value1"]);
        assert_eq!(layout.locate("pop2000"), Some(Placement::Cell(CellRef::new(0, 0))));
        assert!(!layout.source_stack().contains(&"pop2000".to_string()));
    }

    #[test]
    fn test_only_trailing_edges_grow() {
        let mut layout = PivotLayout::for_source(&source());
        layout.place("pop2000", CellRef::new(0, 0)).unwrap();
        layout.place("pop2010", CellRef::new(1, 0)).unwrap();
        let extent = layout.place("area", CellRef::new(0, 1)).unwrap();

        // Row 1 was trailing when pop2010 landed, column 1 when area did
        assert_eq!(extent, Extent { rows: 3, cols: 3 });
        assert_eq!(layout.rows()[1], "pop2010");
    }

    #[test]
    fn test_occupied_cell_is_rejected() {
        let mut layout = PivotLayout::for_source(&source());
        layout.place("pop2000", CellRef::new(0, 0)).unwrap();
        let err = layout.place("pop2010", CellRef::new(0, 0)).unwrap_err();
        assert!(err.to_string().contains("already holds"));
        assert!(layout.source_stack().contains(&"pop2010".to_string()));
    }

    #[test]
    fn test_out_of_bounds_and_unknown() {
        let mut layout = PivotLayout::for_source(&source());
        assert!(layout.place("pop2000", CellRef::new(3, 0)).is_err());
        assert!(layout.place("gdp", CellRef::new(0, 0)).is_err());
        assert!(layout.return_to_stack("gdp").is_err());
    }

    #[test]
    fn test_move_between_cells_vacates_origin() {
        let mut layout = PivotLayout::for_source(&source());
        layout.place("pop2000", CellRef::new(0, 0)).unwrap();
        layout.place("pop2000", CellRef::new(1, 1)).unwrap();

        assert_eq!(layout.cell(CellRef::new(0, 0)), None);
        assert_eq!(layout.cell(CellRef::new(1, 1)), Some("pop2000"));
        assert_eq!(layout.extent(), Extent { rows: 3, cols: 3 });
    }

    #[test]
    fn test_return_to_stack_appends() {
        let mut layout = PivotLayout::for_source(&source());
        layout.place("country", CellRef::new(0, 0)).unwrap();
        layout.return_to_stack("country").unwrap();

        assert_eq!(layout.source_stack().last().map(String::as_str), Some("country"));
        assert_eq!(layout.cells().count(), 0);
    }

    #[test]
    fn test_compile_two_categories() {
        let mut layout = PivotLayout::for_source(&source());
        layout.place("pop2000", CellRef::new(0, 0)).unwrap();
        layout.place("pop2010", CellRef::new(1, 0)).unwrap();
        layout.rename_column(0, "population").unwrap();
        layout.rename_category("year");

        let plan = layout.compile(&source()).unwrap();
        assert_eq!(plan.category_attribute, "year");
        assert_eq!(plan.parent_attributes, vec!["country", "area"]);
        assert_eq!(plan.value_attributes, vec!["population"]);
        assert_eq!(plan.category_values, vec!["pop2000", "pop2010"]);
        assert_eq!(
            plan.mappings,
            vec![
                vec![AttributeMapping::new("pop2000", "population")],
                vec![AttributeMapping::new("pop2010", "population")],
            ]
        );
    }

    #[test]
    fn test_compile_rejects_incomplete_layouts() {
        let layout = PivotLayout::for_source(&source());
        assert!(layout.compile(&source()).is_err());

        let mut layout = PivotLayout::for_source(&source());
        layout.place("pop2000", CellRef::new(0, 0)).unwrap();
        layout.rename_category("  ");
        assert!(layout.compile(&source()).is_err());

        let mut layout = PivotLayout::for_source(&source());
        layout.place("pop2000", CellRef::new(0, 0)).unwrap();
        layout.rename_column(0, "").unwrap();
        assert!(layout.compile(&source()).is_err());
    }

    #[test]
    fn test_compile_rejects_foreign_attribute() {
        let mut other = source();
        other.collections[0].attrs.retain(|a| a.name != "area");

        let mut layout = PivotLayout::for_source(&source());
        layout.place("pop2000", CellRef::new(0, 0)).unwrap();
        let err = layout.compile(&other).unwrap_err();
        assert!(matches!(err, StackerError::Schema(_)));
    }

    #[test]
    fn test_layout_serde_round_trip() {
        let mut layout = PivotLayout::for_source(&source());
        layout.place("pop2000", CellRef::new(0, 0)).unwrap();

        let json = serde_json::to_value(&layout).unwrap();
        assert_eq!(json["cells"][0]["attribute"], "pop2000");
        let back: PivotLayout = serde_json::from_value(json).unwrap();
        assert_eq!(back, layout);
    }

    #[test]
    fn test_layout_spec_build() {
        let spec: LayoutSpec = serde_json::from_str(
            r#"{
                "category": "year",
                "columns": ["population"],
                "rows": [
                    {"value": "2000", "cells": ["pop2000"]},
                    {"value": "2010", "cells": ["pop2010"]}
                ]
            }"#,
        )
        .unwrap();

        let layout = spec.build(&source()).unwrap();
        assert_eq!(layout.extent(), Extent { rows: 3, cols: 2 });
        let plan = layout.compile(&source()).unwrap();
        assert_eq!(plan.category_values, vec!["2000", "2010"]);
        assert_eq!(plan.value_attributes, vec!["population"]);
        assert_eq!(plan.parent_attributes, vec!["country", "area"]);
    }

    fn restored(json: serde_json::Value) -> PivotLayout {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_restored_empty_grid_is_rejected() {
        let layout = restored(serde_json::json!({
            "categoryName": "kind",
            "columns": [],
            "rows": [],
            "cells": [],
            "sourceStack": ["country", "pop2000"]
        }));

        assert!(layout.validate().is_err());
        let err = layout.compile(&source()).unwrap_err();
        assert!(matches!(err, StackerError::Layout(_)));
    }

    #[test]
    fn test_restored_cell_in_trailing_row_is_rejected() {
        let layout = restored(serde_json::json!({
            "categoryName": "kind",
            "columns": ["v1", "value1"],
            "rows": ["cat1", "type1"],
            "cells": [{"row": 1, "col": 0, "attribute": "pop2000"}],
            "sourceStack": ["country"]
        }));

        let err = layout.compile(&source()).unwrap_err();
        assert!(err.to_string().contains("pop2000"));
    }

    #[test]
    fn test_restored_attribute_placed_twice_is_rejected() {
        let layout = restored(serde_json::json!({
            "categoryName": "kind",
            "columns": ["v1", "value1"],
            "rows": ["cat1", "type1"],
            "cells": [{"row": 0, "col": 0, "attribute": "pop2000"}],
            "sourceStack": ["country", "pop2000"]
        }));

        let err = layout.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_edited_layouts_validate() {
        let mut layout = PivotLayout::for_source(&source());
        assert!(layout.validate().is_ok());
        layout.place("pop2000", CellRef::new(0, 0)).unwrap();
        layout.place("pop2010", CellRef::new(1, 1)).unwrap();
        assert!(layout.validate().is_ok());
    }

    // Property-based tests using proptest
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_grid_keeps_trailing_row_and_column(
            drops in prop::collection::vec((0usize..4, 0usize..4, 0usize..4), 1..20)
        ) {
            let attrs = ["country", "pop2000", "pop2010", "area"];
            let mut layout = PivotLayout::for_source(&source());
            for (attr_ix, row, col) in drops {
                let _ = layout.place(attrs[attr_ix], CellRef::new(row, col));

                let Extent { rows, cols } = layout.extent();
                prop_assert!(layout.cells().all(|(at, _)| at.row + 1 < rows && at.col + 1 < cols));
                prop_assert!(layout.validate().is_ok());
                prop_assert_eq!(layout.cells().count() + layout.source_stack().len(), attrs.len());
            }
        }

        #[test]
        fn test_compiled_mappings_follow_grid_order(
            drops in prop::collection::vec((0usize..4, 0usize..3, 0usize..3), 1..12)
        ) {
            let attrs = ["country", "pop2000", "pop2010", "area"];
            let mut layout = PivotLayout::for_source(&source());
            for (attr_ix, row, col) in drops {
                let _ = layout.place(attrs[attr_ix], CellRef::new(row, col));
            }
            prop_assume!(layout.cells().count() > 0);

            let plan = layout.compile(&source()).unwrap();
            let expected: Vec<&str> = layout.cells().map(|(_, a)| a).collect();
            let actual: Vec<&str> = plan.stacked_attributes().collect();
            prop_assert_eq!(actual, expected);
            prop_assert_eq!(plan.category_values.len(), layout.extent().rows - 1);
            prop_assert_eq!(plan.value_attributes.len(), layout.extent().cols - 1);
        }
    }
}
