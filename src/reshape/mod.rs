//! Attribute stacking
//!
//! - [`layout`]: the pivot grid the user edits
//! - [`plan`]: what a layout compiles to
//! - [`schema`]: data set schemas and the stacked target schema
//! - [`engine`]: row-by-row migration through the bridge

pub mod engine;
pub mod layout;
pub mod plan;
pub mod schema;

pub use engine::{FailurePolicy, Halt, MigrationJob, MigrationReport, ReshapeEngine, RowOutcome};
pub use layout::{CellRef, Extent, LayoutRow, LayoutSpec, PivotLayout, Placement};
pub use plan::{AttributeMapping, StackingPlan};
pub use schema::{
    derive_target_schema, stacked_name, AttributeSchema, CollectionSchema, DataSetSchema,
    DataSetSummary,
};
