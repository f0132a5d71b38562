pub mod catalog;
pub mod schema;
pub mod toposort;

pub use catalog::{Catalog, CatalogSource};
pub use schema::{propagate_schemas, SchemaMap};
pub use toposort::{topological_order, topological_order_subset, CycleDetected};
