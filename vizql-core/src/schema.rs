//! Schema propagation engine.
//!
//! A pure, synchronous function: `(Graph, Catalog) -> map(nodeId -> output
//! schema)`. No I/O, no locks — the only two failure modes are a cycle in
//! the graph or a node whose type has no registered transform (the latter
//! can only happen upstream of us, at [`vizql_types::Graph::try_from_raw`],
//! since [`NodeKind`] is a closed enum covering every supported node type).

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use vizql_types::errors::ValidationError;
use vizql_types::identifier::validate_identifier;
use vizql_types::{ColumnSchema, DType, Graph, Node, NodeId, NodeKind};

use crate::toposort::{self, CycleDetected};

pub type SchemaMap = HashMap<NodeId, Vec<ColumnSchema>>;

/// Computes the output schema of every node in `graph`. `catalog_lookup` is
/// consulted only by `data_source` nodes to resolve the columns backing a
/// `config.table` reference when the authored config omits them.
pub fn propagate_schemas(
    graph: &Graph,
    catalog_lookup: impl Fn(&str) -> Option<Vec<ColumnSchema>>,
) -> Result<SchemaMap, ValidationError> {
    let order = toposort::topological_order(graph).map_err(|CycleDetected(ids)| {
        ValidationError::CycleDetected(ids)
    })?;

    let mut schemas: SchemaMap = HashMap::with_capacity(order.len());
    for node_id in order {
        let node = graph
            .node(&node_id)
            .expect("topological order only yields nodes that exist in the graph");
        let inputs: Vec<&Vec<ColumnSchema>> = graph
            .inbound_edges(&node_id)
            .map(|edge| {
                schemas
                    .get(&edge.source)
                    .expect("ancestors are visited before their descendants")
            })
            .collect();
        let output = apply_transform(node, &inputs, &catalog_lookup)?;
        schemas.insert(node_id, output);
    }
    Ok(schemas)
}

fn apply_transform(
    node: &Node,
    inputs: &[&Vec<ColumnSchema>],
    catalog_lookup: &impl Fn(&str) -> Option<Vec<ColumnSchema>>,
) -> Result<Vec<ColumnSchema>, ValidationError> {
    require_inputs(node, inputs.len())?;

    match node.kind {
        NodeKind::DataSource => Ok(data_source_columns(node, catalog_lookup)),
        NodeKind::Filter
        | NodeKind::Sort
        | NodeKind::Limit
        | NodeKind::Sample
        | NodeKind::Unique => Ok(inputs[0].clone()),
        NodeKind::Select => Ok(select_columns(node, inputs[0])),
        NodeKind::Rename => rename_columns(node, inputs[0]),
        NodeKind::Join => Ok(join_columns(inputs[0], inputs[1])),
        NodeKind::Union => Ok(inputs[0].clone()),
        NodeKind::GroupBy => group_by_columns(node, inputs[0]),
        NodeKind::Pivot => pivot_columns(node, inputs[0]),
        NodeKind::Formula => formula_columns(node, inputs[0]),
        NodeKind::Window => window_columns(node, inputs[0]),
        NodeKind::ChartOutput | NodeKind::TableOutput | NodeKind::KpiOutput => Ok(Vec::new()),
    }
}

/// Required input-port count per node kind; a shortfall raises `MissingInput`.
fn required_inputs(kind: NodeKind) -> usize {
    match kind {
        NodeKind::DataSource => 0,
        NodeKind::Join => 2,
        NodeKind::ChartOutput | NodeKind::TableOutput | NodeKind::KpiOutput => 1,
        _ => 1,
    }
}

fn require_inputs(node: &Node, got: usize) -> Result<(), ValidationError> {
    let required = required_inputs(node.kind);
    if got < required {
        return Err(ValidationError::MissingInput {
            node: node.id.clone(),
            port: got,
        });
    }
    Ok(())
}

fn data_source_columns(
    node: &Node,
    catalog_lookup: &impl Fn(&str) -> Option<Vec<ColumnSchema>>,
) -> Vec<ColumnSchema> {
    if let Some(columns) = node.config.get("columns") {
        if let Ok(columns) = serde_json::from_value::<Vec<ColumnSchema>>(columns.clone()) {
            return columns;
        }
    }
    node.config
        .get("table")
        .and_then(JsonValue::as_str)
        .and_then(catalog_lookup)
        .unwrap_or_default()
}

fn select_columns(node: &Node, input: &[ColumnSchema]) -> Vec<ColumnSchema> {
    let wanted: Vec<String> = node
        .config
        .get("columns")
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    wanted
        .iter()
        .filter_map(|name| input.iter().find(|c| &c.name == name).cloned())
        .collect()
}

fn rename_columns(node: &Node, input: &[ColumnSchema]) -> Result<Vec<ColumnSchema>, ValidationError> {
    let rename_map: HashMap<String, String> = node
        .config
        .get("rename_map")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    input
        .iter()
        .map(|c| {
            let mut renamed = c.clone();
            if let Some(new_name) = rename_map.get(&c.name) {
                validate_identifier(new_name)?;
                renamed.name = new_name.clone();
            }
            Ok(renamed)
        })
        .collect()
}

fn join_columns(left: &[ColumnSchema], right: &[ColumnSchema]) -> Vec<ColumnSchema> {
    let mut out = left.to_vec();
    for col in right {
        if !out.iter().any(|c| c.name == col.name) {
            out.push(col.clone());
        }
    }
    out
}

#[derive(serde::Deserialize)]
struct AggregationConfig {
    alias: String,
}

fn group_by_columns(
    node: &Node,
    input: &[ColumnSchema],
) -> Result<Vec<ColumnSchema>, ValidationError> {
    let group_key_names: Vec<String> = node
        .config
        .get("group_keys")
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    let mut out = Vec::new();
    for key in &group_key_names {
        let col = input.iter().find(|c| &c.name == key).ok_or_else(|| {
            ValidationError::UnresolvedColumn {
                node: node.id.clone(),
                column: key.clone(),
            }
        })?;
        out.push(col.clone());
    }

    let aggregations: Vec<AggregationConfig> = node
        .config
        .get("aggregations")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    for agg in aggregations {
        validate_identifier(&agg.alias)?;
        out.push(ColumnSchema::new(agg.alias, DType::Float64, true));
    }
    Ok(out)
}

fn pivot_columns(node: &Node, input: &[ColumnSchema]) -> Result<Vec<ColumnSchema>, ValidationError> {
    let row_dimension_names: Vec<String> = node
        .config
        .get("row_dimensions")
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    let mut out = Vec::new();
    for dim in &row_dimension_names {
        let col = input.iter().find(|c| &c.name == dim).ok_or_else(|| {
            ValidationError::UnresolvedColumn {
                node: node.id.clone(),
                column: dim.clone(),
            }
        })?;
        out.push(col.clone());
    }

    let aggregations: Vec<String> = node
        .config
        .get("aggregations")
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    for agg in aggregations {
        let name = format!("value_column_{agg}");
        validate_identifier(&name)?;
        out.push(ColumnSchema::new(name, DType::Float64, true));
    }
    Ok(out)
}

fn formula_columns(node: &Node, input: &[ColumnSchema]) -> Result<Vec<ColumnSchema>, ValidationError> {
    let output_column = node
        .config
        .get("output_column")
        .and_then(JsonValue::as_str)
        .unwrap_or("formula_result")
        .to_string();
    validate_identifier(&output_column)?;
    let output_dtype = node
        .config
        .get("output_dtype")
        .and_then(JsonValue::as_str)
        .and_then(dtype_from_str)
        .unwrap_or(DType::Float64);

    let mut out = input.to_vec();
    out.push(ColumnSchema::new(output_column, output_dtype, true));
    Ok(out)
}

/// Window function output dtype inference. Ranking
/// functions are integral; everything else defaults to `float64`.
fn window_function_dtype(function: &str) -> DType {
    match function {
        "rank" | "dense_rank" | "row_number" | "ntile" => DType::Int64,
        _ => DType::Float64,
    }
}

fn window_columns(node: &Node, input: &[ColumnSchema]) -> Result<Vec<ColumnSchema>, ValidationError> {
    let output_column = node
        .config
        .get("output_column")
        .and_then(JsonValue::as_str)
        .unwrap_or("window_result")
        .to_string();
    validate_identifier(&output_column)?;
    let function = node
        .config
        .get("function")
        .and_then(JsonValue::as_str)
        .unwrap_or("");
    let dtype = window_function_dtype(function);

    let mut out = input.to_vec();
    out.push(ColumnSchema::new(output_column, dtype, true));
    Ok(out)
}

fn dtype_from_str(s: &str) -> Option<DType> {
    match s {
        "string" => Some(DType::String),
        "int64" => Some(DType::Int64),
        "float64" => Some(DType::Float64),
        "bool" => Some(DType::Bool),
        "datetime" => Some(DType::Datetime),
        "object" => Some(DType::Object),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vizql_types::{Edge, NodeKind};

    fn node(id: &str, kind: NodeKind, config: JsonValue) -> Node {
        Node {
            id: NodeId(id.to_string()),
            kind,
            config,
        }
    }

    fn edge(a: &str, b: &str) -> Edge {
        Edge {
            source: NodeId(a.to_string()),
            target: NodeId(b.to_string()),
        }
    }

    fn no_catalog(_: &str) -> Option<Vec<ColumnSchema>> {
        None
    }

    #[test]
    fn filter_select_chain_is_deterministic_and_matches_fixture() {
        let graph = Graph {
            nodes: vec![
                node(
                    "src",
                    NodeKind::DataSource,
                    serde_json::json!({
                        "table": "trades",
                        "columns": [
                            {"name": "symbol", "dtype": "string", "nullable": false},
                            {"name": "price", "dtype": "float64", "nullable": false},
                            {"name": "qty", "dtype": "int64", "nullable": true}
                        ]
                    }),
                ),
                node(
                    "f",
                    NodeKind::Filter,
                    serde_json::json!({"column": "symbol", "operator": "=", "value": "AAPL"}),
                ),
                node(
                    "sel",
                    NodeKind::Select,
                    serde_json::json!({"columns": ["symbol", "price"]}),
                ),
                node("out", NodeKind::TableOutput, JsonValue::Null),
            ],
            edges: vec![edge("src", "f"), edge("f", "sel"), edge("sel", "out")],
        };

        let schemas_a = propagate_schemas(&graph, no_catalog).unwrap();
        let schemas_b = propagate_schemas(&graph, no_catalog).unwrap();
        assert_eq!(schemas_a, schemas_b, "engine must be a pure function");

        let sel_out = &schemas_a[&NodeId("sel".into())];
        assert_eq!(
            sel_out,
            &vec![
                ColumnSchema::new("symbol", DType::String, false),
                ColumnSchema::new("price", DType::Float64, false),
            ]
        );
        assert!(schemas_a[&NodeId("out".into())].is_empty());
    }

    #[test]
    fn select_silently_drops_unknown_column_names() {
        let graph = Graph {
            nodes: vec![
                node(
                    "src",
                    NodeKind::DataSource,
                    serde_json::json!({"columns": [{"name": "a", "dtype": "string", "nullable": false}]}),
                ),
                node(
                    "sel",
                    NodeKind::Select,
                    serde_json::json!({"columns": ["a", "does_not_exist"]}),
                ),
            ],
            edges: vec![edge("src", "sel")],
        };
        let schemas = propagate_schemas(&graph, no_catalog).unwrap();
        assert_eq!(schemas[&NodeId("sel".into())].len(), 1);
    }

    #[test]
    fn join_dedups_left_precedence() {
        let left = node(
            "l",
            NodeKind::DataSource,
            serde_json::json!({"columns": [
                {"name": "id", "dtype": "int64", "nullable": false},
                {"name": "name", "dtype": "string", "nullable": false}
            ]}),
        );
        let right = node(
            "r",
            NodeKind::DataSource,
            serde_json::json!({"columns": [
                {"name": "id", "dtype": "int64", "nullable": false},
                {"name": "amount", "dtype": "float64", "nullable": true}
            ]}),
        );
        let join = node("j", NodeKind::Join, serde_json::json!({"join_type": "inner"}));
        let graph = Graph {
            nodes: vec![left, right, join],
            edges: vec![edge("l", "j"), edge("r", "j")],
        };
        let schemas = propagate_schemas(&graph, no_catalog).unwrap();
        let joined = &schemas[&NodeId("j".into())];
        assert_eq!(joined.len(), 3);
        assert_eq!(joined[0].name, "id");
        assert_eq!(joined[1].name, "name");
        assert_eq!(joined[2].name, "amount");
    }

    #[test]
    fn cycle_is_rejected() {
        let graph = Graph {
            nodes: vec![
                node("a", NodeKind::Filter, JsonValue::Null),
                node("b", NodeKind::Filter, JsonValue::Null),
            ],
            edges: vec![edge("a", "b"), edge("b", "a")],
        };
        let err = propagate_schemas(&graph, no_catalog).unwrap_err();
        assert!(matches!(err, ValidationError::CycleDetected(_)));
    }

    #[test]
    fn join_missing_second_input_is_rejected() {
        let graph = Graph {
            nodes: vec![
                node("l", NodeKind::DataSource, serde_json::json!({"columns": []})),
                node("j", NodeKind::Join, JsonValue::Null),
            ],
            edges: vec![edge("l", "j")],
        };
        let err = propagate_schemas(&graph, no_catalog).unwrap_err();
        assert!(matches!(err, ValidationError::MissingInput { .. }));
    }

    #[test]
    fn formula_appends_computed_column() {
        let graph = Graph {
            nodes: vec![
                node("s", NodeKind::DataSource, serde_json::json!({"columns": []})),
                node(
                    "fm",
                    NodeKind::Formula,
                    serde_json::json!({"output_column": "margin", "output_dtype": "float64"}),
                ),
            ],
            edges: vec![edge("s", "fm")],
        };
        let schemas = propagate_schemas(&graph, no_catalog).unwrap();
        let out = &schemas[&NodeId("fm".into())];
        assert_eq!(out.last().unwrap().name, "margin");
        assert_eq!(out.last().unwrap().dtype, DType::Float64);
        assert!(out.last().unwrap().nullable);
    }

    #[test]
    fn rename_rejects_a_target_name_with_sql_metacharacters() {
        let graph = Graph {
            nodes: vec![
                node(
                    "s",
                    NodeKind::DataSource,
                    serde_json::json!({"columns": [{"name": "price", "dtype": "float64", "nullable": false}]}),
                ),
                node(
                    "ren",
                    NodeKind::Rename,
                    serde_json::json!({"rename_map": {"price": "x); DROP TABLE trades;--"}}),
                ),
            ],
            edges: vec![edge("s", "ren")],
        };
        let err = propagate_schemas(&graph, no_catalog).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidIdentifier(_)));
    }

    #[test]
    fn formula_rejects_an_output_column_with_sql_metacharacters() {
        let graph = Graph {
            nodes: vec![
                node("s", NodeKind::DataSource, serde_json::json!({"columns": []})),
                node(
                    "fm",
                    NodeKind::Formula,
                    serde_json::json!({"output_column": "a; DROP TABLE trades;--"}),
                ),
            ],
            edges: vec![edge("s", "fm")],
        };
        let err = propagate_schemas(&graph, no_catalog).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidIdentifier(_)));
    }
}
