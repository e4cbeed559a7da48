//! Auto-fuse mode: derive records from a GE graph dump instead of a
//! captured manifest. Each graph op that the dump run saved tensors for
//! becomes one record; fused nodes and op types without a golden become
//! `UNSUPPORTED` rows.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use opk_ops::{OpKind, OpParam};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::record::{Record, TensorSource};

const ORIGINAL_OP_TYPES: &str = "_datadump_original_op_types";

pub fn load_graph(path: &Path) -> Result<Value, String> {
    let raw = fs::read_to_string(path)
        .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
    serde_json::from_str(&raw).map_err(|err| format!("failed parsing {}: {err}", path.display()))
}

#[must_use]
pub fn graph_names(model: &Value) -> Vec<String> {
    graphs(model)
        .filter_map(|g| g.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn graphs(model: &Value) -> impl Iterator<Item = &Value> {
    model
        .get("graph")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpInfo {
    pub name: String,
    /// Position of the op within its graph.
    pub position: usize,
    pub op_type: Vec<String>,
    pub input_desc: Vec<Value>,
    pub output_desc: Vec<Value>,
    /// GE attrs flattened to plain JSON values.
    pub attrs: Map<String, Value>,
    pub input_files: Vec<PathBuf>,
    pub output_files: Vec<PathBuf>,
}

impl OpInfo {
    fn from_op(position: usize, op: &Value) -> Option<Self> {
        let name = op.get("name")?.as_str()?.replace('/', "_");
        let op_type = op
            .get("type")
            .and_then(Value::as_str)
            .map(|t| vec![t.to_string()])
            .unwrap_or_default();
        let descs = |key: &str| {
            op.get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };
        let attrs = op
            .get("attr")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|attr| {
                        let key = attr.get("key")?.as_str()?;
                        Some((key.to_string(), flatten_attr(attr.get("value")?)))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            name,
            position,
            op_type,
            input_desc: descs("input_desc"),
            output_desc: descs("output_desc"),
            attrs,
            input_files: Vec::new(),
            output_files: Vec::new(),
        })
    }

    /// Fused nodes record the op types they were built from; prefer those.
    pub fn update_op_type(&mut self) {
        if let Some(Value::Array(types)) = self.attrs.get(ORIGINAL_OP_TYPES) {
            let types: Vec<String> = types
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            if !types.is_empty() {
                self.op_type = types;
            }
        }
    }

    fn attr(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    /// Builds the record for this op, or the reason it cannot be verified.
    pub fn to_record(&self, op_id: String) -> Result<Record, String> {
        let [ge_type] = self.op_type.as_slice() else {
            return Err(format!(
                "fused node of {} original ops ({}) has no golden",
                self.op_type.len(),
                self.op_type.join("+")
            ));
        };
        let (kind, op_param) = translate(ge_type, self)
            .ok_or_else(|| format!("op type {ge_type} has no golden"))?;
        let sources = |files: &[PathBuf]| {
            files
                .iter()
                .map(|path| TensorSource::File { path: path.clone() })
                .collect::<Vec<_>>()
        };
        Ok(Record {
            op_id,
            op_name: kind.operation_name(),
            op_param: OpParam::from_value(Value::Object(op_param)),
            tensor_path: None,
            inputs: sources(&self.input_files),
            outputs: (!self.output_files.is_empty()).then(|| sources(&self.output_files)),
            rank: None,
            pid: None,
        })
    }
}

/// `{"i": 3}` → `3`, `{"list": {"i": [1, 2]}}` → `[1, 2]`, and so on.
fn flatten_attr(value: &Value) -> Value {
    if let Some(list) = value.get("list") {
        for key in ["i", "f", "b", "s"] {
            if let Some(items) = list.get(key) {
                return items.clone();
            }
        }
        return Value::Array(Vec::new());
    }
    for key in ["i", "f", "b", "s", "dt"] {
        if let Some(scalar) = value.get(key) {
            return scalar.clone();
        }
    }
    value.clone()
}

/// Op name → info for every named op of `graph_name`.
#[must_use]
pub fn collect_op_infos(model: &Value, graph_name: &str) -> BTreeMap<String, OpInfo> {
    let Some(graph) =
        graphs(model).find(|g| g.get("name").and_then(Value::as_str) == Some(graph_name))
    else {
        return BTreeMap::new();
    };
    graph
        .get("op")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
        .filter_map(|(position, op)| OpInfo::from_op(position, op))
        .map(|info| (info.name.clone(), info))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

/// `<prefix>.<op>.<input|output>.<index>.npy`; the op name may itself hold dots.
fn parse_dump_name(file_name: &str) -> Option<(String, Direction, usize)> {
    let stem = file_name.strip_suffix(".npy")?;
    let mut parts = stem.rsplitn(3, '.');
    let index = parts.next()?.parse().ok()?;
    let direction = match parts.next()? {
        "input" => Direction::Input,
        "output" => Direction::Output,
        _ => return None,
    };
    let (_, op_name) = parts.next()?.split_once('.')?;
    (!op_name.is_empty()).then(|| (op_name.to_string(), direction, index))
}

/// Attaches dumped tensors in `dir` to their ops, ordered by index.
pub fn bind_dump_files(dir: &Path, infos: &mut BTreeMap<String, OpInfo>) -> Result<(), String> {
    let entries =
        fs::read_dir(dir).map_err(|err| format!("failed reading {}: {err}", dir.display()))?;
    let mut bound: BTreeMap<String, (Vec<(usize, PathBuf)>, Vec<(usize, PathBuf)>)> =
        BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(|err| format!("failed reading {}: {err}", dir.display()))?;
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((op_name, direction, index)) = parse_dump_name(file_name) else {
            warn!(file = file_name, "unsupported dump file name, ignored");
            continue;
        };
        if !infos.contains_key(&op_name) {
            debug!(file = file_name, "dump file for an op outside the graph");
            continue;
        }
        let slot = bound.entry(op_name).or_default();
        match direction {
            Direction::Input => slot.0.push((index, path)),
            Direction::Output => slot.1.push((index, path)),
        }
    }
    for (op_name, (mut inputs, mut outputs)) in bound {
        inputs.sort_by_key(|(index, _)| *index);
        outputs.sort_by_key(|(index, _)| *index);
        if let Some(info) = infos.get_mut(&op_name) {
            info.input_files = inputs.into_iter().map(|(_, p)| p).collect();
            info.output_files = outputs.into_iter().map(|(_, p)| p).collect();
        }
    }
    for info in infos.values_mut() {
        info.update_op_type();
    }
    Ok(())
}

/// A graph op after translation.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphCase {
    Supported(Record),
    Unsupported {
        op_id: String,
        op_name: String,
        reason: String,
    },
}

/// Every op with dumped tensors, in graph order. Ops that were never dumped
/// (constants, data nodes) are left out.
#[must_use]
pub fn derive_cases(graph_index: usize, infos: &BTreeMap<String, OpInfo>) -> Vec<GraphCase> {
    let mut ordered: Vec<&OpInfo> = infos
        .values()
        .filter(|info| !info.input_files.is_empty() || !info.output_files.is_empty())
        .collect();
    ordered.sort_by_key(|info| info.position);
    ordered
        .into_iter()
        .map(|info| {
            let op_id = format!("{graph_index}_{}", info.position);
            match info.to_record(op_id.clone()) {
                Ok(record) => GraphCase::Supported(record),
                Err(reason) => GraphCase::Unsupported {
                    op_id,
                    op_name: info.name.clone(),
                    reason,
                },
            }
        })
        .collect()
}

fn int_attr(info: &OpInfo, key: &str, default: i64) -> Value {
    info.attr(key)
        .and_then(Value::as_i64)
        .map_or_else(|| json!(default), |v| json!(v))
}

fn copy_attr(params: &mut Map<String, Value>, info: &OpInfo, from: &str, to: &str) {
    if let Some(value) = info.attr(from) {
        params.insert(to.to_string(), value.clone());
    }
}

/// Maps a GE op type and its attrs onto a registry kind and ATB parameters.
fn translate(ge_type: &str, info: &OpInfo) -> Option<(OpKind, Map<String, Value>)> {
    let mut params = Map::new();
    let kind = match ge_type {
        "ConcatD" | "ConcatV2D" => {
            let dim = info.attr("concat_dim").or_else(|| info.attr("axis"));
            params.insert("concatDim".into(), dim.cloned().unwrap_or_else(|| json!(0)));
            OpKind::Concat
        }
        "Cumsum" | "CumsumD" => {
            params.insert("axes".into(), json!([info.attr("axis").and_then(Value::as_i64).unwrap_or(0)]));
            copy_attr(&mut params, info, "exclusive", "exclusive");
            copy_attr(&mut params, info, "reverse", "reverse");
            OpKind::Cumsum
        }
        "MatMul" | "MatMulV2" | "BatchMatMul" | "BatchMatMulV2" => {
            let flag = |a: &str, b: &str| {
                info.attr(a)
                    .or_else(|| info.attr(b))
                    .cloned()
                    .unwrap_or(Value::Bool(false))
            };
            params.insert("transposeA".into(), flag("transpose_x1", "adj_x1"));
            params.insert("transposeB".into(), flag("transpose_x2", "adj_x2"));
            OpKind::MatMul
        }
        "Tile" | "TileD" => {
            params.insert("multiples".into(), info.attr("multiples")?.clone());
            OpKind::Repeat
        }
        "OneHot" | "OneHotD" => {
            params.insert("axis".into(), int_attr(info, "axis", -1));
            params.insert("depth".into(), info.attr("depth")?.clone());
            OpKind::Onehot
        }
        "ReduceSum" | "ReduceSumD" | "ReduceMax" | "ReduceMaxD" | "ReduceMin" | "ReduceMinD" => {
            let code = match ge_type.trim_end_matches('D') {
                "ReduceMax" => 1,
                "ReduceMin" => 2,
                _ => 3,
            };
            params.insert("reduceType".into(), json!(code));
            copy_attr(&mut params, info, "axes", "axis");
            OpKind::Reduce
        }
        "GatherV2" | "GatherV2D" => {
            params.insert("axis".into(), int_attr(info, "axis", 0));
            params.insert("batchDims".into(), int_attr(info, "batch_dims", 0));
            OpKind::Gather
        }
        "Relu" | "Gelu" | "FastGelu" | "Swish" => {
            let code = match ge_type {
                "Relu" => 1,
                "Gelu" => 2,
                "FastGelu" => 3,
                _ => 4,
            };
            params.insert("activationType".into(), json!(code));
            copy_attr(&mut params, info, "scale", "scale");
            OpKind::Activation
        }
        "SliceD" => {
            params.insert("offsets".into(), info.attr("offsets")?.clone());
            params.insert("size".into(), info.attr("size")?.clone());
            OpKind::Slice
        }
        "SplitD" => {
            params.insert("splitDim".into(), info.attr("split_dim")?.clone());
            params.insert("splitNum".into(), info.attr("num_split")?.clone());
            OpKind::Split
        }
        "AsStrided" => {
            params.insert("size".into(), info.attr("size")?.clone());
            params.insert("stride".into(), info.attr("stride")?.clone());
            let offset = info.attr("storage_offset").and_then(Value::as_i64).unwrap_or(0);
            params.insert("offset".into(), json!([offset]));
            OpKind::AsStrided
        }
        other => {
            let code = elewise_code(other)?;
            params.insert("elewiseType".into(), json!(code));
            match code {
                1 => params.insert("outTensorType".into(), info.attr("dst_type")?.clone()),
                2 => params.insert("varAttr".into(), info.attr("value")?.clone()),
                _ => None,
            };
            OpKind::Elewise
        }
    };
    Some((kind, params))
}

fn elewise_code(ge_type: &str) -> Option<i64> {
    Some(match ge_type {
        "Cast" => 1,
        "Muls" => 2,
        "Cos" => 3,
        "Sin" => 4,
        "Neg" => 5,
        "LogicalNot" => 7,
        "Add" => 8,
        "Mul" => 9,
        "RealDiv" => 10,
        "LogicalAnd" => 11,
        "LogicalOr" => 12,
        "Less" => 13,
        "Greater" => 14,
        "Sub" => 15,
        "Equal" => 16,
        "Tanh" => 20,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::{GraphCase, OpInfo, collect_op_infos, derive_cases, graph_names, parse_dump_name};
    use super::Direction;
    use opk_ops::OpKind;
    use serde_json::json;
    use std::path::PathBuf;

    fn model() -> serde_json::Value {
        json!({
            "graph": [
                {"name": "g0", "op": [
                    {"name": "scope/concat", "type": "ConcatD",
                     "attr": [{"key": "concat_dim", "value": {"i": 1}}]},
                    {"type": "Data"},
                    {"name": "fused", "type": "FusedMulAdd",
                     "attr": [{"key": "_datadump_original_op_types",
                               "value": {"list": {"s": ["Mul", "Add"]}}}]},
                    {"name": "conv", "type": "Conv2D"}
                ]},
                {"name": "g1"}
            ]
        })
    }

    #[test]
    fn lists_graphs_and_named_ops() {
        let model = model();
        assert_eq!(graph_names(&model), vec!["g0", "g1"]);
        let infos = collect_op_infos(&model, "g0");
        assert_eq!(infos.len(), 3);
        assert!(infos.contains_key("scope_concat"));
        assert_eq!(infos["scope_concat"].attrs["concat_dim"], json!(1));
        assert!(collect_op_infos(&model, "g1").is_empty());
        assert!(collect_op_infos(&model, "missing").is_empty());
    }

    #[test]
    fn original_types_replace_the_fused_type() {
        let infos = collect_op_infos(&model(), "g0");
        let mut fused: OpInfo = infos["fused"].clone();
        assert_eq!(fused.op_type, vec!["FusedMulAdd"]);
        fused.update_op_type();
        assert_eq!(fused.op_type, vec!["Mul", "Add"]);

        let mut plain = infos["conv"].clone();
        plain.update_op_type();
        assert_eq!(plain.op_type, vec!["Conv2D"]);
    }

    #[test]
    fn dump_names_parse_with_dotted_ops() {
        assert_eq!(
            parse_dump_name("prefix.op1.input.0.npy"),
            Some(("op1".to_string(), Direction::Input, 0))
        );
        assert_eq!(
            parse_dump_name("Add.1.layer.add.output.2.npy"),
            Some(("1.layer.add".to_string(), Direction::Output, 2))
        );
        assert_eq!(parse_dump_name("prefix.op1.weight.0.npy"), None);
        assert_eq!(parse_dump_name("prefix.op1.input.x.npy"), None);
        assert_eq!(parse_dump_name("notes.txt"), None);
    }

    #[test]
    fn derives_records_and_unsupported_rows() {
        let mut infos = collect_op_infos(&model(), "g0");
        for info in infos.values_mut() {
            info.update_op_type();
            info.input_files = vec![PathBuf::from(format!("/dump/p.{}.input.0.npy", info.name))];
            info.output_files = vec![PathBuf::from(format!("/dump/p.{}.output.0.npy", info.name))];
        }
        let cases = derive_cases(0, &infos);
        assert_eq!(cases.len(), 3);
        let GraphCase::Supported(concat) = &cases[0] else {
            panic!("concat should map to a record");
        };
        assert_eq!(concat.op_id, "0_0");
        assert_eq!(OpKind::from_name(&concat.op_name), Some(OpKind::Concat));
        assert_eq!(concat.op_param.get("concatDim"), Some(&json!(1)));
        assert!(concat.outputs.is_some());

        let GraphCase::Unsupported { op_id, reason, .. } = &cases[1] else {
            panic!("fused node is unsupported");
        };
        assert_eq!(op_id, "0_2");
        assert!(reason.contains("Mul+Add"));
        assert!(matches!(&cases[2], GraphCase::Unsupported { reason, .. } if reason.contains("Conv2D")));
    }

    #[test]
    fn elementwise_types_carry_their_extra_params() {
        let mut info = OpInfo {
            name: "cast".to_string(),
            op_type: vec!["Cast".to_string()],
            ..OpInfo::default()
        };
        info.attrs.insert("dst_type".to_string(), json!(1));
        let record = info.to_record("0_0".to_string()).expect("cast maps");
        assert_eq!(record.op_param.get("elewiseType"), Some(&json!(1)));
        assert_eq!(record.op_param.get("outTensorType"), Some(&json!(1)));
        assert!(record.outputs.is_none());

        info.attrs.clear();
        assert!(info.to_record("0_0".to_string()).is_err());
    }
}
