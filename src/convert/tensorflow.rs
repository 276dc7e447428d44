use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

use crate::onnx::wire::{Reader, WIRE_FIXED32, WIRE_LEN, WIRE_VARINT};
use crate::onnx::{
    check_model, Dim, ElemType, OnnxGraph, OnnxModel, OnnxNode, OnnxTensor, ValueInfo,
    OPSET_VERSION,
};

// tensorflow DataType values we accept in Const nodes
const DT_FLOAT: u64 = 1;
const DT_INT32: u64 = 3;
const DT_INT64: u64 = 9;

/// Converts a TensorFlow SavedModel directory to ONNX.
///
/// Only frozen inference graphs are supported: constants become ONNX
/// initializers and the op subset below maps one-to-one. Graphs that
/// still reference resource variables are rejected with a freeze hint.
/// The single input tensor is named `input`; unknown placeholder
/// dimensions fall back to the requested input size.
pub fn export(saved_model: &Path, output: &Path, input_size: [i64; 4]) -> Result<()> {
    println!("Loading TensorFlow model from {}...", saved_model.display());

    let pb_path = saved_model.join("saved_model.pb");
    if !pb_path.is_file() {
        bail!(
            "{} is not a SavedModel directory (no saved_model.pb inside)",
            saved_model.display()
        );
    }
    let bytes = std::fs::read(&pb_path)
        .with_context(|| format!("reading {}", pb_path.display()))?;

    let tf = parse_saved_model(&bytes).context("decoding saved_model.pb")?;
    debug!(nodes = tf.nodes.len(), "graph def decoded");

    let graph = map_graph(tf, input_size)?;
    let input_dims = graph.inputs[0].dims.clone();
    let model = OnnxModel::new(graph);
    check_model(&model)?;
    model.save(output)?;

    let rendered: Vec<String> = input_dims
        .iter()
        .map(|d| match d {
            Dim::Value(v) => v.to_string(),
            Dim::Param(p) => p.clone(),
        })
        .collect();
    println!("Model input shape: ({})", rendered.join(", "));
    println!("✓ Model exported to {}", output.display());
    println!("  Opset version: {}", OPSET_VERSION);
    Ok(())
}

#[derive(Debug, Default)]
pub(crate) struct TfGraph {
    pub nodes: Vec<TfNode>,
}

#[derive(Debug, Default)]
pub(crate) struct TfNode {
    pub name: String,
    pub op: String,
    pub inputs: Vec<String>,
    /// raw AttrValue payloads keyed by attribute name
    pub attrs: HashMap<String, Vec<u8>>,
}

// SavedModel: meta_graphs=2; MetaGraphDef: graph_def=2; GraphDef: node=1
pub(crate) fn parse_saved_model(bytes: &[u8]) -> Result<TfGraph> {
    let mut r = Reader::new(bytes);
    let mut graph_def: Option<Vec<u8>> = None;
    while let Some((field, wire)) = r.next_field()? {
        match (field, wire) {
            (2, WIRE_LEN) => {
                let meta = r.read_bytes()?;
                if graph_def.is_none() {
                    let mut mr = Reader::new(meta);
                    while let Some((f, w)) = mr.next_field()? {
                        match (f, w) {
                            (2, WIRE_LEN) => graph_def = Some(mr.read_bytes()?.to_vec()),
                            _ => mr.skip(w)?,
                        }
                    }
                }
            }
            _ => r.skip(wire)?,
        }
    }
    let graph_def = graph_def.context("saved model contains no graph def")?;
    parse_graph_def(&graph_def)
}

fn parse_graph_def(bytes: &[u8]) -> Result<TfGraph> {
    let mut r = Reader::new(bytes);
    let mut graph = TfGraph::default();
    while let Some((field, wire)) = r.next_field()? {
        match (field, wire) {
            (1, WIRE_LEN) => graph.nodes.push(parse_node_def(r.read_bytes()?)?),
            _ => r.skip(wire)?,
        }
    }
    Ok(graph)
}

// NodeDef: name=1, op=2, input=3, attr=5 (map<string, AttrValue>)
fn parse_node_def(bytes: &[u8]) -> Result<TfNode> {
    let mut r = Reader::new(bytes);
    let mut node = TfNode::default();
    while let Some((field, wire)) = r.next_field()? {
        match (field, wire) {
            (1, WIRE_LEN) => node.name = r.read_string()?,
            (2, WIRE_LEN) => node.op = r.read_string()?,
            (3, WIRE_LEN) => node.inputs.push(r.read_string()?),
            (5, WIRE_LEN) => {
                let entry = r.read_bytes()?;
                let mut er = Reader::new(entry);
                let mut key = String::new();
                let mut value = Vec::new();
                while let Some((f, w)) = er.next_field()? {
                    match (f, w) {
                        (1, WIRE_LEN) => key = er.read_string()?,
                        (2, WIRE_LEN) => value = er.read_bytes()?.to_vec(),
                        _ => er.skip(w)?,
                    }
                }
                node.attrs.insert(key, value);
            }
            _ => r.skip(wire)?,
        }
    }
    Ok(node)
}

// AttrValue: shape=7; TensorShapeProto: dim=2 (Dim: size=1)
fn parse_shape_attr(bytes: &[u8]) -> Result<Vec<i64>> {
    let mut r = Reader::new(bytes);
    let mut dims = Vec::new();
    while let Some((field, wire)) = r.next_field()? {
        match (field, wire) {
            (7, WIRE_LEN) => {
                let mut sr = Reader::new(r.read_bytes()?);
                while let Some((f, w)) = sr.next_field()? {
                    match (f, w) {
                        (2, WIRE_LEN) => {
                            let mut dr = Reader::new(sr.read_bytes()?);
                            let mut size = -1i64;
                            while let Some((df, dw)) = dr.next_field()? {
                                match (df, dw) {
                                    (1, WIRE_VARINT) => size = dr.read_i64()?,
                                    _ => dr.skip(dw)?,
                                }
                            }
                            dims.push(size);
                        }
                        _ => sr.skip(w)?,
                    }
                }
            }
            _ => r.skip(wire)?,
        }
    }
    Ok(dims)
}

// AttrValue: tensor=8; TensorProto: dtype=1, tensor_shape=2,
// tensor_content=4, float_val=5, int_val=7, int64_val=10
fn parse_const_attr(name: &str, bytes: &[u8]) -> Result<OnnxTensor> {
    let mut r = Reader::new(bytes);
    let mut tensor_bytes = None;
    while let Some((field, wire)) = r.next_field()? {
        match (field, wire) {
            (8, WIRE_LEN) => tensor_bytes = Some(r.read_bytes()?),
            _ => r.skip(wire)?,
        }
    }
    let tensor_bytes = tensor_bytes.with_context(|| format!("Const '{}' has no tensor", name))?;

    let mut r = Reader::new(tensor_bytes);
    let mut dtype = 0u64;
    let mut dims: Vec<i64> = Vec::new();
    let mut content: Vec<u8> = Vec::new();
    let mut floats: Vec<f32> = Vec::new();
    let mut ints: Vec<i64> = Vec::new();
    while let Some((field, wire)) = r.next_field()? {
        match (field, wire) {
            (1, WIRE_VARINT) => dtype = r.read_varint()?,
            (2, WIRE_LEN) => {
                let mut sr = Reader::new(r.read_bytes()?);
                while let Some((f, w)) = sr.next_field()? {
                    match (f, w) {
                        (2, WIRE_LEN) => {
                            let mut dr = Reader::new(sr.read_bytes()?);
                            let mut size = 0i64;
                            while let Some((df, dw)) = dr.next_field()? {
                                match (df, dw) {
                                    (1, WIRE_VARINT) => size = dr.read_i64()?,
                                    _ => dr.skip(dw)?,
                                }
                            }
                            dims.push(size);
                        }
                        _ => sr.skip(w)?,
                    }
                }
            }
            (4, WIRE_LEN) => content = r.read_bytes()?.to_vec(),
            (5, WIRE_LEN) => {
                let data = r.read_bytes()?;
                floats.extend(
                    data.chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                );
            }
            (5, WIRE_FIXED32) => floats.push(f32::from_bits(r.read_fixed32()?)),
            (7, WIRE_VARINT) => ints.push(r.read_i64()?),
            (7, WIRE_LEN) => r.read_packed_i64(&mut ints)?,
            (10, WIRE_VARINT) => ints.push(r.read_i64()?),
            (10, WIRE_LEN) => r.read_packed_i64(&mut ints)?,
            _ => r.skip(wire)?,
        }
    }

    match dtype {
        DT_FLOAT => {
            let values: Vec<f32> = if !content.is_empty() {
                content
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect()
            } else {
                floats
            };
            Ok(OnnxTensor::from_f32(name, dims, &values))
        }
        DT_INT32 => {
            // ONNX shape/index inputs want int64
            let values: Vec<i64> = if !content.is_empty() {
                content
                    .chunks_exact(4)
                    .map(|c| i64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                    .collect()
            } else {
                ints
            };
            Ok(OnnxTensor::from_i64(name, dims, &values))
        }
        DT_INT64 => {
            let values: Vec<i64> = if !content.is_empty() {
                content
                    .chunks_exact(8)
                    .map(|c| {
                        i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                    })
                    .collect()
            } else {
                ints
            };
            Ok(OnnxTensor::from_i64(name, dims, &values))
        }
        other => bail!("Const '{}' has unsupported dtype {}", name, other),
    }
}

/// TF input refs carry an output index (`node:1`) and control edges
/// (`^node`); normalize to the plain producer name.
fn normalize_input(raw: &str) -> Option<String> {
    if raw.starts_with('^') {
        return None;
    }
    let name = raw.split(':').next().unwrap_or(raw);
    Some(name.to_string())
}

fn map_graph(tf: TfGraph, input_size: [i64; 4]) -> Result<OnnxGraph> {
    let resource_ops = ["VarHandleOp", "ReadVariableOp", "VariableV2", "AssignVariableOp"];
    if let Some(node) = tf.nodes.iter().find(|n| resource_ops.contains(&n.op.as_str())) {
        bail!(
            "graph still references resource variable '{}' ({}); \
             freeze the graph (convert variables to constants) before converting",
            node.name,
            node.op
        );
    }

    let mut graph = OnnxGraph::new("tensorflow");
    let mut placeholder: Option<String> = None;
    let mut mapped: Vec<OnnxNode> = Vec::new();

    for node in &tf.nodes {
        match node.op.as_str() {
            "Placeholder" => {
                if placeholder.is_some() {
                    bail!("multiple Placeholder nodes; expected a single model input");
                }
                let declared = node
                    .attrs
                    .get("shape")
                    .map(|raw| parse_shape_attr(raw))
                    .transpose()?
                    .unwrap_or_default();
                let dims = resolve_input_dims(&declared, input_size)?;
                graph.inputs.push(ValueInfo::f32("input", dims));
                placeholder = Some(node.name.clone());
            }
            "Const" => {
                let raw = node
                    .attrs
                    .get("value")
                    .with_context(|| format!("Const '{}' has no value attr", node.name))?;
                graph.initializers.push(parse_const_attr(&node.name, raw)?);
            }
            "NoOp" => {}
            op => {
                let onnx_op = match op {
                    "MatMul" => "MatMul",
                    "BiasAdd" | "Add" | "AddV2" => "Add",
                    "Relu" => "Relu",
                    "Softmax" => "Softmax",
                    "Identity" => "Identity",
                    "Reshape" => "Reshape",
                    other => bail!(
                        "unsupported TensorFlow op '{}' (node '{}')",
                        other,
                        node.name
                    ),
                };
                let inputs: Vec<String> =
                    node.inputs.iter().filter_map(|i| normalize_input(i)).collect();
                mapped.push(OnnxNode::new(
                    node.name.clone(),
                    onnx_op,
                    inputs,
                    vec![node.name.clone()],
                ));
            }
        }
    }

    let placeholder = placeholder.context("graph has no Placeholder input node")?;
    if mapped.is_empty() {
        bail!("graph has no computation nodes to convert");
    }

    for node in &mut mapped {
        for input in &mut node.inputs {
            if *input == placeholder {
                *input = "input".to_string();
            }
        }
    }

    // the terminal node: its output feeds nothing else in the graph
    let consumed: HashSet<&str> = mapped
        .iter()
        .flat_map(|n| n.inputs.iter())
        .map(|s| s.as_str())
        .collect();
    let terminal = mapped
        .iter()
        .rposition(|n| !consumed.contains(n.outputs[0].as_str()))
        .context("graph has no terminal node")?;
    mapped[terminal].outputs[0] = "output".to_string();

    graph.nodes = mapped;
    graph.outputs.push(ValueInfo {
        name: "output".to_string(),
        elem_type: ElemType::F32,
        dims: Vec::new(),
    });
    Ok(graph)
}

fn resolve_input_dims(declared: &[i64], input_size: [i64; 4]) -> Result<Vec<Dim>> {
    if declared.is_empty() {
        return Ok(input_size.iter().map(|&v| Dim::Value(v)).collect());
    }
    let mut dims = Vec::with_capacity(declared.len());
    for (axis, &size) in declared.iter().enumerate() {
        if size > 0 {
            dims.push(Dim::Value(size));
        } else if axis == 0 {
            dims.push(Dim::batch());
        } else if declared.len() == 4 {
            dims.push(Dim::Value(input_size[axis]));
        } else {
            bail!(
                "cannot infer dimension {} of the model input; the saved model \
                 declares it unknown and --input-size only covers rank-4 inputs",
                axis
            );
        }
    }
    Ok(dims)
}
