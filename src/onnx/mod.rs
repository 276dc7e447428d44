use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

pub mod checker;
pub mod wire;

use wire::{Reader, Writer, WIRE_LEN, WIRE_VARINT};

pub use checker::check_model;

/// ONNX IR version written by this tool.
pub const IR_VERSION: i64 = 8;
/// Operator set version for all exported and optimized models.
pub const OPSET_VERSION: i64 = 14;

const PRODUCER_NAME: &str = "triage-convert";

/// Tensor element types, numbered as in the ONNX data type enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    F32,
    U8,
    I64,
    Unknown(u64),
}

impl ElemType {
    pub fn code(self) -> u64 {
        match self {
            ElemType::F32 => 1,
            ElemType::U8 => 2,
            ElemType::I64 => 7,
            ElemType::Unknown(v) => v,
        }
    }

    pub fn from_code(code: u64) -> Self {
        match code {
            1 => ElemType::F32,
            2 => ElemType::U8,
            7 => ElemType::I64,
            other => ElemType::Unknown(other),
        }
    }

    /// Bytes per element, None when the type is not one we handle.
    pub fn byte_size(self) -> Option<usize> {
        match self {
            ElemType::F32 => Some(4),
            ElemType::U8 => Some(1),
            ElemType::I64 => Some(8),
            ElemType::Unknown(_) => None,
        }
    }
}

/// A weight tensor carried in the graph, payload stored little-endian
/// in `raw_data` exactly as the wire format keeps it.
#[derive(Debug, Clone)]
pub struct OnnxTensor {
    pub name: String,
    pub dims: Vec<i64>,
    pub elem_type: ElemType,
    pub raw_data: Vec<u8>,
}

impl OnnxTensor {
    pub fn from_f32(name: impl Into<String>, dims: Vec<i64>, values: &[f32]) -> Self {
        let raw_data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            name: name.into(),
            dims,
            elem_type: ElemType::F32,
            raw_data,
        }
    }

    pub fn from_u8(name: impl Into<String>, dims: Vec<i64>, values: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            dims,
            elem_type: ElemType::U8,
            raw_data: values,
        }
    }

    pub fn from_i64(name: impl Into<String>, dims: Vec<i64>, values: &[i64]) -> Self {
        let raw_data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            name: name.into(),
            dims,
            elem_type: ElemType::I64,
            raw_data,
        }
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().map(|&d| d.max(0) as usize).product()
    }

    pub fn as_f32_vec(&self) -> Result<Vec<f32>> {
        if self.elem_type != ElemType::F32 {
            bail!("tensor {} is not float32", self.name);
        }
        Ok(self
            .raw_data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// One dimension of a value-info shape: fixed size or a named symbol
/// (used for the variable batch axis).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Value(i64),
    Param(String),
}

impl Dim {
    pub fn batch() -> Self {
        Dim::Param("batch_size".to_string())
    }
}

/// Typed graph input or output.
#[derive(Debug, Clone)]
pub struct ValueInfo {
    pub name: String,
    pub elem_type: ElemType,
    pub dims: Vec<Dim>,
}

impl ValueInfo {
    pub fn f32(name: impl Into<String>, dims: Vec<Dim>) -> Self {
        Self {
            name: name.into(),
            elem_type: ElemType::F32,
            dims,
        }
    }
}

/// Attribute payloads we read and write. Anything else in a decoded
/// file is dropped; the ops this tool emits only use these.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub value: AttrValue,
}

#[derive(Debug, Clone)]
pub struct OnnxNode {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Vec<Attribute>,
}

impl OnnxNode {
    pub fn new(
        name: impl Into<String>,
        op_type: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            inputs,
            outputs,
            attributes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OnnxGraph {
    pub name: String,
    pub nodes: Vec<OnnxNode>,
    pub initializers: Vec<OnnxTensor>,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
}

impl OnnxGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct OnnxModel {
    pub ir_version: i64,
    pub opset_version: i64,
    pub producer_name: String,
    pub graph: OnnxGraph,
}

impl OnnxModel {
    pub fn new(graph: OnnxGraph) -> Self {
        Self {
            ir_version: IR_VERSION,
            opset_version: OPSET_VERSION,
            producer_name: PRODUCER_NAME.to_string(),
            graph,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = self.to_bytes();
        fs::write(&path, bytes)
            .with_context(|| format!("writing {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(&path)
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("decoding {}", path.as_ref().display()))
    }

    // ModelProto: ir_version=1, producer_name=2, graph=7, opset_import=8
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_i64(1, self.ir_version);
        w.write_string(2, &self.producer_name);
        w.write_message(7, encode_graph(&self.graph));

        // OperatorSetIdProto: domain=1 (default ai.onnx), version=2
        let mut opset = Writer::new();
        opset.write_i64(2, self.opset_version);
        w.write_message(8, opset);

        w.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let mut ir_version = 0;
        let mut producer_name = String::new();
        let mut opset_version = 0;
        let mut graph = None;

        while let Some((field, wire)) = r.next_field()? {
            match (field, wire) {
                (1, WIRE_VARINT) => ir_version = r.read_i64()?,
                (2, WIRE_LEN) => producer_name = r.read_string()?,
                (7, WIRE_LEN) => graph = Some(decode_graph(r.read_bytes()?)?),
                (8, WIRE_LEN) => {
                    let mut or = Reader::new(r.read_bytes()?);
                    while let Some((f, w)) = or.next_field()? {
                        match (f, w) {
                            (2, WIRE_VARINT) => opset_version = or.read_i64()?,
                            _ => or.skip(w)?,
                        }
                    }
                }
                _ => r.skip(wire)?,
            }
        }

        let graph = graph.context("model has no graph")?;
        Ok(Self {
            ir_version,
            opset_version,
            producer_name,
            graph,
        })
    }
}

// GraphProto: node=1, name=2, initializer=5, input=11, output=12
fn encode_graph(graph: &OnnxGraph) -> Writer {
    let mut w = Writer::new();
    for node in &graph.nodes {
        w.write_message(1, encode_node(node));
    }
    w.write_string(2, &graph.name);
    for tensor in &graph.initializers {
        w.write_message(5, encode_tensor(tensor));
    }
    for vi in &graph.inputs {
        w.write_message(11, encode_value_info(vi));
    }
    for vi in &graph.outputs {
        w.write_message(12, encode_value_info(vi));
    }
    w
}

fn decode_graph(bytes: &[u8]) -> Result<OnnxGraph> {
    let mut r = Reader::new(bytes);
    let mut graph = OnnxGraph::default();
    while let Some((field, wire)) = r.next_field()? {
        match (field, wire) {
            (1, WIRE_LEN) => graph.nodes.push(decode_node(r.read_bytes()?)?),
            (2, WIRE_LEN) => graph.name = r.read_string()?,
            (5, WIRE_LEN) => graph.initializers.push(decode_tensor(r.read_bytes()?)?),
            (11, WIRE_LEN) => graph.inputs.push(decode_value_info(r.read_bytes()?)?),
            (12, WIRE_LEN) => graph.outputs.push(decode_value_info(r.read_bytes()?)?),
            _ => r.skip(wire)?,
        }
    }
    Ok(graph)
}

// NodeProto: input=1, output=2, name=3, op_type=4, attribute=5
fn encode_node(node: &OnnxNode) -> Writer {
    let mut w = Writer::new();
    for input in &node.inputs {
        w.write_string(1, input);
    }
    for output in &node.outputs {
        w.write_string(2, output);
    }
    w.write_string(3, &node.name);
    w.write_string(4, &node.op_type);
    for attr in &node.attributes {
        w.write_message(5, encode_attribute(attr));
    }
    w
}

fn decode_node(bytes: &[u8]) -> Result<OnnxNode> {
    let mut r = Reader::new(bytes);
    let mut node = OnnxNode::new("", "", Vec::new(), Vec::new());
    while let Some((field, wire)) = r.next_field()? {
        match (field, wire) {
            (1, WIRE_LEN) => node.inputs.push(r.read_string()?),
            (2, WIRE_LEN) => node.outputs.push(r.read_string()?),
            (3, WIRE_LEN) => node.name = r.read_string()?,
            (4, WIRE_LEN) => node.op_type = r.read_string()?,
            (5, WIRE_LEN) => {
                if let Some(attr) = decode_attribute(r.read_bytes()?)? {
                    node.attributes.push(attr);
                }
            }
            _ => r.skip(wire)?,
        }
    }
    Ok(node)
}

// AttributeProto: name=1, f=2, i=3, ints=8, type=20
// AttributeType: FLOAT=1, INT=2, INTS=7
fn encode_attribute(attr: &Attribute) -> Writer {
    let mut w = Writer::new();
    w.write_string(1, &attr.name);
    match &attr.value {
        AttrValue::Float(v) => {
            w.write_float(2, *v);
            w.write_varint(20, 1);
        }
        AttrValue::Int(v) => {
            w.write_i64(3, *v);
            w.write_varint(20, 2);
        }
        AttrValue::Ints(vs) => {
            for v in vs {
                w.write_i64(8, *v);
            }
            w.write_varint(20, 7);
        }
    }
    w
}

fn decode_attribute(bytes: &[u8]) -> Result<Option<Attribute>> {
    let mut r = Reader::new(bytes);
    let mut name = String::new();
    let mut float_val = None;
    let mut int_val = None;
    let mut ints = Vec::new();
    let mut attr_type = 0;
    while let Some((field, wire)) = r.next_field()? {
        match (field, wire) {
            (1, WIRE_LEN) => name = r.read_string()?,
            (2, wire::WIRE_FIXED32) => float_val = Some(f32::from_bits(r.read_fixed32()?)),
            (3, WIRE_VARINT) => int_val = Some(r.read_i64()?),
            (8, WIRE_VARINT) => ints.push(r.read_i64()?),
            (8, WIRE_LEN) => r.read_packed_i64(&mut ints)?,
            (20, WIRE_VARINT) => attr_type = r.read_varint()?,
            _ => r.skip(wire)?,
        }
    }
    let value = match attr_type {
        1 => AttrValue::Float(float_val.unwrap_or(0.0)),
        2 => AttrValue::Int(int_val.unwrap_or(0)),
        7 => AttrValue::Ints(ints),
        // attribute kinds we do not model (strings, tensors, graphs)
        _ => return Ok(None),
    };
    Ok(Some(Attribute { name, value }))
}

// TensorProto: dims=1, data_type=2, name=8, raw_data=9
fn encode_tensor(tensor: &OnnxTensor) -> Writer {
    let mut w = Writer::new();
    w.write_packed_i64(1, &tensor.dims);
    w.write_varint(2, tensor.elem_type.code());
    w.write_string(8, &tensor.name);
    w.write_bytes(9, &tensor.raw_data);
    w
}

fn decode_tensor(bytes: &[u8]) -> Result<OnnxTensor> {
    let mut r = Reader::new(bytes);
    let mut tensor = OnnxTensor {
        name: String::new(),
        dims: Vec::new(),
        elem_type: ElemType::Unknown(0),
        raw_data: Vec::new(),
    };
    let mut float_data: Vec<f32> = Vec::new();
    while let Some((field, wire)) = r.next_field()? {
        match (field, wire) {
            (1, WIRE_LEN) => r.read_packed_i64(&mut tensor.dims)?,
            (1, WIRE_VARINT) => tensor.dims.push(r.read_i64()?),
            (2, WIRE_VARINT) => tensor.elem_type = ElemType::from_code(r.read_varint()?),
            (4, WIRE_LEN) => {
                // float_data, packed: producers may use it instead of raw_data
                let data = r.read_bytes()?;
                float_data.extend(
                    data.chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                );
            }
            (4, wire::WIRE_FIXED32) => {
                float_data.push(f32::from_bits(r.read_fixed32()?));
            }
            (8, WIRE_LEN) => tensor.name = r.read_string()?,
            (9, WIRE_LEN) => tensor.raw_data = r.read_bytes()?.to_vec(),
            _ => r.skip(wire)?,
        }
    }
    if tensor.raw_data.is_empty() && !float_data.is_empty() {
        tensor.raw_data = float_data.iter().flat_map(|v| v.to_le_bytes()).collect();
    }
    Ok(tensor)
}

// ValueInfoProto: name=1, type=2
// TypeProto.tensor_type=1; Tensor: elem_type=1, shape=2
// TensorShapeProto.dim=1; Dimension: dim_value=1, dim_param=2
fn encode_value_info(vi: &ValueInfo) -> Writer {
    let mut shape = Writer::new();
    for dim in &vi.dims {
        let mut d = Writer::new();
        match dim {
            Dim::Value(v) => d.write_i64(1, *v),
            Dim::Param(p) => d.write_string(2, p),
        }
        shape.write_message(1, d);
    }

    let mut tensor_type = Writer::new();
    tensor_type.write_varint(1, vi.elem_type.code());
    tensor_type.write_message(2, shape);

    let mut type_proto = Writer::new();
    type_proto.write_message(1, tensor_type);

    let mut w = Writer::new();
    w.write_string(1, &vi.name);
    w.write_message(2, type_proto);
    w
}

fn decode_value_info(bytes: &[u8]) -> Result<ValueInfo> {
    let mut r = Reader::new(bytes);
    let mut vi = ValueInfo {
        name: String::new(),
        elem_type: ElemType::Unknown(0),
        dims: Vec::new(),
    };
    while let Some((field, wire)) = r.next_field()? {
        match (field, wire) {
            (1, WIRE_LEN) => vi.name = r.read_string()?,
            (2, WIRE_LEN) => {
                let mut tr = Reader::new(r.read_bytes()?);
                while let Some((f, w)) = tr.next_field()? {
                    match (f, w) {
                        (1, WIRE_LEN) => decode_tensor_type(tr.read_bytes()?, &mut vi)?,
                        _ => tr.skip(w)?,
                    }
                }
            }
            _ => r.skip(wire)?,
        }
    }
    Ok(vi)
}

fn decode_tensor_type(bytes: &[u8], vi: &mut ValueInfo) -> Result<()> {
    let mut r = Reader::new(bytes);
    while let Some((field, wire)) = r.next_field()? {
        match (field, wire) {
            (1, WIRE_VARINT) => vi.elem_type = ElemType::from_code(r.read_varint()?),
            (2, WIRE_LEN) => {
                let mut sr = Reader::new(r.read_bytes()?);
                while let Some((f, w)) = sr.next_field()? {
                    match (f, w) {
                        (1, WIRE_LEN) => {
                            let mut dr = Reader::new(sr.read_bytes()?);
                            let mut dim = None;
                            while let Some((df, dw)) = dr.next_field()? {
                                match (df, dw) {
                                    (1, WIRE_VARINT) => dim = Some(Dim::Value(dr.read_i64()?)),
                                    (2, WIRE_LEN) => dim = Some(Dim::Param(dr.read_string()?)),
                                    _ => dr.skip(dw)?,
                                }
                            }
                            vi.dims.push(dim.unwrap_or(Dim::Value(0)));
                        }
                        _ => sr.skip(w)?,
                    }
                }
            }
            _ => r.skip(wire)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> OnnxModel {
        let mut graph = OnnxGraph::new("triage");
        graph.inputs.push(ValueInfo::f32(
            "input",
            vec![Dim::batch(), Dim::Value(3), Dim::Value(224), Dim::Value(224)],
        ));
        graph.outputs.push(ValueInfo::f32(
            "output",
            vec![Dim::batch(), Dim::Value(4)],
        ));
        graph.initializers.push(OnnxTensor::from_f32(
            "fc.weight",
            vec![4, 3],
            &[0.1, -0.2, 0.3, 0.4, -0.5, 0.6, 0.7, -0.8, 0.9, 1.0, -1.1, 1.2],
        ));
        let mut node = OnnxNode::new(
            "fc",
            "MatMul",
            vec!["input".into(), "fc.weight".into()],
            vec!["output".into()],
        );
        node.attributes.push(Attribute {
            name: "axis".to_string(),
            value: AttrValue::Int(1),
        });
        graph.nodes.push(node);
        OnnxModel::new(graph)
    }

    #[test]
    fn model_round_trip_preserves_structure() {
        let model = sample_model();
        let bytes = model.to_bytes();
        let decoded = OnnxModel::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.ir_version, IR_VERSION);
        assert_eq!(decoded.opset_version, OPSET_VERSION);
        assert_eq!(decoded.producer_name, "triage-convert");
        assert_eq!(decoded.graph.name, "triage");
        assert_eq!(decoded.graph.nodes.len(), 1);
        assert_eq!(decoded.graph.nodes[0].op_type, "MatMul");
        assert_eq!(decoded.graph.nodes[0].attributes.len(), 1);
        assert_eq!(
            decoded.graph.nodes[0].attributes[0].value,
            AttrValue::Int(1)
        );
        assert_eq!(decoded.graph.initializers[0].name, "fc.weight");
        assert_eq!(decoded.graph.initializers[0].dims, vec![4, 3]);
        assert_eq!(
            decoded.graph.initializers[0].as_f32_vec().unwrap()[1],
            -0.2
        );
        assert_eq!(decoded.graph.inputs[0].dims[0], Dim::batch());
    }

    #[test]
    fn model_without_graph_is_rejected() {
        let mut w = Writer::new();
        w.write_i64(1, IR_VERSION);
        let err = OnnxModel::from_bytes(&w.into_bytes()).unwrap_err();
        assert!(err.to_string().contains("no graph"));
    }

    #[test]
    fn float_data_fallback_fills_raw_data() {
        // a tensor encoded with float_data instead of raw_data
        let mut t = Writer::new();
        t.write_packed_i64(1, &[2]);
        t.write_varint(2, ElemType::F32.code());
        t.write_string(8, "w");
        let floats: Vec<u8> = [1.5f32, -2.5]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        t.write_bytes(4, &floats);

        let tensor = decode_tensor(&t.into_bytes()).unwrap();
        assert_eq!(tensor.as_f32_vec().unwrap(), vec![1.5, -2.5]);
    }
}
