use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::format::{mebibytes, percent_reduction};
use crate::onnx::{check_model, OnnxModel, OnnxNode, OnnxTensor};

/// Weights below this element count stay f32: the scale/zero-point
/// bookkeeping and the extra DequantizeLinear node outweigh the saving.
pub const MIN_QUANT_ELEMENTS: usize = 1024;

/// Shrinks an exported model by storing large float32 weights as
/// unsigned 8-bit tensors restored at load time via DequantizeLinear.
/// Writes a new file next to the input; the input is never touched.
pub fn optimize(input: &Path, output: &Path) -> Result<()> {
    println!("Optimizing model: {}", input.display());

    let model = OnnxModel::load(input)?;
    check_model(&model).context("input model failed structural validation")?;

    let quantized = quantize_weights(model);
    check_model(&quantized).context("quantized model failed structural validation")?;
    quantized.save(output)?;

    let original = fs::metadata(input)?.len();
    let optimized = fs::metadata(output)?.len();
    println!("✓ Model optimized");
    println!("  Original size: {:.2} MiB", mebibytes(original));
    println!("  Optimized size: {:.2} MiB", mebibytes(optimized));
    println!("  Reduction: {:.1}%", percent_reduction(original, optimized));
    Ok(())
}

/// Asymmetric per-tensor quantization parameters for unsigned 8-bit
/// storage. The representable range always includes zero so that
/// padding and sparse weights survive the round trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: u8,
}

impl QuantParams {
    pub fn from_values(values: &[f32]) -> Self {
        let mut min = 0.0f32;
        let mut max = 0.0f32;
        for &v in values {
            min = min.min(v);
            max = max.max(v);
        }
        let scale = (max - min) / 255.0;
        if scale == 0.0 {
            return Self {
                scale: 1.0,
                zero_point: 0,
            };
        }
        let zero_point = (-min / scale).round().clamp(0.0, 255.0) as u8;
        Self { scale, zero_point }
    }

    pub fn quantize(&self, value: f32) -> u8 {
        (value / self.scale + f32::from(self.zero_point))
            .round()
            .clamp(0.0, 255.0) as u8
    }

    pub fn dequantize(&self, quantized: u8) -> f32 {
        (f32::from(quantized) - f32::from(self.zero_point)) * self.scale
    }
}

/// Picks a name not yet present in the graph, padding with underscores
/// until it is unique.
fn fresh_name(base: String, taken: &mut std::collections::HashSet<String>) -> String {
    let mut name = base;
    while !taken.insert(name.clone()) {
        name.push('_');
    }
    name
}

fn quantize_weights(mut model: OnnxModel) -> OnnxModel {
    let mut taken: std::collections::HashSet<String> = model
        .graph
        .initializers
        .iter()
        .map(|t| t.name.clone())
        .chain(model.graph.inputs.iter().map(|vi| vi.name.clone()))
        .chain(
            model
                .graph
                .nodes
                .iter()
                .flat_map(|n| n.outputs.iter().cloned()),
        )
        .collect();

    let mut kept = Vec::new();
    let mut added = Vec::new();
    let mut dequant_nodes = Vec::new();

    for tensor in model.graph.initializers.drain(..) {
        let eligible = tensor.elem_type == crate::onnx::ElemType::F32
            && tensor.element_count() >= MIN_QUANT_ELEMENTS;
        if !eligible {
            kept.push(tensor);
            continue;
        }
        let values = match tensor.as_f32_vec() {
            Ok(v) => v,
            Err(_) => {
                kept.push(tensor);
                continue;
            }
        };

        let params = QuantParams::from_values(&values);
        let data: Vec<u8> = values.iter().map(|&v| params.quantize(v)).collect();
        debug!(
            tensor = %tensor.name,
            elements = values.len(),
            scale = params.scale,
            zero_point = params.zero_point,
            "quantizing weight"
        );

        let q_name = fresh_name(format!("{}_quantized", tensor.name), &mut taken);
        let scale_name = fresh_name(format!("{}_scale", tensor.name), &mut taken);
        let zp_name = fresh_name(format!("{}_zero_point", tensor.name), &mut taken);

        added.push(OnnxTensor::from_u8(&q_name, tensor.dims.clone(), data));
        added.push(OnnxTensor::from_f32(&scale_name, vec![], &[params.scale]));
        added.push(OnnxTensor::from_u8(&zp_name, vec![], vec![params.zero_point]));

        // restores the original tensor name, so consumers are untouched
        dequant_nodes.push(OnnxNode::new(
            format!("{}_dequant", tensor.name),
            "DequantizeLinear",
            vec![q_name, scale_name, zp_name],
            vec![tensor.name.clone()],
        ));
    }

    kept.extend(added);
    model.graph.initializers = kept;

    // dequantize first, then the original topological order still holds
    dequant_nodes.append(&mut model.graph.nodes);
    model.graph.nodes = dequant_nodes;
    model
}
