use anyhow::{bail, Result};
use std::collections::HashSet;

use super::OnnxModel;

/// Structural validation of a decoded model, in the spirit of
/// `onnx.checker.check_model`: every node input must resolve to a graph
/// input, an initializer, or the output of an earlier node, and every
/// initializer payload must match its declared type and dims.
pub fn check_model(model: &OnnxModel) -> Result<()> {
    if model.ir_version <= 0 {
        bail!("missing or invalid ir_version");
    }
    if model.opset_version <= 0 {
        bail!("missing opset import");
    }

    let graph = &model.graph;
    if graph.nodes.is_empty() {
        bail!("graph '{}' has no nodes", graph.name);
    }

    let mut known: HashSet<&str> = HashSet::new();
    for vi in &graph.inputs {
        known.insert(vi.name.as_str());
    }

    let mut initializer_names: HashSet<&str> = HashSet::new();
    for tensor in &graph.initializers {
        if tensor.name.is_empty() {
            bail!("initializer with empty name");
        }
        if !initializer_names.insert(tensor.name.as_str()) {
            bail!("duplicate initializer '{}'", tensor.name);
        }
        if let Some(elem_size) = tensor.elem_type.byte_size() {
            let expected = tensor.element_count() * elem_size;
            if tensor.raw_data.len() != expected {
                bail!(
                    "initializer '{}' payload is {} bytes, dims {:?} require {}",
                    tensor.name,
                    tensor.raw_data.len(),
                    tensor.dims,
                    expected
                );
            }
        }
        known.insert(tensor.name.as_str());
    }

    for node in &graph.nodes {
        if node.op_type.is_empty() {
            bail!("node '{}' has no op_type", node.name);
        }
        for input in &node.inputs {
            // empty string marks an omitted optional input
            if !input.is_empty() && !known.contains(input.as_str()) {
                bail!(
                    "node '{}' ({}) consumes '{}' which no input, initializer, \
                     or earlier node produces",
                    node.name,
                    node.op_type,
                    input
                );
            }
        }
        if node.outputs.is_empty() {
            bail!("node '{}' ({}) has no outputs", node.name, node.op_type);
        }
        for output in &node.outputs {
            known.insert(output.as_str());
        }
    }

    if graph.outputs.is_empty() {
        bail!("graph '{}' declares no outputs", graph.name);
    }
    for vi in &graph.outputs {
        if !known.contains(vi.name.as_str()) {
            bail!("graph output '{}' is never produced", vi.name);
        }
    }

    Ok(())
}
