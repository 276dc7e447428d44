use anyhow::{bail, Result};
use std::path::Path;
use tracing::debug;

use super::safetensors::StateDict;
use crate::onnx::{check_model, Dim, OnnxGraph, OnnxModel, OPSET_VERSION};

/// Strategy supplying the model architecture for a PyTorch checkpoint.
///
/// The checkpoint only carries learned parameters; the graph topology
/// has to come from the caller. Implementors read whatever weights they
/// need from the state dict and return a graph whose single input is
/// named `input` and whose single output is named `output`.
pub trait ModelDefinition {
    /// Architecture name, used as the exported graph's name.
    fn architecture(&self) -> &str;

    /// Builds the inference graph for the given (batch, channels,
    /// height, width) input from the loaded parameters.
    fn build_graph(&self, state: &StateDict, input_size: [i64; 4]) -> Result<OnnxGraph>;
}

/// Converts a PyTorch checkpoint to ONNX.
///
/// Without a [`ModelDefinition`] this fails with an instructive message:
/// the CLI has no architecture to offer, so the command-line path is a
/// documented dead end until the caller wires in their own definition.
pub fn export(
    checkpoint: &Path,
    output: &Path,
    input_size: [i64; 4],
    definition: Option<&dyn ModelDefinition>,
) -> Result<()> {
    println!("Loading PyTorch model from {}...", checkpoint.display());

    let Some(definition) = definition else {
        bail!(
            "no model architecture supplied for the PyTorch path.\n\
             The checkpoint stores parameters only; implement \
             triage_convert::ModelDefinition for your architecture and pass it to \
             convert::pytorch::export, e.g.\n\
             \n\
             struct RadiologyTriageModel;\n\
             impl ModelDefinition for RadiologyTriageModel {{ ... }}\n\
             pytorch::export(checkpoint, output, input_size, Some(&RadiologyTriageModel))"
        );
    };

    let state = StateDict::load(checkpoint)?;
    debug!(tensors = state.len(), "checkpoint loaded");

    let mut graph = definition.build_graph(&state, input_size)?;
    if graph.name.is_empty() {
        graph.name = definition.architecture().to_string();
    }

    match graph.inputs.as_slice() {
        [vi] if vi.name == "input" => {}
        _ => bail!(
            "model definition '{}' must declare exactly one graph input named 'input'",
            definition.architecture()
        ),
    }
    match graph.outputs.as_slice() {
        [vi] if vi.name == "output" => {}
        _ => bail!(
            "model definition '{}' must declare exactly one graph output named 'output'",
            definition.architecture()
        ),
    }

    // variable batch dimension on both ends of the graph
    for vi in graph.inputs.iter_mut().chain(graph.outputs.iter_mut()) {
        if let Some(first) = vi.dims.first_mut() {
            *first = Dim::batch();
        }
    }

    let model = OnnxModel::new(graph);
    check_model(&model)?;
    model.save(output)?;

    println!("✓ Model exported to {}", output.display());
    println!(
        "  Input shape: ({}, {}, {}, {})",
        input_size[0], input_size[1], input_size[2], input_size[3]
    );
    println!("  Opset version: {}", OPSET_VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::safetensors::test_support::encode_safetensors;
    use crate::onnx::{OnnxNode, OnnxTensor, ValueInfo};
    use std::io::Write;

    /// Flattens the image and applies a single learned linear layer.
    pub struct LinearProbe {
        pub classes: i64,
    }

    impl ModelDefinition for LinearProbe {
        fn architecture(&self) -> &str {
            "linear-probe"
        }

        fn build_graph(&self, state: &StateDict, input_size: [i64; 4]) -> Result<OnnxGraph> {
            let [_, c, h, w] = input_size;
            let features = c * h * w;
            let weight = state.require("fc.weight")?;
            let bias = state.require("fc.bias")?;

            let mut graph = OnnxGraph::new("");
            graph.inputs.push(ValueInfo::f32(
                "input",
                vec![
                    Dim::Value(input_size[0]),
                    Dim::Value(c),
                    Dim::Value(h),
                    Dim::Value(w),
                ],
            ));
            graph.outputs.push(ValueInfo::f32(
                "output",
                vec![Dim::Value(input_size[0]), Dim::Value(self.classes)],
            ));

            graph.initializers.push(OnnxTensor::from_i64(
                "flat_shape",
                vec![2],
                &[-1, features],
            ));
            graph.initializers.push(OnnxTensor::from_f32(
                "fc.weight",
                vec![features, self.classes],
                &weight.data,
            ));
            graph.initializers.push(OnnxTensor::from_f32(
                "fc.bias",
                vec![self.classes],
                &bias.data,
            ));

            graph.nodes.push(OnnxNode::new(
                "flatten",
                "Reshape",
                vec!["input".into(), "flat_shape".into()],
                vec!["flat".into()],
            ));
            graph.nodes.push(OnnxNode::new(
                "fc",
                "MatMul",
                vec!["flat".into(), "fc.weight".into()],
                vec!["logits".into()],
            ));
            graph.nodes.push(OnnxNode::new(
                "bias",
                "Add",
                vec!["logits".into(), "fc.bias".into()],
                vec!["output".into()],
            ));
            Ok(graph)
        }
    }

    fn write_probe_checkpoint(name: &str, features: usize, classes: usize) -> std::path::PathBuf {
        let weight: Vec<f32> = (0..features * classes).map(|i| i as f32 * 0.01).collect();
        let bias: Vec<f32> = (0..classes).map(|i| i as f32).collect();
        let bytes = encode_safetensors(&[
            ("fc.weight", vec![features, classes], weight),
            ("fc.bias", vec![classes], bias),
        ]);
        let path = std::env::temp_dir().join(format!(
            "triage-convert-pt-{}-{}",
            std::process::id(),
            name
        ));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();
        path
    }

    #[test]
    fn export_without_definition_fails_with_hint() {
        let checkpoint = write_probe_checkpoint("nodef.safetensors", 12, 4);
        let output = std::env::temp_dir().join("triage-convert-pt-nodef.onnx");

        let err = export(&checkpoint, &output, [1, 3, 2, 2], None).unwrap_err();
        assert!(err.to_string().contains("ModelDefinition"));
        assert!(!output.exists());

        std::fs::remove_file(&checkpoint).ok();
    }

    #[test]
    fn export_with_definition_writes_checker_clean_model() {
        let checkpoint = write_probe_checkpoint("probe.safetensors", 12, 4);
        let output = std::env::temp_dir().join(format!(
            "triage-convert-pt-{}-probe.onnx",
            std::process::id()
        ));

        let probe = LinearProbe { classes: 4 };
        export(&checkpoint, &output, [1, 3, 2, 2], Some(&probe)).unwrap();

        let model = OnnxModel::load(&output).unwrap();
        check_model(&model).unwrap();
        assert_eq!(model.opset_version, OPSET_VERSION);
        assert_eq!(model.graph.name, "linear-probe");
        assert_eq!(model.graph.inputs[0].dims[0], Dim::batch());
        assert_eq!(model.graph.outputs[0].dims[0], Dim::batch());

        std::fs::remove_file(&checkpoint).ok();
        std::fs::remove_file(&output).ok();
    }

    #[test]
    fn definition_missing_weights_is_an_error() {
        let bytes = encode_safetensors(&[("other.weight", vec![2], vec![0.0, 1.0])]);
        let checkpoint = std::env::temp_dir().join(format!(
            "triage-convert-pt-{}-missing.safetensors",
            std::process::id()
        ));
        std::fs::File::create(&checkpoint)
            .unwrap()
            .write_all(&bytes)
            .unwrap();
        let output = std::env::temp_dir().join("triage-convert-pt-missing.onnx");

        let probe = LinearProbe { classes: 4 };
        let err = export(&checkpoint, &output, [1, 3, 2, 2], Some(&probe)).unwrap_err();
        assert!(err.to_string().contains("fc.weight"));

        std::fs::remove_file(&checkpoint).ok();
    }
}
