use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use std::path::{Path, PathBuf};
use tracing::info;

pub mod pytorch;
pub mod safetensors;
pub mod tensorflow;

pub use pytorch::ModelDefinition;
pub use safetensors::{StateDict, Weight};

use crate::optimize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Framework {
    Pytorch,
    Tensorflow,
}

/// Everything one invocation needs, validated up front and immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub framework: Framework,
    pub checkpoint: Option<PathBuf>,
    pub saved_model: Option<PathBuf>,
    pub output: PathBuf,
    pub input_size: [i64; 4],
    pub optimize: bool,
}

impl ConversionRequest {
    /// Cross-field validation: the source path matching the selected
    /// framework must be present. Runs before any file is opened.
    pub fn validate(&self) -> Result<()> {
        match self.framework {
            Framework::Pytorch if self.checkpoint.is_none() => {
                bail!("--checkpoint required for PyTorch models")
            }
            Framework::Tensorflow if self.saved_model.is_none() => {
                bail!("--saved-model required for TensorFlow models")
            }
            _ => Ok(()),
        }
    }

    /// Sibling path with `_optimized` inserted before the extension.
    pub fn optimized_output(&self) -> PathBuf {
        derived_optimized_path(&self.output)
    }
}

pub fn derived_optimized_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!("{}_optimized.{}", stem, ext.to_string_lossy()),
        None => format!("{}_optimized", stem),
    };
    output.with_file_name(name)
}

/// Runs the whole pipeline: validate, export, optionally quantize,
/// print next steps. The CLI supplies no PyTorch model definition, so
/// `definition` is None there and the PyTorch path fails with its
/// documented instructive message.
pub fn run(request: &ConversionRequest, definition: Option<&dyn ModelDefinition>) -> Result<()> {
    request.validate()?;
    info!(framework = ?request.framework, output = %request.output.display(), "starting conversion");

    match request.framework {
        Framework::Pytorch => {
            let checkpoint = request
                .checkpoint
                .as_deref()
                .context("--checkpoint required for PyTorch models")?;
            pytorch::export(checkpoint, &request.output, request.input_size, definition)?;
        }
        Framework::Tensorflow => {
            let saved_model = request
                .saved_model
                .as_deref()
                .context("--saved-model required for TensorFlow models")?;
            tensorflow::export(saved_model, &request.output, request.input_size)?;
        }
    }

    if request.optimize {
        let optimized = request.optimized_output();
        optimize::optimize(&request.output, &optimized)?;
        println!("\n✓ Use optimized model: {}", optimized.display());
    }

    println!("\nNext steps:");
    println!(
        "1. Copy {} to your deployment's models/ directory",
        request.output.display()
    );
    println!("2. Update the inference worker with your model's input/output names");
    println!("3. Test with sample medical images");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(framework: Framework) -> ConversionRequest {
        ConversionRequest {
            framework,
            checkpoint: None,
            saved_model: None,
            output: PathBuf::from("triage-model.onnx"),
            input_size: [1, 3, 224, 224],
            optimize: false,
        }
    }

    #[test]
    fn pytorch_requires_checkpoint() {
        let mut req = request(Framework::Pytorch);
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("--checkpoint"));

        req.checkpoint = Some(PathBuf::from("model.safetensors"));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn tensorflow_requires_saved_model() {
        let mut req = request(Framework::Tensorflow);
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("--saved-model"));

        req.saved_model = Some(PathBuf::from("./saved_model"));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn optimized_filename_is_derived_before_the_extension() {
        assert_eq!(
            derived_optimized_path(Path::new("triage-model.onnx")),
            PathBuf::from("triage-model_optimized.onnx")
        );
        assert_eq!(
            derived_optimized_path(Path::new("models/exported.onnx")),
            PathBuf::from("models/exported_optimized.onnx")
        );
        assert_eq!(
            derived_optimized_path(Path::new("bare")),
            PathBuf::from("bare_optimized")
        );
    }

    #[test]
    fn run_checks_arguments_before_touching_files() {
        // no checkpoint path at all: must fail in validation, not I/O
        let err = run(&request(Framework::Pytorch), None).unwrap_err();
        assert!(err.to_string().contains("--checkpoint"));
    }

    #[test]
    fn pytorch_run_without_definition_is_the_documented_stub() {
        let mut req = request(Framework::Pytorch);
        // validation passes, the exporter itself refuses
        req.checkpoint = Some(PathBuf::from("does-not-matter.safetensors"));
        let err = run(&req, None).unwrap_err();
        assert!(err.to_string().contains("ModelDefinition"));
    }
}
