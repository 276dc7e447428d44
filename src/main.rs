use clap::Parser;
use std::path::PathBuf;
use std::process;

use triage_convert::convert::{self, ConversionRequest, Framework};

#[derive(Parser)]
#[command(name = "triage-convert")]
#[command(version = "0.1.0")]
#[command(about = "Convert trained triage models to ONNX for browser deployment", long_about = None)]
struct Cli {
    /// Source framework
    #[arg(long, value_enum)]
    framework: Framework,

    /// Path to PyTorch checkpoint (safetensors file)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Path to TensorFlow SavedModel directory
    #[arg(long)]
    saved_model: Option<PathBuf>,

    /// Output path for the ONNX model
    #[arg(long, default_value = "triage-model.onnx")]
    output: PathBuf,

    /// Quantize weights to uint8 after export
    #[arg(long)]
    optimize: bool,

    /// Input tensor size (batch channels height width)
    #[arg(
        long,
        num_args = 4,
        action = clap::ArgAction::Set,
        overrides_with = "input_size",
        value_names = ["B", "C", "H", "W"],
        default_values_t = [1, 3, 224, 224]
    )]
    input_size: Vec<i64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let input_size: [i64; 4] = match cli.input_size.as_slice().try_into() {
        Ok(size) => size,
        Err(_) => {
            eprintln!("Error: --input-size takes exactly four values (B C H W)");
            process::exit(1);
        }
    };

    let request = ConversionRequest {
        framework: cli.framework,
        checkpoint: cli.checkpoint,
        saved_model: cli.saved_model,
        output: cli.output,
        input_size,
        optimize: cli.optimize,
    };

    // the CLI has no model architecture to offer the PyTorch path;
    // library users pass their own ModelDefinition here
    if let Err(e) = convert::run(&request, None) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cli = Cli::try_parse_from([
            "triage-convert",
            "--framework",
            "pytorch",
            "--checkpoint",
            "model.safetensors",
        ])
        .unwrap();
        assert_eq!(cli.output, PathBuf::from("triage-model.onnx"));
        assert_eq!(cli.input_size, vec![1, 3, 224, 224]);
        assert!(!cli.optimize);
    }

    #[test]
    fn framework_is_required() {
        assert!(Cli::try_parse_from(["triage-convert"]).is_err());
        assert!(Cli::try_parse_from(["triage-convert", "--framework", "keras"]).is_err());
    }

    #[test]
    fn repeated_input_size_takes_the_last_occurrence() {
        let cli = Cli::try_parse_from([
            "triage-convert",
            "--framework",
            "tensorflow",
            "--saved-model",
            "./saved_model",
            "--input-size",
            "1",
            "3",
            "224",
            "224",
            "--input-size",
            "2",
            "3",
            "160",
            "160",
        ])
        .unwrap();
        assert_eq!(cli.input_size, vec![2, 3, 160, 160]);

        // the array conversion main() performs must succeed, not panic
        let size: std::result::Result<[i64; 4], _> = cli.input_size.as_slice().try_into();
        assert_eq!(size.unwrap(), [2, 3, 160, 160]);
    }

    #[test]
    fn input_size_requires_four_values() {
        let result = Cli::try_parse_from([
            "triage-convert",
            "--framework",
            "tensorflow",
            "--saved-model",
            "./saved_model",
            "--input-size",
            "1",
            "3",
        ]);
        assert!(result.is_err());
    }
}
