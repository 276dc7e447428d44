pub mod convert;
pub mod format;
pub mod onnx;
pub mod optimize;

pub use convert::{ConversionRequest, Framework, ModelDefinition, StateDict, Weight};
pub use onnx::{
    check_model, Dim, ElemType, OnnxGraph, OnnxModel, OnnxNode, OnnxTensor, ValueInfo,
    OPSET_VERSION,
};
pub use optimize::QuantParams;
