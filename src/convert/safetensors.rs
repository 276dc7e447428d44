use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use half::{bf16, f16};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

// legacy torch.save() output, a zip archive of pickled objects
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

#[derive(Debug, Clone, Deserialize)]
struct TensorInfo {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(flatten)]
    tensors: HashMap<String, TensorInfo>,
    #[serde(rename = "__metadata__")]
    #[allow(dead_code)]
    metadata: Option<HashMap<String, serde_json::Value>>,
}

/// One learned parameter, widened to f32 regardless of on-disk dtype.
#[derive(Debug, Clone)]
pub struct Weight {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Weight {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A trained model's parameters, keyed by parameter name.
#[derive(Debug, Default)]
pub struct StateDict {
    weights: HashMap<String, Weight>,
}

impl StateDict {
    /// Loads a safetensors checkpoint. Legacy zip-pickle checkpoints are
    /// recognized and rejected with a re-export hint.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("opening checkpoint {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .context("checkpoint shorter than 4 bytes")?;
        if magic == ZIP_MAGIC {
            bail!(
                "{} is a legacy pickle checkpoint; re-export it as safetensors \
                 (e.g. safetensors.torch.save_file(model.state_dict(), ...)) and retry",
                path.display()
            );
        }

        let mut rest = [0u8; 4];
        reader.read_exact(&mut rest).context("truncated header length")?;
        let header_len = u64::from_le_bytes([
            magic[0], magic[1], magic[2], magic[3], rest[0], rest[1], rest[2], rest[3],
        ]);
        if header_len > 100 * 1024 * 1024 {
            bail!("safetensors header too large: {} bytes", header_len);
        }

        let mut header_buf = vec![0u8; header_len as usize];
        reader
            .read_exact(&mut header_buf)
            .context("truncated safetensors header")?;
        let header: Header =
            serde_json::from_slice(&header_buf).context("parsing safetensors header")?;

        // tensors are laid out back to back after the header; read the
        // whole payload once and slice per tensor
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload)?;

        let mut weights = HashMap::new();
        for (name, info) in &header.tensors {
            let [start, end] = info.data_offsets;
            if end < start || end > payload.len() {
                bail!(
                    "tensor '{}' offsets {:?} exceed payload ({} bytes)",
                    name,
                    info.data_offsets,
                    payload.len()
                );
            }
            let data = widen_to_f32(&info.dtype, &payload[start..end])
                .with_context(|| format!("tensor '{}'", name))?;
            let expected: usize = info.shape.iter().product();
            if data.len() != expected {
                bail!(
                    "tensor '{}' has {} elements, shape {:?} requires {}",
                    name,
                    data.len(),
                    info.shape,
                    expected
                );
            }
            weights.insert(
                name.clone(),
                Weight {
                    shape: info.shape.clone(),
                    data,
                },
            );
        }

        Ok(Self { weights })
    }

    pub fn get(&self, name: &str) -> Option<&Weight> {
        self.weights.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Weight> {
        self.weights
            .get(name)
            .with_context(|| format!("checkpoint has no tensor '{}'", name))
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(|s| s.as_str())
    }
}

fn widen_to_f32(dtype: &str, bytes: &[u8]) -> Result<Vec<f32>> {
    let mut cursor = bytes;
    let mut out = Vec::new();
    match dtype {
        "F32" => {
            out.reserve(bytes.len() / 4);
            while !cursor.is_empty() {
                out.push(cursor.read_f32::<LittleEndian>()?);
            }
        }
        "F64" => {
            out.reserve(bytes.len() / 8);
            while !cursor.is_empty() {
                out.push(cursor.read_f64::<LittleEndian>()? as f32);
            }
        }
        "F16" => {
            out.reserve(bytes.len() / 2);
            while !cursor.is_empty() {
                out.push(f16::from_bits(cursor.read_u16::<LittleEndian>()?).to_f32());
            }
        }
        "BF16" => {
            out.reserve(bytes.len() / 2);
            while !cursor.is_empty() {
                out.push(bf16::from_bits(cursor.read_u16::<LittleEndian>()?).to_f32());
            }
        }
        other => bail!("unsupported checkpoint dtype {}", other),
    }
    Ok(out)
}
