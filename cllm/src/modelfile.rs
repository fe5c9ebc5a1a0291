//! Binary model file and optimizer checkpoint formats.
//!
//! Layout: ASCII magic `"CLLM"`, three zero bytes, one version byte; a fixed-size header;
//! then the parameter vector as `P` little-endian `f32` values. `byteorder` is used
//! throughout rather than hand-rolled `to_le_bytes` juggling, matching how binary formats
//! are read/written elsewhere in the pack (e.g. `bytes`' `abomonation`-style encoders).

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CllmError, Result};
use crate::ops::ModelDims;

const MAGIC: &[u8; 4] = b"CLLM";
const CURRENT_VERSION: u32 = 1;
const NAME_FIELD_LEN: usize = 256;

/// The fixed-size model file header.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelHeader {
    pub version: u32,
    pub architecture: u32,
    pub dims: ModelDims,
    pub golden_ratio: f64,
    pub timestamp: i64,
    pub model_name: String,
    pub description: String,
    pub total_params: u64,
}

/// A model file in memory: header plus the flat parameter vector.
#[derive(Debug, Clone)]
pub struct ModelFile {
    pub header: ModelHeader,
    pub params: Vec<f32>,
}

fn write_fixed_str<W: Write>(w: &mut W, s: &str, len: usize) -> io::Result<()> {
    let mut buf = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    buf[..n].copy_from_slice(&bytes[..n]);
    w.write_all(&buf)
}

fn read_fixed_str<R: Read>(r: &mut R, len: usize) -> io::Result<String> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(len);
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

impl ModelFile {
    /// Builds a fresh model file header for newly-initialized `params`.
    pub fn new(dims: ModelDims, architecture: u32, model_name: String, description: String, golden_ratio: f64, timestamp: i64, params: Vec<f32>) -> Self {
        let total_params = params.len() as u64;
        Self {
            header: ModelHeader { version: CURRENT_VERSION, architecture, dims, golden_ratio, timestamp, model_name, description, total_params },
            params,
        }
    }

    /// Serializes header and parameters to `writer`.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let map_io = |e: io::Error| CllmError::MalformedInput(format!("model file write failed: {e}"));

        writer.write_all(MAGIC).map_err(map_io)?;
        writer.write_all(&[0, 0, 0]).map_err(map_io)?;
        writer.write_u8(self.header.version as u8).map_err(map_io)?;

        writer.write_u32::<LittleEndian>(self.header.version).map_err(map_io)?;
        writer.write_u32::<LittleEndian>(self.header.architecture).map_err(map_io)?;
        writer.write_u32::<LittleEndian>(self.header.dims.vocab_size as u32).map_err(map_io)?;
        writer.write_u32::<LittleEndian>(self.header.dims.embedding_dim as u32).map_err(map_io)?;
        writer.write_u32::<LittleEndian>(self.header.dims.num_layers as u32).map_err(map_io)?;
        writer.write_u32::<LittleEndian>(self.header.dims.num_heads as u32).map_err(map_io)?;
        writer.write_u32::<LittleEndian>(self.header.dims.context_length as u32).map_err(map_io)?;
        writer.write_u32::<LittleEndian>(self.header.dims.symmetry_order).map_err(map_io)?;
        writer.write_f64::<LittleEndian>(self.header.golden_ratio).map_err(map_io)?;
        writer.write_i64::<LittleEndian>(self.header.timestamp).map_err(map_io)?;
        write_fixed_str(writer, &self.header.model_name, NAME_FIELD_LEN).map_err(map_io)?;
        write_fixed_str(writer, &self.header.description, NAME_FIELD_LEN).map_err(map_io)?;
        writer.write_u64::<LittleEndian>(self.header.total_params).map_err(map_io)?;

        for &p in &self.params {
            writer.write_f32::<LittleEndian>(p).map_err(map_io)?;
        }
        Ok(())
    }

    /// Parses header and parameters from `reader`, validating
    pub fn read<R: Read>(reader: &mut R, expected_symmetry_order: u32) -> Result<Self> {
        let map_io = |e: io::Error| CllmError::MalformedInput(format!("model file read failed: {e}"));

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(map_io)?;
        if &magic != MAGIC {
            return Err(CllmError::MalformedInput("model file magic mismatch".into()));
        }
        let mut reserved = [0u8; 3];
        reader.read_exact(&mut reserved).map_err(map_io)?;
        let _version_byte = reader.read_u8().map_err(map_io)?;

        let version = reader.read_u32::<LittleEndian>().map_err(map_io)?;
        if !(1..=100).contains(&version) {
            return Err(CllmError::MalformedInput(format!("model file version {version} out of range [1, 100]")));
        }
        let architecture = reader.read_u32::<LittleEndian>().map_err(map_io)?;
        let vocab_size = reader.read_u32::<LittleEndian>().map_err(map_io)?;
        if !(1..1_000_000).contains(&vocab_size) {
            return Err(CllmError::MalformedInput(format!("vocab_size {vocab_size} out of range")));
        }
        let embedding_dim = reader.read_u32::<LittleEndian>().map_err(map_io)?;
        if !(1..10_000).contains(&embedding_dim) {
            return Err(CllmError::MalformedInput(format!("embedding_dim {embedding_dim} out of range")));
        }
        let num_layers = reader.read_u32::<LittleEndian>().map_err(map_io)?;
        if !(1..100).contains(&num_layers) {
            return Err(CllmError::MalformedInput(format!("num_layers {num_layers} out of range")));
        }
        let num_heads = reader.read_u32::<LittleEndian>().map_err(map_io)?;
        let context_length = reader.read_u32::<LittleEndian>().map_err(map_io)?;
        let symmetry_order = reader.read_u32::<LittleEndian>().map_err(map_io)?;
        if symmetry_order != expected_symmetry_order {
            return Err(CllmError::MalformedInput(format!(
                "model file symmetry_order {symmetry_order} does not match configured K {expected_symmetry_order}"
            )));
        }
        let golden_ratio = reader.read_f64::<LittleEndian>().map_err(map_io)?;
        let timestamp = reader.read_i64::<LittleEndian>().map_err(map_io)?;
        let model_name = read_fixed_str(reader, NAME_FIELD_LEN).map_err(map_io)?;
        let description = read_fixed_str(reader, NAME_FIELD_LEN).map_err(map_io)?;
        let total_params = reader.read_u64::<LittleEndian>().map_err(map_io)?;

        let mut params = Vec::with_capacity(total_params as usize);
        for _ in 0..total_params {
            params.push(reader.read_f32::<LittleEndian>().map_err(map_io)?);
        }

        let dims = ModelDims {
            vocab_size: vocab_size as usize,
            embedding_dim: embedding_dim as usize,
            num_layers: num_layers as usize,
            num_heads: num_heads as usize,
            ff_hidden_dim: 0,
            context_length: context_length as usize,
            symmetry_order,
        };

        Ok(Self { header: ModelHeader { version, architecture, dims, golden_ratio, timestamp, model_name, description, total_params }, params })
    }
}

/// Optimizer checkpoint `<model>.state`. Carries no magic of its own — the
/// adjacent model file's magic is the integrity anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerCheckpoint {
    pub current_epoch: i32,
    pub current_step: i32,
    pub current_loss: f32,
    pub best_loss: f32,
    /// `[m, v]` concatenated, `2*P` floats total.
    pub moments: Vec<f32>,
}

impl OptimizerCheckpoint {
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let map_io = |e: io::Error| CllmError::MalformedInput(format!("checkpoint write failed: {e}"));
        writer.write_i32::<LittleEndian>(self.current_epoch).map_err(map_io)?;
        writer.write_i32::<LittleEndian>(self.current_step).map_err(map_io)?;
        writer.write_f32::<LittleEndian>(self.current_loss).map_err(map_io)?;
        writer.write_f32::<LittleEndian>(self.best_loss).map_err(map_io)?;
        for &m in &self.moments {
            writer.write_f32::<LittleEndian>(m).map_err(map_io)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R, expected_param_count: usize) -> Result<Self> {
        let map_io = |e: io::Error| CllmError::MalformedInput(format!("checkpoint read failed: {e}"));
        let current_epoch = reader.read_i32::<LittleEndian>().map_err(map_io)?;
        let current_step = reader.read_i32::<LittleEndian>().map_err(map_io)?;
        let current_loss = reader.read_f32::<LittleEndian>().map_err(map_io)?;
        let best_loss = reader.read_f32::<LittleEndian>().map_err(map_io)?;
        let mut moments = Vec::with_capacity(expected_param_count * 2);
        for _ in 0..expected_param_count * 2 {
            moments.push(reader.read_f32::<LittleEndian>().map_err(map_io)?);
        }
        Ok(Self { current_epoch, current_step, current_loss, best_loss, moments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> ModelDims {
        ModelDims { vocab_size: 10, embedding_dim: 4, num_layers: 1, num_heads: 1, ff_hidden_dim: 8, context_length: 8, symmetry_order: 12 }
    }

    #[test]
    fn model_file_round_trips_header_and_params() {
        let params: Vec<f32> = (0..40).map(|i| i as f32 * 0.5).collect();
        let model = ModelFile::new(dims(), 1, "toy".into(), "a test model".into(), 1.618, 1_700_000_000, params.clone());

        let mut buf = Vec::new();
        model.write(&mut buf).unwrap();

        let loaded = ModelFile::read(&mut buf.as_slice(), 12).unwrap();
        assert_eq!(loaded.header.version, 1);
        assert_eq!(loaded.header.dims.vocab_size, 10);
        assert_eq!(loaded.header.dims.embedding_dim, 4);
        assert_eq!(loaded.header.model_name, "toy");
        assert_eq!(loaded.header.description, "a test model");
        assert_eq!(loaded.params, params);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = b"NOPE\x00\x00\x00\x01".to_vec();
        let err = ModelFile::read(&mut buf.as_slice(), 12).unwrap_err();
        assert!(matches!(err, CllmError::MalformedInput(_)));
    }

    #[test]
    fn rejects_symmetry_order_mismatch() {
        let model = ModelFile::new(dims(), 1, "toy".into(), "".into(), 1.0, 0, vec![0.0; 40]);
        let mut buf = Vec::new();
        model.write(&mut buf).unwrap();
        let err = ModelFile::read(&mut buf.as_slice(), 7).unwrap_err();
        assert!(matches!(err, CllmError::MalformedInput(_)));
    }

    #[test]
    fn checkpoint_round_trips() {
        let checkpoint = OptimizerCheckpoint { current_epoch: 3, current_step: 42, current_loss: 1.5, best_loss: 1.1, moments: vec![0.1; 8] };
        let mut buf = Vec::new();
        checkpoint.write(&mut buf).unwrap();
        let loaded = OptimizerCheckpoint::read(&mut buf.as_slice(), 4).unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn model_file_round_trips_through_a_real_file() {
        let params: Vec<f32> = (0..40).map(|i| i as f32 * 0.25).collect();
        let model = ModelFile::new(dims(), 1, "toy".into(), "disk round trip".into(), 1.618, 1_700_000_000, params.clone());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        model.write(file.as_file_mut()).unwrap();

        let mut reopened = std::fs::File::open(file.path()).unwrap();
        let loaded = ModelFile::read(&mut reopened, 12).unwrap();
        assert_eq!(loaded.params, params);
        assert_eq!(loaded.header.model_name, "toy");
    }
}
