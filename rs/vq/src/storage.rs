use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2};

use crate::quantizer::{VectorQuantizer, VectorQuantizerConfig};

const STATE_NAME: &str = "codebook";
const CONFIG_NAME: &str = "vector_quantizer_config.yaml";

impl VectorQuantizer {
    /// Serialize the codebook and both accumulators into one little-endian
    /// buffer. They form a single consistent unit and are never written
    /// separately.
    pub fn state_to_buffer(&self) -> Vec<u8> {
        let num_values =
            self.codebook().len() + self.ema_cluster_size().len() + self.ema_weight_sum().len();
        let mut buffer = Vec::with_capacity(num_values * 4);
        for value in self
            .codebook()
            .iter()
            .chain(self.ema_cluster_size().iter())
            .chain(self.ema_weight_sum().iter())
        {
            buffer.extend_from_slice(&value.to_le_bytes());
        }
        buffer
    }
}

pub struct VectorQuantizerWriter {
    base_directory: String,
}

impl VectorQuantizerWriter {
    pub fn new(base_directory: String) -> Self {
        Self { base_directory }
    }

    pub fn write(&self, quantizer: &VectorQuantizer) -> Result<()> {
        let config_path = Path::new(&self.base_directory).join(CONFIG_NAME);
        if config_path.exists() {
            std::fs::remove_file(&config_path)?;
        }

        let state_path = Path::new(&self.base_directory).join(STATE_NAME);
        if state_path.exists() {
            std::fs::remove_file(&state_path)?;
        }

        let mut state_file = File::create(&state_path)?;
        state_file.write_all(&quantizer.state_to_buffer())?;

        let mut config_file = File::create(&config_path)?;
        config_file.write_all(serde_yaml::to_string(quantizer.config())?.as_bytes())?;
        Ok(())
    }
}

pub struct VectorQuantizerReader {
    base_directory: String,
}

impl VectorQuantizerReader {
    pub fn new(base_directory: String) -> Self {
        Self { base_directory }
    }

    /// Restore a quantizer from a directory written by
    /// `VectorQuantizerWriter`. The restored quantizer starts in eval mode;
    /// callers resuming training switch the mode back on explicitly.
    pub fn read(&self) -> Result<VectorQuantizer> {
        let config_path = Path::new(&self.base_directory).join(CONFIG_NAME);
        if !config_path.exists() {
            return Err(anyhow!("Config file does not exist"));
        }
        if !config_path.is_file() {
            return Err(anyhow!("Config file is not a file"));
        }

        let config_buffer = std::fs::read(&config_path)?;
        let config: VectorQuantizerConfig = serde_yaml::from_slice(&config_buffer)?;
        config.validate()?;

        let state_buffer = std::fs::read(Path::new(&self.base_directory).join(STATE_NAME))?;
        let codebook_len = config.num_codes * config.dim;
        let expected_values = codebook_len * 2 + config.num_codes;
        if state_buffer.len() != expected_values * 4 {
            return Err(anyhow!(
                "State buffer holds {} bytes, expected {}",
                state_buffer.len(),
                expected_values * 4
            ));
        }

        let mut values = Vec::with_capacity(expected_values);
        for chunk in state_buffer.chunks_exact(4) {
            values.push(f32::from_le_bytes(chunk.try_into()?));
        }

        let codebook = Array2::from_shape_vec(
            (config.num_codes, config.dim),
            values[..codebook_len].to_vec(),
        )?;
        let ema_cluster_size = Array1::from_vec(
            values[codebook_len..codebook_len + config.num_codes].to_vec(),
        );
        let ema_weight_sum = Array2::from_shape_vec(
            (config.num_codes, config.dim),
            values[codebook_len + config.num_codes..].to_vec(),
        )?;

        let mut quantizer =
            VectorQuantizer::with_state(config, codebook, ema_cluster_size, ema_weight_sum)?;
        quantizer.set_training(false);
        Ok(quantizer)
    }
}

#[cfg(test)]
mod tests {
    use utils::test_utils::generate_random_batch;

    use super::*;

    #[test]
    fn test_state_round_trip() {
        let temp_dir = tempdir::TempDir::new("vector_quantizer_test").unwrap();
        let base_directory = temp_dir.path().to_str().unwrap().to_string();

        let config = VectorQuantizerConfig {
            num_codes: 8,
            dim: 4,
            commitment_cost: 0.25,
            use_rotation: true,
            ema_decay: 0.99,
        };
        let mut quantizer = VectorQuantizer::new(config).unwrap();

        // A few training steps so the accumulators diverge from their
        // initial values.
        for _ in 0..3 {
            let batch = generate_random_batch(16, 4);
            quantizer.forward(batch.view()).unwrap();
        }

        let writer = VectorQuantizerWriter::new(base_directory.clone());
        writer.write(&quantizer).unwrap();

        let reader = VectorQuantizerReader::new(base_directory);
        let restored = reader.read().unwrap();

        assert!(!restored.is_training());
        assert_eq!(restored.config().num_codes, 8);
        assert_eq!(restored.config().dim, 4);
        assert_eq!(restored.codebook(), quantizer.codebook());
        assert_eq!(restored.ema_cluster_size(), quantizer.ema_cluster_size());
        assert_eq!(restored.ema_weight_sum(), quantizer.ema_weight_sum());
    }

    #[test]
    fn test_restored_quantizer_answers_queries() {
        let temp_dir = tempdir::TempDir::new("vector_quantizer_test").unwrap();
        let base_directory = temp_dir.path().to_str().unwrap().to_string();

        let config = VectorQuantizerConfig {
            num_codes: 4,
            dim: 2,
            commitment_cost: 0.25,
            use_rotation: false,
            ema_decay: 0.99,
        };
        let mut quantizer = VectorQuantizer::new(config).unwrap();
        let batch = generate_random_batch(4, 2);
        quantizer.forward(batch.view()).unwrap();
        quantizer.set_training(false);

        VectorQuantizerWriter::new(base_directory.clone())
            .write(&quantizer)
            .unwrap();
        let mut restored = VectorQuantizerReader::new(base_directory).read().unwrap();

        let query = generate_random_batch(3, 2);
        let expected = quantizer.forward(query.view()).unwrap();
        let actual = restored.forward(query.view()).unwrap();
        assert_eq!(expected.indices, actual.indices);
        assert_eq!(expected.output, actual.output);
    }

    #[test]
    fn test_missing_config_rejected() {
        let temp_dir = tempdir::TempDir::new("vector_quantizer_test").unwrap();
        let base_directory = temp_dir.path().to_str().unwrap().to_string();

        let reader = VectorQuantizerReader::new(base_directory);
        assert!(reader.read().is_err());
    }

    #[test]
    fn test_truncated_state_rejected() {
        let temp_dir = tempdir::TempDir::new("vector_quantizer_test").unwrap();
        let base_directory = temp_dir.path().to_str().unwrap().to_string();

        let config = VectorQuantizerConfig {
            num_codes: 4,
            dim: 2,
            commitment_cost: 0.25,
            use_rotation: false,
            ema_decay: 0.99,
        };
        let quantizer = VectorQuantizer::new(config).unwrap();
        VectorQuantizerWriter::new(base_directory.clone())
            .write(&quantizer)
            .unwrap();

        // Chop the tail off the state buffer.
        let state_path = Path::new(&base_directory).join(STATE_NAME);
        let buffer = std::fs::read(&state_path).unwrap();
        std::fs::write(&state_path, &buffer[..buffer.len() - 4]).unwrap();

        let reader = VectorQuantizerReader::new(base_directory);
        assert!(reader.read().is_err());
    }
}
