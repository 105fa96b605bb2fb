//! Causal language model loading for reward inference.
//!
//! Models are loaded from a local directory or a hub repo as memory-mapped
//! safetensors. The architecture is chosen from `config.json`'s `model_type`.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::models::qwen2;
use serde::Deserialize;
use tracing::info;

use crate::errors::{EvalError, EvalResult};
use crate::hub::HubClient;

/// A decoder-only model that scores every position of its input.
pub trait CausalLm {
    /// Logits for all positions: `[B, L] u32 -> [B, L, V]`.
    ///
    /// `attention_mask` is `[B, L]`, 1 for real tokens and 0 for padding.
    fn forward_logits(
        &mut self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> candle_core::Result<Tensor>;
}

/// Fail unless every mask row is ones followed only by zeros.
///
/// Right-padded rows need nothing beyond the causal mask: pad positions come
/// after every real token, and their labels are excluded from scoring.
pub fn ensure_right_padded(attention_mask: &Tensor) -> candle_core::Result<()> {
    let rows = attention_mask.to_dtype(DType::U32)?.to_vec2::<u32>()?;
    for (row_num, row) in rows.iter().enumerate() {
        let real = row.iter().take_while(|&&m| m != 0).count();
        if row[real..].iter().any(|&m| m != 0) {
            candle_core::bail!("batch row {row_num} is not right-padded");
        }
    }
    Ok(())
}

/// Local paths of everything needed to build a model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

fn shard_names(index_path: &Path) -> EvalResult<Vec<String>> {
    let text = std::fs::read_to_string(index_path)
        .map_err(|e| EvalError::io(format!("reading {}", index_path.display()), e))?;
    let index: SafetensorsIndex = serde_json::from_str(&text)
        .map_err(|e| EvalError::serialization("parsing safetensors index", e))?;
    let mut shards: Vec<String> = index.weight_map.into_values().collect();
    shards.sort();
    shards.dedup();
    Ok(shards)
}

/// How a repo stores its safetensors weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    Single,
    Sharded,
}

const SINGLE_WEIGHTS: &str = "model.safetensors";
const WEIGHTS_INDEX: &str = "model.safetensors.index.json";

/// Pick the weight layout from a repo file listing.
pub fn weight_layout(files: &[String]) -> Option<WeightLayout> {
    if files.iter().any(|f| f == SINGLE_WEIGHTS) {
        Some(WeightLayout::Single)
    } else if files.iter().any(|f| f == WEIGHTS_INDEX) {
        Some(WeightLayout::Sharded)
    } else {
        None
    }
}

impl ModelFiles {
    /// Resolve `path_or_repo` to local files, downloading through `hub` if it
    /// is not an existing directory.
    pub fn resolve(path_or_repo: &str, hub: &HubClient) -> EvalResult<Self> {
        let dir = Path::new(path_or_repo);
        if dir.is_dir() {
            return Self::from_dir(dir);
        }

        let listing = hub.model_listing(path_or_repo)?;
        let layout = weight_layout(&listing).ok_or_else(|| {
            EvalError::config(format!("no safetensors weights in repo {path_or_repo}"))
        })?;

        let config = hub.model_file(path_or_repo, "config.json")?;
        let weights = match layout {
            WeightLayout::Single => vec![hub.model_file(path_or_repo, SINGLE_WEIGHTS)?],
            WeightLayout::Sharded => {
                let index = hub.model_file(path_or_repo, WEIGHTS_INDEX)?;
                shard_names(&index)?
                    .iter()
                    .map(|shard| hub.model_file(path_or_repo, shard))
                    .collect::<EvalResult<Vec<_>>>()?
            }
        };
        Ok(Self { config, weights })
    }

    pub fn from_dir(dir: &Path) -> EvalResult<Self> {
        let config = dir.join("config.json");
        if !config.exists() {
            return Err(EvalError::config(format!(
                "no config.json in model directory {}",
                dir.display()
            )));
        }

        let single = dir.join(SINGLE_WEIGHTS);
        let weights = if single.exists() {
            vec![single]
        } else {
            let index = dir.join(WEIGHTS_INDEX);
            if !index.exists() {
                return Err(EvalError::config(format!(
                    "no safetensors weights in {}",
                    dir.display()
                )));
            }
            shard_names(&index)?
                .into_iter()
                .map(|shard| dir.join(shard))
                .collect()
        };
        Ok(Self { config, weights })
    }
}

#[derive(Debug, Deserialize)]
struct ArchitectureProbe {
    model_type: String,
}

/// Qwen2 base model with a language-model head over every position.
pub struct Qwen2CausalLm {
    model: qwen2::Model,
    lm_head: Linear,
}

impl Qwen2CausalLm {
    pub fn load(config: &qwen2::Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let model = qwen2::Model::new(config, vb.clone())?;
        let lm_head = if vb.contains_tensor("lm_head.weight") {
            candle_nn::linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        } else {
            let tied = vb.get(
                (config.vocab_size, config.hidden_size),
                "model.embed_tokens.weight",
            )?;
            Linear::new(tied, None)
        };
        Ok(Self { model, lm_head })
    }
}

impl CausalLm for Qwen2CausalLm {
    fn forward_logits(
        &mut self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> candle_core::Result<Tensor> {
        // an explicit qwen2 mask replaces the causal one; only right padding is supported
        ensure_right_padded(attention_mask)?;
        self.model.clear_kv_cache();
        let hidden = self.model.forward(input_ids, 0, None)?;
        self.model.clear_kv_cache();
        self.lm_head.forward(&hidden)
    }
}

/// Build the model described by `files` on `device`.
pub fn load_causal_lm(
    files: &ModelFiles,
    dtype: DType,
    device: &Device,
) -> EvalResult<Box<dyn CausalLm>> {
    let config_text = std::fs::read_to_string(&files.config)
        .map_err(|e| EvalError::io(format!("reading {}", files.config.display()), e))?;
    let probe: ArchitectureProbe = serde_json::from_str(&config_text)
        .map_err(|e| EvalError::serialization("reading model_type from config.json", e))?;

    match probe.model_type.as_str() {
        "qwen2" => {
            let config: qwen2::Config = serde_json::from_str(&config_text)
                .map_err(|e| EvalError::serialization("parsing Qwen2 config", e))?;
            let vb = mmap_weights(files, dtype, device)?;
            let model = Qwen2CausalLm::load(&config, vb)
                .map_err(|e| EvalError::model("constructing Qwen2 model", e))?;
            info!(
                layers = config.num_hidden_layers,
                vocab = config.vocab_size,
                "Loaded Qwen2 causal LM"
            );
            Ok(Box::new(model))
        }
        other => Err(EvalError::config(format!(
            "unsupported model_type '{other}' (supported: qwen2)"
        ))),
    }
}

fn mmap_weights(files: &ModelFiles, dtype: DType, device: &Device) -> EvalResult<VarBuilder<'static>> {
    // SAFETY: the safetensors files are memory-mapped and must not be modified
    // while the model is alive.
    unsafe {
        VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)
            .map_err(|e| EvalError::model("mapping safetensors weights", e))
    }
}

/// CUDA when compiled in and available, otherwise CPU.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Using CPU for inference");
        return Device::Cpu;
    }
    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(device) => {
                info!("Using CUDA GPU for inference");
                return device;
            }
            Err(e) => tracing::warn!(error = %e, "CUDA requested but unavailable, falling back to CPU"),
        }
    }
    info!("Using CPU for inference");
    Device::Cpu
}

/// Half precision on accelerators, full precision on CPU.
pub fn dtype_for(device: &Device) -> DType {
    if device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_dir_with_single_weights_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();

        let files = ModelFiles::from_dir(dir.path()).unwrap();
        assert_eq!(files.weights, vec![dir.path().join("model.safetensors")]);
    }

    #[test]
    fn local_dir_with_sharded_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(
            dir.path().join("model.safetensors.index.json"),
            r#"{"metadata": {}, "weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }}"#,
        )
        .unwrap();

        let files = ModelFiles::from_dir(dir.path()).unwrap();
        assert_eq!(
            files.weights,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn missing_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModelFiles::from_dir(dir.path()).is_err());
    }

    #[test]
    fn unsupported_architecture_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"model_type": "gpt2"}"#).unwrap();
        let files = ModelFiles {
            config: dir.path().join("config.json"),
            weights: vec![],
        };
        let err = load_causal_lm(&files, DType::F32, &Device::Cpu)
            .err()
            .expect("gpt2 is not supported");
        assert!(matches!(err, EvalError::Config { .. }));
        assert!(err.to_string().contains("gpt2"));
    }

    #[test]
    fn right_padded_masks_pass() {
        let mask = Tensor::new(&[[1u32, 1, 0, 0], [1, 1, 1, 1]], &Device::Cpu).unwrap();
        assert!(ensure_right_padded(&mask).is_ok());
    }

    #[test]
    fn left_padded_or_gapped_masks_fail() {
        let left = Tensor::new(&[[0u32, 1, 1]], &Device::Cpu).unwrap();
        assert!(ensure_right_padded(&left).is_err());
        let gapped = Tensor::new(&[[1u32, 1, 1], [1, 0, 1]], &Device::Cpu).unwrap();
        let err = ensure_right_padded(&gapped).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn weight_layout_prefers_single_file() {
        let files = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            weight_layout(&files(&["config.json", "model.safetensors", "model.safetensors.index.json"])),
            Some(WeightLayout::Single)
        );
        assert_eq!(
            weight_layout(&files(&["config.json", "model.safetensors.index.json"])),
            Some(WeightLayout::Sharded)
        );
        assert_eq!(weight_layout(&files(&["config.json", "pytorch_model.bin"])), None);
    }

    #[test]
    fn repo_access_failure_is_not_masked() {
        let (endpoint, server) =
            crate::tests::test_utils::serve_once("401 Unauthorized", r#"{"error": "gated"}"#);
        let hub = HubClient::new(endpoint, None).unwrap();

        let err = ModelFiles::resolve("herm-test/gated-model", &hub).unwrap_err();
        server.join().unwrap();

        assert!(matches!(err, EvalError::Hub { .. }));
        assert!(err.to_string().contains("listing herm-test/gated-model"));
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn cpu_uses_full_precision() {
        assert_eq!(dtype_for(&Device::Cpu), DType::F32);
        assert!(select_device(true).is_cpu());
    }
}
