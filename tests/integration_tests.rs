use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use gpt2::{inspect, load_model, Forward, Gpt2Config, Gpt2Error, Gpt2Model, ModelSize};
use std::collections::HashMap;
use std::path::PathBuf;

fn tiny_config(use_cache: bool) -> Gpt2Config {
    Gpt2Config::builder()
        .vocab_size(24)
        .hidden_size(16)
        .intermediate_size(64)
        .num_layers(4)
        .num_heads(4)
        .max_positions(12)
        .cache_limit(12)
        .use_cache(use_cache)
        .build()
        .unwrap()
}

fn random_model(config: &Gpt2Config) -> (Gpt2Model, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = Gpt2Model::new(config, vb).unwrap();
    (model, varmap)
}

fn ids(tokens: &[u32]) -> Tensor {
    Tensor::new(tokens, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

fn temp_checkpoint(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("gpt2-{}-{}.safetensors", tag, std::process::id()))
}

mod smoke {
    use super::*;

    #[test]
    fn test_zero_weights_small_preset_gives_constant_logits() {
        let config = Gpt2Config::new(16, ModelSize::Small);
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = Gpt2Model::new(&config, vb).unwrap();

        let logits = model.forward(&ids(&[464])).unwrap();
        assert_eq!(logits.dims(), &[1, 1, 50257]);

        let values: Vec<f32> = logits.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values.len(), 50257);
        assert!(values.iter().all(|&v| v == values[0]));
    }
}

mod caches {
    use super::*;
    use gpt2::ResettableCache;

    #[test]
    fn test_reset_restores_fresh_sequence() {
        let (model, _varmap) = random_model(&tiny_config(true));

        let first = model.forward(&ids(&[7])).unwrap();
        model.forward(&ids(&[1, 2])).unwrap();
        model.forward(&ids(&[3])).unwrap();
        model.forward(&ids(&[9, 4, 4])).unwrap();
        assert_eq!(model.seqlen_offset().unwrap(), 7);

        model.clear_kv_cache();
        assert!(model.caches().iter().all(|c| c.is_empty()));

        let again = model.forward(&ids(&[7])).unwrap();
        assert_eq!(max_abs_diff(&first, &again), 0.0);
    }

    #[test]
    fn test_incremental_decoding_matches_full_pass() {
        let (model, _varmap) = random_model(&tiny_config(true));
        let tokens = [5u32, 11, 2, 19, 3];

        let full = model.forward(&ids(&tokens)).unwrap();
        model.clear_kv_cache();

        model.forward(&ids(&tokens[..3])).unwrap();
        model.forward(&ids(&tokens[3..4])).unwrap();
        let last = model.forward(&ids(&tokens[4..])).unwrap();

        let expected = full.narrow(1, 4, 1).unwrap();
        assert!(max_abs_diff(&last, &expected) < 1e-4);
    }

    #[test]
    fn test_partial_reset_is_reported() {
        let (model, _varmap) = random_model(&tiny_config(true));
        model.forward(&ids(&[1, 2, 3])).unwrap();

        if let Some(handle) = model.caches().iter().next() {
            handle.clear();
        }
        let err = model.forward(&ids(&[4])).unwrap_err();
        assert!(matches!(err, Gpt2Error::CacheState(_)));

        model.clear_kv_cache();
        assert!(model.forward(&ids(&[4])).is_ok());
    }

    #[test]
    fn test_session_past_position_table_fails() {
        let (model, _varmap) = random_model(&tiny_config(true));
        model.forward(&ids(&[0; 10])).unwrap();
        let err = model.forward(&ids(&[1, 2, 3])).unwrap_err();
        assert!(matches!(
            err,
            Gpt2Error::PositionOutOfRange {
                offset: 10,
                seq_len: 3,
                max: 12
            }
        ));
    }
}

mod wiring {
    use super::*;
    use gpt2::ResettableCache;

    #[test]
    fn test_perturbing_block_mlp_leaves_earlier_blocks_unchanged() {
        let (model, varmap) = random_model(&tiny_config(false));
        let input = ids(&[3, 14, 15, 9, 2]);
        let before = model.forward_hidden_states(&input).unwrap();
        assert_eq!(before.len(), 5);

        let perturbed = 2;
        {
            let vars = varmap.data().lock().unwrap();
            let var = vars.get(&format!("h.{}.mlp.c_fc.weight", perturbed)).unwrap();
            let noise = Tensor::randn(0f32, 1.0, var.shape(), &Device::Cpu).unwrap();
            var.set(&noise).unwrap();
        }
        let after = model.forward_hidden_states(&input).unwrap();

        // states[0] is the embedding sum, states[i + 1] the output of block i
        for i in 0..=perturbed {
            assert_eq!(max_abs_diff(&before[i], &after[i]), 0.0, "state {}", i);
        }
        for i in perturbed + 1..before.len() {
            assert!(max_abs_diff(&before[i], &after[i]) > 0.0, "state {}", i);
        }
    }

    #[test]
    fn test_blocks_built_in_order_with_attention_caches() {
        let (model, _varmap) = random_model(&tiny_config(true));
        let indices: Vec<usize> = model.blocks().iter().map(|b| b.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        let labels: Vec<&str> = model.caches().iter().map(|c| c.label()).collect();
        assert_eq!(labels, vec!["h.0.attn.kv", "h.1.attn.kv", "h.2.attn.kv", "h.3.attn.kv", "position"]);
    }
}

mod checkpoint {
    use super::*;

    fn write_checkpoint(config: &Gpt2Config, path: &PathBuf, skip: Option<&str>, extra: bool) {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for spec in config.names.tensor_specs(config) {
            if Some(spec.name.as_str()) == skip {
                continue;
            }
            let t = Tensor::randn(0f32, 0.02, spec.shape.as_slice(), &Device::Cpu).unwrap();
            tensors.insert(spec.name, t);
        }
        if extra {
            tensors.insert(
                "attn.masked_bias".to_string(),
                Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap(),
            );
        }
        candle_core::safetensors::save(&tensors, path).unwrap();
    }

    #[test]
    fn test_complete_checkpoint_loads_and_runs() {
        let config = tiny_config(true);
        let path = temp_checkpoint("complete");
        write_checkpoint(&config, &path, None, true);

        let report = inspect(&[path.clone()], &config).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.matched, config.names.tensor_specs(&config).len());
        assert_eq!(report.unexpected, vec!["attn.masked_bias".to_string()]);

        let lm = load_model(&[path.clone()], &config, DType::F32, &Device::Cpu).unwrap();
        let logits = lm.model().forward(&ids(&[1, 2, 3])).unwrap();
        assert_eq!(logits.dims(), &[1, 3, 24]);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_tensor_rejected_before_loading() {
        let config = tiny_config(true);
        let path = temp_checkpoint("missing");
        write_checkpoint(&config, &path, Some("h.3.ln_2.bias"), false);

        let report = inspect(&[path.clone()], &config).unwrap();
        assert_eq!(report.missing, vec!["h.3.ln_2.bias".to_string()]);

        let err = load_model(&[path.clone()], &config, DType::F32, &Device::Cpu).err();
        assert!(matches!(err, Some(Gpt2Error::MissingTensors(ref names)) if names.len() == 1));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_shape_mismatch_reported() {
        let config = tiny_config(true);
        let path = temp_checkpoint("mismatch");
        let wider = Gpt2Config {
            max_position_embeddings: 16,
            ..config.clone()
        };
        write_checkpoint(&wider, &path, None, false);

        let report = inspect(&[path.clone()], &config).unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.mismatched.len(), 1);
        assert_eq!(report.mismatched[0].name, "wpe.weight");
        assert_eq!(report.mismatched[0].actual, vec![16, 16]);

        std::fs::remove_file(&path).ok();
    }
}
