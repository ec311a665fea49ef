use crate::core::model::{Gpt2Config, Gpt2ForCausalLM};
use crate::core::{Gpt2Error, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use memmap2::Mmap;
use safetensors::tensor::TensorInfo;
use safetensors::SafeTensors;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Tensor table of one safetensors file, read from the header without
/// touching tensor data.
#[derive(Debug, Clone)]
pub struct CheckpointIndex {
    pub path: PathBuf,
    pub tensors: HashMap<String, TensorInfo>,
    pub metadata: HashMap<String, String>,
}

impl CheckpointIndex {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and dropped before this function returns.
        let mmap = unsafe { Mmap::map(&file)? };
        let (_, header) = SafeTensors::read_metadata(&mmap).map_err(|e| Gpt2Error::InvalidCheckpoint {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            tensors: header
                .tensors()
                .into_iter()
                .map(|(name, info)| (name, info.clone()))
                .collect(),
            metadata: header.metadata().clone().unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MismatchedTensor {
    pub name: String,
    pub expected: Vec<usize>,
    pub actual: Vec<usize>,
}

/// Comparison of checkpoint contents against the names a config expects.
#[derive(Debug, Clone, Default)]
pub struct CheckpointReport {
    pub matched: usize,
    pub missing: Vec<String>,
    pub mismatched: Vec<MismatchedTensor>,
    pub unexpected: Vec<String>,
}

impl CheckpointReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }

    pub fn ensure_complete(&self) -> Result<()> {
        if !self.missing.is_empty() {
            return Err(Gpt2Error::MissingTensors(self.missing.clone()));
        }
        if let Some(bad) = self.mismatched.first() {
            return Err(Gpt2Error::ShapeMismatch {
                what: bad.name.clone(),
                expected: format!("{:?}", bad.expected),
                actual: bad.actual.clone(),
            });
        }
        Ok(())
    }
}

/// Checks `paths` (a sharded checkpoint is several files) against every
/// tensor `config` needs.
pub fn inspect(paths: &[PathBuf], config: &Gpt2Config) -> Result<CheckpointReport> {
    let mut available: HashMap<String, Vec<usize>> = HashMap::new();
    for path in paths {
        let index = CheckpointIndex::read(path)?;
        tracing::debug!(path = %path.display(), tensors = index.tensors.len(), "read checkpoint header");
        available.extend(index.tensors.into_iter().map(|(name, info)| (name, info.shape)));
    }

    let mut report = CheckpointReport::default();
    let mut expected_names = BTreeSet::new();
    for spec in config.names.tensor_specs(config) {
        match available.get(&spec.name) {
            None => report.missing.push(spec.name.clone()),
            Some(shape) if *shape != spec.shape => report.mismatched.push(MismatchedTensor {
                name: spec.name.clone(),
                expected: spec.shape.clone(),
                actual: shape.clone(),
            }),
            Some(_) => report.matched += 1,
        }
        expected_names.insert(spec.name);
    }

    let mut unexpected: Vec<String> = available
        .into_keys()
        .filter(|name| !expected_names.contains(name))
        .collect();
    unexpected.sort();
    report.unexpected = unexpected;
    Ok(report)
}

/// `*.safetensors` files in `dir`, sorted by name; a file path is returned as is.
pub fn find_weights<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| p.extension().map(|e| e == "safetensors").unwrap_or(false))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(Gpt2Error::InvalidCheckpoint {
            path: path.display().to_string(),
            reason: "no .safetensors files found".to_string(),
        });
    }
    Ok(files)
}

/// Verifies the checkpoint and builds the model on `device`.
pub fn load_model(
    paths: &[PathBuf],
    config: &Gpt2Config,
    dtype: DType,
    device: &Device,
) -> Result<Gpt2ForCausalLM> {
    let report = inspect(paths, config)?;
    report.ensure_complete()?;
    if !report.unexpected.is_empty() {
        tracing::warn!(
            count = report.unexpected.len(),
            first = %report.unexpected[0],
            "checkpoint holds tensors the model does not use"
        );
    }

    // SAFETY: the files are mapped read-only and must not be modified while the model lives.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    tracing::info!(files = paths.len(), tensors = report.matched, "loading GPT-2 weights");
    Gpt2ForCausalLM::new(config, vb)
}
