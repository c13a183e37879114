/// Network checkpointing with safetensors
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use safetensors::tensor::SafeTensors;

/// Header key holding the serialized `CheckpointMetadata`
const METADATA_KEY: &str = "checkpoint";

/// Checkpoint metadata
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    /// Network the tensors belong to
    pub network: String,
    /// Epoch the checkpoint was taken after
    pub epoch: usize,
    /// Learning rate at checkpoint
    pub lr: f64,
    /// Validation accuracy of that epoch
    pub val_acc: f64,
}

/// Named tensors of one network plus metadata
pub struct Checkpoint {
    pub tensors: HashMap<String, Tensor>,
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    pub fn new(tensors: HashMap<String, Tensor>, metadata: CheckpointMetadata) -> Self {
        Self { tensors, metadata }
    }

    /// Snapshot the current values of every var in `varmap`
    pub fn from_varmap(varmap: &VarMap, metadata: CheckpointMetadata) -> crate::Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| crate::DaError::Training("variable map lock poisoned".to_string()))?;
        let tensors = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        Ok(Self::new(tensors, metadata))
    }

    /// Save as a safetensors file with the metadata in its header
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let header = serde_json::to_string(&self.metadata)?;
        let info = Some(HashMap::from([(METADATA_KEY.to_string(), header)]));

        let mut entries: Vec<(&String, &Tensor)> = self.tensors.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        safetensors::serialize_to_file(entries, &info, path.as_ref())?;
        Ok(())
    }

    /// Load tensors onto `device` together with the header metadata
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> crate::Result<Self> {
        let buffer = std::fs::read(path.as_ref())?;
        let (_, header) = SafeTensors::read_metadata(&buffer)?;
        let metadata = match header.metadata().as_ref().and_then(|m| m.get(METADATA_KEY)) {
            Some(json) => serde_json::from_str(json)?,
            None => {
                log::warn!("{} carries no checkpoint metadata", path.as_ref().display());
                CheckpointMetadata::default()
            }
        };

        let tensors = candle_core::safetensors::load_buffer(&buffer, device)?;
        Ok(Self { tensors, metadata })
    }
}

/// Path of one network's checkpoint: `<dir>/<epoch>_<network>.safetensors`
pub fn checkpoint_path<P: AsRef<Path>>(dir: P, epoch: usize, network: &str) -> PathBuf {
    dir.as_ref().join(format!("{}_{}.safetensors", epoch, network))
}

/// Write one checkpoint per network into `dir`
pub fn save_networks<P: AsRef<Path>>(
    dir: P,
    networks: &[(&str, &VarMap)],
    epoch: usize,
    lr: f64,
    val_acc: f64,
) -> crate::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir.as_ref())?;

    let mut written = Vec::with_capacity(networks.len());
    for (name, varmap) in networks {
        let metadata = CheckpointMetadata {
            network: name.to_string(),
            epoch,
            lr,
            val_acc,
        };
        let path = checkpoint_path(dir.as_ref(), epoch, name);
        Checkpoint::from_varmap(varmap, metadata)?.save(&path)?;
        log::info!("Saved checkpoint {}", path.display());
        written.push(path);
    }
    Ok(written)
}
