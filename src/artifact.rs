use std::fmt;
use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use clap::ValueEnum;

use crate::errors::{ProcareSegError, Result};
use crate::network::Unet;
use crate::training::TrainingConfig;

/// Records are stored at full precision so a reloaded checkpoint reproduces
/// the in-memory parameters bit for bit.
pub type ModelRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

pub const CONFIG_FILE: &str = "config.json";
pub const RECORD_EXTENSION: &str = "mpk";

/// Which of the two persisted parameter sets to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Checkpoint {
    /// Lowest validation loss seen during training.
    #[default]
    Best,
    /// State at the end of training.
    Final,
}

impl Checkpoint {
    pub const fn stem(self) -> &'static str {
        match self {
            Checkpoint::Best => "best",
            Checkpoint::Final => "final",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stem())
    }
}

/// Directory holding `config.json`, `best.mpk` and `final.mpk`.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    dir: PathBuf,
}

impl ModelArtifact {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Creates the directory if needed.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| ProcareSegError::FileSystem {
            path: dir.clone(),
            operation: "artifact directory creation".to_string(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Record path without extension, as the recorder expects it.
    fn record_stem(&self, checkpoint: Checkpoint) -> PathBuf {
        self.dir.join(checkpoint.stem())
    }

    pub fn record_path(&self, checkpoint: Checkpoint) -> PathBuf {
        self.record_stem(checkpoint).with_extension(RECORD_EXTENSION)
    }

    pub fn has_checkpoint(&self, checkpoint: Checkpoint) -> bool {
        self.config_path().is_file() && self.record_path(checkpoint).is_file()
    }

    pub fn save_config(&self, config: &TrainingConfig) -> Result<()> {
        let path = self.config_path();
        config.save(&path).map_err(|e| ProcareSegError::FileSystem {
            path,
            operation: "training config save".to_string(),
            source: e,
        })
    }

    pub fn load_config(&self) -> Result<TrainingConfig> {
        Ok(TrainingConfig::load(self.config_path())?)
    }

    pub fn save_model<B: Backend>(&self, model: &Unet<B>, checkpoint: Checkpoint) -> Result<()> {
        model
            .clone()
            .save_file(self.record_stem(checkpoint), &ModelRecorder::new())?;
        Ok(())
    }

    /// Rebuilds the network from `config.json` and loads the chosen record.
    pub fn load_model<B: Backend>(
        &self,
        checkpoint: Checkpoint,
        device: &B::Device,
    ) -> Result<(Unet<B>, TrainingConfig)> {
        let config = self.load_config()?;
        let record = self.record_path(checkpoint);
        if !record.is_file() {
            return Err(ProcareSegError::FileSystem {
                path: record,
                operation: format!("{checkpoint} checkpoint lookup"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "record not found"),
            });
        }

        let model = config.model.try_init::<B>(device)?.load_file(
            self.record_stem(checkpoint),
            &ModelRecorder::new(),
            device,
        )?;
        Ok((model, config))
    }
}
