use anyhow::{Context, Result};
use ift_structs::core::Checkpoint;
use ift_utils::{compress_obj, decompress_obj};
use log::info;
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const CHECKPOINT_FILE: &str = "checkpoint.zlib";

pub trait CheckpointSink {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<()>;
}

/// Overwrites `<dir>/checkpoint.zlib` on every save.
#[derive(Clone, Debug)]
pub struct FileCheckpointSink {
    pub dir: PathBuf,
}

impl FileCheckpointSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }
}

impl CheckpointSink for FileCheckpointSink {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create directory {}", self.dir.display()))?;
        let path = self.path();
        fs::write(&path, compress_obj(checkpoint)?)
            .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;
        info!("Saved checkpoint for epoch {} to {}", checkpoint.epoch, path.display());
        Ok(())
    }
}

/// Keeps every checkpoint in memory.
impl CheckpointSink for Vec<Checkpoint> {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.push(checkpoint.clone());
        Ok(())
    }
}

/// Reads a checkpoint from a file, or from `checkpoint.zlib` inside a
/// directory.
pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let path = if path.is_dir() {
        path.join(CHECKPOINT_FILE)
    } else {
        path.to_path_buf()
    };
    let bytes =
        fs::read(&path).with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
    decompress_obj(&bytes).with_context(|| format!("Failed to decode checkpoint {}", path.display()))
}
