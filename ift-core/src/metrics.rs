use anyhow::{Context, Result};
use ift_structs::core::MetricsRow;
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

pub trait MetricsSink {
    fn write_row(&mut self, row: &MetricsRow) -> Result<()>;
}

/// Appends one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: File,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open metrics file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonLinesSink {
    fn write_row(&mut self, row: &MetricsRow) -> Result<()> {
        let line = serde_json::to_string(row)?;
        writeln!(self.file, "{}", line)
            .with_context(|| format!("Failed to write to {}", self.path.display()))
    }
}

impl MetricsSink for Vec<MetricsRow> {
    fn write_row(&mut self, row: &MetricsRow) -> Result<()> {
        self.push(row.clone());
        Ok(())
    }
}
