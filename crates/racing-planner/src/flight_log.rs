//! Flight log
//!
//! Records the planned (reference) and actual positions of each tick and
//! writes them as an `.npz` archive with `planned` and `actual` arrays
//! (K×3), one archive per run. Write-only; nothing in the control loop
//! reads it back.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::info;
use nalgebra::Vector3;
use ndarray_npy::{NpzWriter, WriteNpzError};
use thiserror::Error;

use crate::config::FlightLogConfig;
use crate::warm_start::rows_to_array;

/// Flight log errors
#[derive(Debug, Error)]
pub enum FlightLogError {
    #[error("Flight log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write flight log: {0}")]
    Write(#[from] WriteNpzError),
}

/// Planned/actual trajectory recorder
#[derive(Debug, Clone)]
pub struct FlightRecorder {
    config: FlightLogConfig,
    planned: Vec<Vector3<f64>>,
    actual: Vec<Vector3<f64>>,
    run: usize,
}

impl FlightRecorder {
    pub fn new(config: FlightLogConfig) -> Self {
        Self {
            config,
            planned: Vec::new(),
            actual: Vec::new(),
            run: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Number of recorded ticks in the current run
    pub fn len(&self) -> usize {
        self.actual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actual.is_empty()
    }

    pub fn record(&mut self, planned: Vector3<f64>, actual: Vector3<f64>) {
        if self.config.enabled {
            self.planned.push(planned);
            self.actual.push(actual);
        }
    }

    /// Archive path of run `run`
    pub fn path_for(&self, run: usize) -> PathBuf {
        self.config
            .directory
            .join(format!("flight_log_{:03}{}.npz", run, self.config.suffix))
    }

    /// Persist the current run and start the next one
    ///
    /// Returns the written path, or `None` when disabled or nothing was recorded.
    pub fn flush(&mut self) -> Result<Option<PathBuf>, FlightLogError> {
        if !self.config.enabled || self.is_empty() {
            return Ok(None);
        }
        let path = self.path_for(self.run);
        fs::create_dir_all(&self.config.directory).map_err(|source| FlightLogError::Io {
            path: self.config.directory.clone(),
            source,
        })?;
        write_archive(&path, &self.planned, &self.actual)?;
        info!("Flight log written to {} ({} ticks)", path.display(), self.actual.len());

        self.planned.clear();
        self.actual.clear();
        self.run += 1;
        Ok(Some(path))
    }
}

fn write_archive(path: &Path, planned: &[Vector3<f64>], actual: &[Vector3<f64>]) -> Result<(), FlightLogError> {
    let file = File::create(path).map_err(|source| FlightLogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut npz = NpzWriter::new(file);
    npz.add_array("planned", &rows_to_array(planned.iter().map(|p| p.as_slice()), 3))?;
    npz.add_array("actual", &rows_to_array(actual.iter().map(|p| p.as_slice()), 3))?;
    npz.finish()?;
    Ok(())
}
