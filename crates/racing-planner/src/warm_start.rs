//! Solver warm start
//!
//! The previous solution is kept in one of two fixed-length horizon buffers.
//! Shifting writes the shifted copy into the other buffer and then swaps, so
//! the visible guess is always a complete horizon.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use ndarray::Array2;
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, WriteNpzError};
use thiserror::Error;

use racing_core::dynamics::{InputVector, StateVector, NU, NX};

/// Warm start errors
#[derive(Debug, Error)]
pub enum WarmStartError {
    #[error("Warm start file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read warm start archive: {0}")]
    Read(#[from] ReadNpzError),
    #[error("Failed to write warm start archive: {0}")]
    Write(#[from] WriteNpzError),
    #[error("Warm start shape mismatch: expected {expected_states} states and {expected_inputs} inputs, got {states} and {inputs}")]
    Shape {
        expected_states: usize,
        expected_inputs: usize,
        states: usize,
        inputs: usize,
    },
}

/// State and input trajectories over the horizon (N+1 states, N inputs)
#[derive(Debug, Clone, PartialEq)]
pub struct Horizon {
    pub states: Vec<StateVector>,
    pub inputs: Vec<InputVector>,
}

impl Horizon {
    /// Cold guess: hold `x0`, zero command rates
    pub fn cold(x0: &StateVector, num_steps: usize) -> Self {
        Self {
            states: vec![*x0; num_steps + 1],
            inputs: vec![InputVector::zeros(); num_steps],
        }
    }

    pub fn num_steps(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_finite(&self) -> bool {
        self.states.iter().all(|x| x.iter().all(|v| v.is_finite()))
            && self.inputs.iter().all(|u| u.iter().all(|v| v.is_finite()))
    }

    fn check_shape(&self, num_steps: usize) -> Result<(), WarmStartError> {
        if self.states.len() != num_steps + 1 || self.inputs.len() != num_steps {
            return Err(WarmStartError::Shape {
                expected_states: num_steps + 1,
                expected_inputs: num_steps,
                states: self.states.len(),
                inputs: self.inputs.len(),
            });
        }
        Ok(())
    }

    /// Receding-horizon shift into `out`: drop the first node, repeat the last
    fn shift_into(&self, out: &mut Horizon) {
        out.states.clear();
        out.inputs.clear();
        out.states.extend_from_slice(&self.states[1..]);
        out.inputs.extend_from_slice(&self.inputs[1..]);
        if let Some(last) = self.states.last() {
            out.states.push(*last);
        }
        if let Some(last) = self.inputs.last() {
            out.inputs.push(*last);
        }
    }
}

/// Warm start cache owned by the control loop
#[derive(Debug, Clone)]
pub struct WarmStart {
    buffers: [Horizon; 2],
    front: usize,
    valid: bool,
    num_steps: usize,
}

impl WarmStart {
    pub fn new(num_steps: usize) -> Self {
        let empty = Horizon::cold(&StateVector::zeros(), num_steps);
        Self {
            buffers: [empty.clone(), empty],
            front: 0,
            valid: false,
            num_steps,
        }
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Current guess, if any
    pub fn guess(&self) -> Option<&Horizon> {
        self.valid.then(|| &self.buffers[self.front])
    }

    /// Store a solved horizon as the next guess
    pub fn load(&mut self, horizon: &Horizon) -> Result<(), WarmStartError> {
        horizon.check_shape(self.num_steps)?;
        let back = 1 - self.front;
        let buffer = &mut self.buffers[back];
        buffer.states.clone_from(&horizon.states);
        buffer.inputs.clone_from(&horizon.inputs);
        self.front = back;
        self.valid = true;
        Ok(())
    }

    /// Advance the guess by one control step
    pub fn advance(&mut self) {
        if !self.valid || self.num_steps == 0 {
            return;
        }
        let back = 1 - self.front;
        let (a, b) = self.buffers.split_at_mut(1);
        let (src, dst) = if self.front == 0 { (&a[0], &mut b[0]) } else { (&b[0], &mut a[0]) };
        src.shift_into(dst);
        self.front = back;
    }

    /// Drop the guess; the next solve starts cold
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Load an initial guess from an `.npz` archive with `states` (N+1×14)
    /// and `inputs` (N×4) arrays
    pub fn from_file(path: impl AsRef<Path>, num_steps: usize) -> Result<Self, WarmStartError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| WarmStartError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut npz = NpzReader::new(file)?;
        let states: Array2<f64> = read_named(&mut npz, "states")?;
        let inputs: Array2<f64> = read_named(&mut npz, "inputs")?;

        let shape_error = || WarmStartError::Shape {
            expected_states: num_steps + 1,
            expected_inputs: num_steps,
            states: states.nrows(),
            inputs: inputs.nrows(),
        };
        if states.ncols() != NX || inputs.ncols() != NU {
            return Err(shape_error());
        }

        let horizon = Horizon {
            states: states.rows().into_iter().map(|r| StateVector::from_iterator(r.iter().copied())).collect(),
            inputs: inputs.rows().into_iter().map(|r| InputVector::from_iterator(r.iter().copied())).collect(),
        };
        let mut warm = Self::new(num_steps);
        warm.load(&horizon)?;
        Ok(warm)
    }

    /// Write the current guess to an `.npz` archive
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), WarmStartError> {
        let path = path.as_ref();
        let horizon = &self.buffers[self.front];
        let file = File::create(path).map_err(|source| WarmStartError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut npz = NpzWriter::new(file);
        npz.add_array("states", &rows_to_array(horizon.states.iter().map(|x| x.as_slice()), NX))?;
        npz.add_array("inputs", &rows_to_array(horizon.inputs.iter().map(|u| u.as_slice()), NU))?;
        npz.finish()?;
        Ok(())
    }
}

/// Stack equal-length rows into a 2-D array
pub(crate) fn rows_to_array<'a>(rows: impl Iterator<Item = &'a [f64]>, width: usize) -> Array2<f64> {
    let flat: Vec<f64> = rows.flat_map(|r| r.iter().copied()).collect();
    let height = flat.len() / width.max(1);
    Array2::from_shape_fn((height, width), |(i, j)| flat[i * width + j])
}

/// Arrays written by NumPy carry a `.npy` suffix inside the archive
fn read_named<R: Read + Seek>(npz: &mut NpzReader<R>, name: &str) -> Result<Array2<f64>, ReadNpzError> {
    match npz.by_name(&format!("{}.npy", name)) {
        Ok(array) => Ok(array),
        Err(_) => npz.by_name(name),
    }
}
