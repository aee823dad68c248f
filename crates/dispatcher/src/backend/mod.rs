//! Model loading seam between the dispatcher and an execution backend
//!
//! A [`ModelLoader`] is shared by every worker; each worker calls
//! [`ModelLoader::load`] on its own thread and owns the returned replica for
//! its whole lifetime, so replicas never need to be `Send`.

pub mod cpu;

pub use cpu::{CpuLoader, CpuReplica};

use crate::tensor::Tensor;
use coreloop_common::Result;
use std::path::Path;

/// One loaded model bound to one core
pub trait ModelReplica {
    /// Core this replica runs on
    fn core_id(&self) -> usize;

    /// Run inference on one request's inputs
    fn infer(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>>;
}

/// Loads compiled artifacts onto cores
pub trait ModelLoader: Send + Sync {
    /// Load `artifact_path` onto `core_id`
    ///
    /// Errors are treated as load failures and are fatal to the calling worker.
    fn load(&self, artifact_path: &Path, core_id: usize) -> Result<Box<dyn ModelReplica>>;
}
