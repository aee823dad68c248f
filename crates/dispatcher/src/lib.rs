//! CoreLoop Dispatcher
//!
//! Data-parallel inference over several cores: one worker thread per core,
//! each owning a model replica, fed from a shared request queue with results
//! delivered through callbacks. Ships a reference compiler and CPU backend
//! behind the [`backend::ModelLoader`] seam.

pub mod artifact;
pub mod backend;
pub mod compiler;
pub mod cores;
pub mod dispatcher;
pub mod parallel;
pub mod queue;
pub mod request;
pub mod tensor;
pub mod worker;

pub use backend::{CpuLoader, CpuReplica, ModelLoader, ModelReplica};
pub use compiler::{compile, ArtifactSummary, CompileOptions, DenseLayer, ModelGraph};
pub use cores::{parse_core_list, resolve_cores};
pub use dispatcher::{Dispatcher, DispatcherOptions};
pub use parallel::{BatchStats, DataParallel, ParallelOutput};
pub use request::{Callback, Completion, InferenceRequest, RequestId, Timings};
pub use tensor::{Activation, Tensor};
pub use worker::{Worker, WorkerStats};
