//! Robust PBT - population-based training with subsequent adversarial attacks.
//!
//! A population of policy seeds is trained generation by generation with
//! exploit/explore selection on a bounded worker pool. The final seeds are
//! then attacked at every configured adversary level on a second pool.

pub mod attack;
pub mod backend;
pub mod cancel;
pub mod cli;
pub mod error;
pub mod events;
pub mod job;
pub mod mutation;
pub mod orchestrator;
pub mod pbt;
pub mod pool;
pub mod population;
pub mod report;
pub mod runner;
pub mod selection;
pub mod settings;
pub mod telemetry;

pub use backend::Backend;
pub use cancel::{CancelHandle, CancelToken};
pub use error::{JobError, PoolError, RunError};
pub use orchestrator::Orchestrator;
pub use report::{RunReport, RunStatus};
pub use settings::Settings;
