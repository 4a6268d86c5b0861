//! Model workers: one OS process per active model.
//!
//! The server side ([`ModelSupervisor`], [`WorkerProcess`]) spawns the
//! current executable with the hidden `worker` subcommand and talks to it
//! over framed stdin/stdout ([`protocol`]). The child side
//! ([`runtime::run_worker`]) loads the model and runs the decode loop.

pub mod decode;
pub mod process;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod settings;
pub mod supervisor;

pub use decode::{BufferPolicy, DecodeState, Hypothesis};
pub use process::{StopOutcome, WorkerLauncher, WorkerProcess, WorkerState};
pub use protocol::{AudioFrame, WorkerInput, WorkerOutput, WorkerResult};
pub use queue::{InputQueue, OutputQueue, OutputRouter, Subscription, WorkerQueues};
pub use runtime::{LoopExit, run_worker};
pub use settings::WorkerSettings;
pub use supervisor::{ActiveWorker, ModelSupervisor, ModelSwitch, SupervisorSettings, SupervisorStatus};
