//! Process supervision
//!
//! Every external program the orchestrator runs (tunnel client, login flow,
//! deployed applications) is spawned through [`ProcessSupervisor`].

mod output;
mod supervisor;

pub use output::OutputBuffer;
pub use supervisor::{
    ExitInfo, ProcessEvent, ProcessHandle, ProcessId, ProcessInfo, ProcessSupervisor, SpawnSpec,
    SupervisedProcess,
};
