pub mod factory;
pub mod fetch;
pub mod output;
pub mod params;
pub mod periodic;
pub mod pool;
pub mod power;
pub mod reporter;
pub mod script;
pub mod supervisor;
pub mod task;
pub mod timer;

pub use factory::TaskFactory;
pub use fetch::{FetchReason, TaskEngine, UpdaterGate};
pub use output::SharedBuffer;
pub use reporter::Reporter;
pub use supervisor::{ExitKind, ProcessSupervisor};
pub use task::Task;
