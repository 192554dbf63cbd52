pub mod config;
pub mod error;
pub mod textutil;
pub mod timeutil;
pub mod types;

pub use config::AgentConfig;
pub use error::{EngineError, EngineResult, InvalidTaskKind, PresetErrorCode};
pub use types::{
    CommandKind, OutputInfo, RepeatType, RunTaskInfo, SendFileTaskInfo, SessionTaskInfo, TaskBatch,
};
