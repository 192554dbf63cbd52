//! Wire types for the control-plane task protocol.
//!
//! Field names follow the JSON schema of the fetch-task-list response:
//! a top-level [`TaskBatch`] with `run`/`stop`/`test` entries wrapping a
//! [`RunTaskInfo`] plus its [`OutputInfo`] and [`RepeatType`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How often a task record is (re-)invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum RepeatType {
    #[default]
    Once,
    Period,
    NextRebootOnly,
    EveryReboot,
    Rate,
    At,
}

impl RepeatType {
    /// Repeats that re-run the same script file and therefore tolerate an
    /// already-existing script on disk.
    pub fn is_repeated(self) -> bool {
        matches!(
            self,
            RepeatType::Period | RepeatType::EveryReboot | RepeatType::Rate | RepeatType::At
        )
    }

    /// Repeats that are driven by a timer rather than run on arrival.
    pub fn is_scheduled(self) -> bool {
        matches!(self, RepeatType::Period | RepeatType::Rate | RepeatType::At)
    }
}

/// Interpreter selection for a task's script payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Bat,
    PowerShell,
    Shell,
}

impl CommandKind {
    pub fn from_wire(command_type: &str) -> Option<Self> {
        match command_type {
            "RunBatScript" => Some(CommandKind::Bat),
            "RunPowerShellScript" => Some(CommandKind::PowerShell),
            "RunShellScript" => Some(CommandKind::Shell),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            CommandKind::Bat => ".bat",
            CommandKind::PowerShell => ".ps1",
            CommandKind::Shell => ".sh",
        }
    }
}

/// One command invocation record as delivered by the control plane.
/// Immutable after fetch.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RunTaskInfo {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(rename = "taskID")]
    pub task_id: String,
    #[serde(rename = "commandId")]
    pub command_id: String,
    #[serde(rename = "enableParameter")]
    pub enable_parameter: bool,
    #[serde(rename = "timeOut")]
    pub timeout: String,
    #[serde(rename = "commandName")]
    pub command_name: String,
    #[serde(rename = "commandContent")]
    pub content: String,
    #[serde(rename = "workingDirectory")]
    pub working_dir: String,
    pub args: String,
    #[serde(rename = "cron")]
    pub cron_at: String,
    pub username: String,
    #[serde(rename = "windowsPasswordName")]
    pub password: String,
    #[serde(rename = "creationTime")]
    pub creation_time: i64,

    // Filled in from the enclosing batch entry, not from the `task` object.
    #[serde(skip)]
    pub output: OutputInfo,
    #[serde(skip)]
    pub repeat: RepeatType,
    #[serde(skip)]
    pub env_arguments: HashMap<String, String>,
}

impl RunTaskInfo {
    /// Per-task deadline in seconds; an unparseable value falls back to 3600.
    pub fn timeout_seconds(&self) -> u64 {
        self.timeout.parse().unwrap_or(3600)
    }

    pub fn command_kind(&self) -> Option<CommandKind> {
        CommandKind::from_wire(&self.command_type)
    }
}

/// Running-output delivery knobs attached to each task record.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputInfo {
    /// Running-output tick interval in milliseconds (floored to 1000).
    pub interval: i64,
    #[serde(rename = "logQuota")]
    pub log_quota: usize,
    #[serde(rename = "skipEmpty")]
    pub skip_empty: bool,
    #[serde(rename = "sendStart")]
    pub send_start: bool,
}

/// File-transfer record; parsed and routed, executed elsewhere.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SendFileTaskInfo {
    pub content: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub destination: String,
    pub group: String,
    pub mode: String,
    pub name: String,
    pub overwrite: bool,
    pub owner: String,
    pub signature: String,
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub timeout: i64,
    #[serde(skip)]
    pub output: OutputInfo,
}

/// Interactive-session record; parsed and routed, executed elsewhere.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionTaskInfo {
    #[serde(rename = "cmdContent")]
    pub cmd_content: String,
    pub username: String,
    #[serde(rename = "windowsPasswordName")]
    pub password: String,
    #[serde(rename = "channelId")]
    pub session_id: String,
    #[serde(rename = "websocketUrl")]
    pub websocket_url: String,
    #[serde(rename = "portNumber")]
    pub port_number: String,
    #[serde(rename = "flowLimit")]
    pub flow_limit: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskItem {
    pub task: RunTaskInfo,
    pub output: OutputInfo,
    pub repeat: Option<RepeatType>,
}

impl TaskItem {
    /// Flatten the batch entry into a self-contained [`RunTaskInfo`].
    ///
    /// A missing `repeat` derives `Period` when a cron expression is present,
    /// `Once` otherwise. When `enableParameter` is set the builtin
    /// environment arguments are seeded from the record itself.
    pub fn into_run_task_info(self, instance_id: &str) -> RunTaskInfo {
        let mut info = self.task;
        info.instance_id = instance_id.to_string();
        info.output = self.output;
        info.repeat = match self.repeat {
            Some(repeat) => repeat,
            None if !info.cron_at.is_empty() => RepeatType::Period,
            None => RepeatType::Once,
        };

        if info.enable_parameter {
            info.env_arguments = HashMap::from([
                ("InstanceId".to_string(), instance_id.to_string()),
                ("CommandId".to_string(), info.command_id.clone()),
                ("InvokeId".to_string(), info.task_id.clone()),
            ]);
        }

        info
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SendFileItem {
    pub task: SendFileTaskInfo,
    pub output: OutputInfo,
}

/// Top-level fetch-task-list response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskBatch {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    pub run: Vec<TaskItem>,
    pub stop: Vec<TaskItem>,
    pub test: Vec<TaskItem>,
    pub file: Vec<SendFileItem>,
    pub session: Vec<SessionTaskInfo>,
}

impl TaskBatch {
    pub fn parse(body: &str) -> Self {
        match serde_json::from_str::<TaskBatch>(body) {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(error = %err, "invalid task batch json");
                TaskBatch::default()
            }
        }
    }

    pub fn run_infos(&self) -> Vec<RunTaskInfo> {
        self.run
            .iter()
            .cloned()
            .map(|item| item.into_run_task_info(&self.instance_id))
            .collect()
    }

    pub fn stop_infos(&self) -> Vec<RunTaskInfo> {
        self.stop
            .iter()
            .cloned()
            .map(|item| item.into_run_task_info(&self.instance_id))
            .collect()
    }

    pub fn test_infos(&self) -> Vec<RunTaskInfo> {
        self.test
            .iter()
            .cloned()
            .map(|item| item.into_run_task_info(&self.instance_id))
            .collect()
    }

    pub fn file_infos(&self) -> Vec<SendFileTaskInfo> {
        self.file
            .iter()
            .cloned()
            .map(|item| {
                let mut info = item.task;
                info.output = item.output;
                info
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_batch_routes_all_categories() {
        let body = serde_json::json!({
            "instanceId": "i-0abc",
            "run": [{
                "task": {
                    "type": "RunShellScript",
                    "taskID": "t-run-1",
                    "commandId": "c-1",
                    "commandContent": "ZWNobyBoaQ==",
                    "timeOut": "30"
                },
                "output": {"interval": 3000, "logQuota": 12000, "sendStart": true},
                "repeat": "Once"
            }],
            "stop": [{"task": {"taskID": "t-stop-1"}}],
            "test": [{"task": {"taskID": "t-test-1", "type": "RunShellScript"}}],
            "file": [{"task": {"taskID": "t-file-1", "destination": "/tmp/x"}}],
            "session": [{"channelId": "s-1", "cmdContent": "bash"}]
        })
        .to_string();

        let batch = TaskBatch::parse(&body);
        assert_eq!(batch.instance_id, "i-0abc");
        assert_eq!(batch.run.len(), 1);
        assert_eq!(batch.stop.len(), 1);
        assert_eq!(batch.test.len(), 1);
        assert_eq!(batch.file.len(), 1);
        assert_eq!(batch.session.len(), 1);

        let run = batch.run_infos().remove(0);
        assert_eq!(run.instance_id, "i-0abc");
        assert_eq!(run.task_id, "t-run-1");
        assert_eq!(run.repeat, RepeatType::Once);
        assert_eq!(run.output.interval, 3000);
        assert!(run.output.send_start);
        assert_eq!(run.timeout_seconds(), 30);
    }

    #[test]
    fn parse_batch_tolerates_garbage() {
        let batch = TaskBatch::parse("not json at all");
        assert!(batch.run.is_empty());
        assert!(batch.stop.is_empty());
    }

    #[test]
    fn missing_repeat_derives_from_cron() {
        let item = TaskItem {
            task: RunTaskInfo {
                task_id: "t-1".into(),
                cron_at: "0 * * * * *".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            item.into_run_task_info("i-1").repeat,
            RepeatType::Period
        );

        let item = TaskItem::default();
        assert_eq!(item.into_run_task_info("i-1").repeat, RepeatType::Once);
    }

    #[test]
    fn enable_parameter_seeds_builtin_arguments() {
        let item = TaskItem {
            task: RunTaskInfo {
                task_id: "t-9".into(),
                command_id: "c-9".into(),
                enable_parameter: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let info = item.into_run_task_info("i-9");
        assert_eq!(info.env_arguments.get("InstanceId").unwrap(), "i-9");
        assert_eq!(info.env_arguments.get("CommandId").unwrap(), "c-9");
        assert_eq!(info.env_arguments.get("InvokeId").unwrap(), "t-9");
    }

    #[test]
    fn timeout_falls_back_to_default() {
        let info = RunTaskInfo {
            timeout: "not-a-number".into(),
            ..Default::default()
        };
        assert_eq!(info.timeout_seconds(), 3600);
    }

    #[test]
    fn command_kind_mapping() {
        assert_eq!(
            CommandKind::from_wire("RunShellScript"),
            Some(CommandKind::Shell)
        );
        assert_eq!(CommandKind::from_wire("RunSomething"), None);
        assert_eq!(CommandKind::Bat.extension(), ".bat");
        assert_eq!(CommandKind::PowerShell.extension(), ".ps1");
    }
}
