use std::{
    ffi::OsString,
    fmt,
    path::PathBuf,
    time::{Duration, SystemTime},
};

use serde::Serialize;

/// 作业标识：提交序号，从 0 开始。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(pub usize);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 类型化的外部命令描述：可执行文件 + 参数向量，不经过 shell。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub working_dir: Option<PathBuf>,
    /// 统计引擎预期写出的结构化输出文件。
    pub output_path: Option<PathBuf>,
}

impl CommandDescriptor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            output_path: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub(crate) fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl fmt::Display for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// 提交给作业池的单个工作项。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    /// 人类可读标签，通常为 `domain/server/period`。
    pub label: String,
    pub command: CommandDescriptor,
}

impl Job {
    pub fn new(label: impl Into<String>, command: CommandDescriptor) -> Self {
        Self {
            label: label.into(),
            command,
        }
    }
}

/// 作业状态机：`Pending → Running → {Succeeded, Failed, Cancelled}`；
/// 尚未启动即被取消的作业直接 `Pending → Cancelled`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 作业失败原因。启动失败与执行失败在控制流上等价，只在细节上区分。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    #[error("failed to launch: {detail}")]
    Launch { detail: String },
    #[error("exited with status {code}")]
    ExitCode { code: i32 },
    #[error("terminated by signal")]
    Signal,
    #[error("timed out after {}ms", .after.as_millis())]
    TimedOut {
        #[serde(with = "duration_ms")]
        after: Duration,
    },
    #[error("failed while waiting for exit: {detail}")]
    Wait { detail: String },
}

impl JobFailure {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "logbatch.job.launch_failed",
            Self::ExitCode { .. } => "logbatch.job.exit_nonzero",
            Self::Signal => "logbatch.job.signalled",
            Self::TimedOut { .. } => "logbatch.job.timed_out",
            Self::Wait { .. } => "logbatch.job.wait_failed",
        }
    }
}

/// 作业终态记录，作为完成通知与汇总的载体。
#[derive(Clone, Debug, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub label: String,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub failure: Option<JobFailure>,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    #[serde(skip)]
    pub output_path: Option<PathBuf>,
    /// 子进程 stderr 的末尾片段。
    pub stderr_tail: Option<String>,
}

impl JobRecord {
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.finished_at?);
        end.duration_since(start).ok()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
