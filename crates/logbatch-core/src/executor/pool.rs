use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    io::ErrorKind,
    path::Path,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{OwnedSemaphorePermit, Semaphore, mpsc},
    task::{JoinError, JoinSet},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use super::{
    cancel::Cancellation,
    job::{Job, JobFailure, JobId, JobRecord, JobState},
    progress::ProgressReport,
};
use crate::config::RunSettings;

/// 失败作业保留的 stderr 末尾字节数。
const STDERR_TAIL_BYTES: usize = 2048;
/// 子进程退出后等待 stderr 读尽的上限；孙进程可能继续持有管道。
const STDERR_DRAIN_GRACE: Duration = Duration::from_millis(200);
const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// 进度输出回调。
pub type ProgressSink = Arc<dyn Fn(&ProgressReport) + Send + Sync>;

/// 作业池的不可变配置。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// 同时处于 Running 的作业上限，至少为 1。
    pub max_concurrent: usize,
    /// 单作业超时；`None` 表示不限。
    pub job_timeout: Option<Duration>,
    pub progress_interval: Duration,
}

impl PoolConfig {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            job_timeout: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// 设置单作业超时；`None` 表示不限时。
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// 设置进度输出间隔。
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval.max(Duration::from_millis(10));
        self
    }
}

impl From<&RunSettings> for PoolConfig {
    fn from(settings: &RunSettings) -> Self {
        Self::new(settings.max_concurrent).with_job_timeout(settings.job_timeout)
    }
}

/// 一次 `run` 的汇总结果，按作业 id 归档，与完成顺序无关。
#[derive(Clone, Debug, Default, Serialize)]
pub struct JobBatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// 运行期间收到取消信号；此时结果可能只覆盖部分作业的实际执行。
    pub was_cancelled: bool,
    pub exit_codes: BTreeMap<JobId, Option<i32>>,
    pub failures: BTreeMap<JobId, JobFailure>,
    /// 观测到的最大并发 Running 数。
    pub peak_running: usize,
    pub elapsed: Duration,
}

impl JobBatchResult {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0 && !self.was_cancelled
    }

    fn fold(&mut self, record: &JobRecord) {
        match record.state {
            JobState::Succeeded => self.succeeded += 1,
            JobState::Failed => self.failed += 1,
            JobState::Cancelled => self.cancelled += 1,
            JobState::Pending | JobState::Running => {
                error!(job = %record.id, state = %record.state, "non-terminal record folded into result");
            }
        }
        self.exit_codes.insert(record.id, record.exit_code);
        if let Some(failure) = &record.failure {
            self.failures.insert(record.id, failure.clone());
        }
    }
}

/// 作业状态表的只读快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub finished: usize,
    pub peak_running: usize,
}

/// 单次运行的作业状态表；Running 计数与状态迁移在同一把锁内完成。
#[derive(Debug, Default)]
struct JobTable {
    inner: Mutex<TableInner>,
}

#[derive(Debug, Default)]
struct TableInner {
    states: Vec<JobState>,
    running: usize,
    peak_running: usize,
    finished: usize,
}

impl JobTable {
    fn new(total: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                states: vec![JobState::Pending; total],
                ..TableInner::default()
            }),
        }
    }

    /// 执行状态迁移，非法迁移被忽略并返回 `false`。
    fn transition(&self, id: JobId, to: JobState) -> bool {
        let mut inner = self.inner.lock();
        let Some(from) = inner.states.get(id.0).copied() else {
            return false;
        };
        let allowed = match (from, to) {
            (JobState::Pending, JobState::Running | JobState::Cancelled) => true,
            (JobState::Running, next) => next.is_terminal(),
            _ => false,
        };
        if !allowed {
            debug!(job = %id, %from, %to, "ignoring illegal job state transition");
            return false;
        }
        inner.states[id.0] = to;
        if from == JobState::Running {
            inner.running -= 1;
        }
        if to == JobState::Running {
            inner.running += 1;
            inner.peak_running = inner.peak_running.max(inner.running);
        }
        if to.is_terminal() {
            inner.finished += 1;
        }
        true
    }

    fn snapshot(&self) -> PoolSnapshot {
        let inner = self.inner.lock();
        let pending = inner
            .states
            .iter()
            .filter(|state| **state == JobState::Pending)
            .count();
        PoolSnapshot {
            total: inner.states.len(),
            pending,
            running: inner.running,
            finished: inner.finished,
            peak_running: inner.peak_running,
        }
    }
}

/// 并行执行外部作业的有界作业池。
///
/// ## 契约 (What)
/// - `run(jobs)` 阻塞调用方直到所有作业进入终态，返回 [`JobBatchResult`]；
/// - 任意时刻处于 Running 的作业数不超过 [`PoolConfig::max_concurrent`]；
/// - 有空闲槽位时按提交顺序启动下一个作业；完成顺序不作保证；
/// - 非零退出与启动失败均记为 `Failed`，不会中止其余作业，也不会自动重试；
/// - 超时作业被强制终止并记为 `Failed(TimedOut)`；
/// - 取消信号到达后不再启动新作业，在途作业被强制终止并记为 `Cancelled`，尚未启动的作业直接记为 `Cancelled`。
///
/// ## 逻辑 (How)
/// - 协调器循环在 `tokio::select!` 中同时等待取消信号、作业完成、信号量许可与进度定时器，无忙等；
/// - 每个作业在独立任务中持有信号量许可运行子进程，先在状态表登记终态再释放许可，
///   保证状态表中 Running 计数不超过上限；
/// - 终态记录可经 [`JobPool::with_completion_sink`] 逐个推送给调用方，实现边执行边提交。
pub struct JobPool {
    config: PoolConfig,
    cancellation: Cancellation,
    completions: Option<mpsc::UnboundedSender<JobRecord>>,
    progress: Option<ProgressSink>,
    table: Mutex<Arc<JobTable>>,
}

impl JobPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            cancellation: Cancellation::new(),
            completions: None,
            progress: None,
            table: Mutex::new(Arc::new(JobTable::default())),
        }
    }

    /// 替换作业池使用的取消令牌。
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// 每个作业进入终态后，其记录被送入该通道。
    pub fn with_completion_sink(mut self, sink: mpsc::UnboundedSender<JobRecord>) -> Self {
        self.completions = Some(sink);
        self
    }

    /// 替换默认的进度输出（INFO 日志）。
    pub fn with_progress_sink(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// 当前配置。
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// 作业池的取消令牌；克隆后可在其他任务中触发取消。
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// 当前（或最近一次）运行的状态快照。
    pub fn snapshot(&self) -> PoolSnapshot {
        self.table.lock().snapshot()
    }

    pub async fn run(&self, jobs: Vec<Job>) -> JobBatchResult {
        let started = Instant::now();
        let total = jobs.len();
        let table = Arc::new(JobTable::new(total));
        *self.table.lock() = Arc::clone(&table);

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut queue: VecDeque<(JobId, Job)> = jobs
            .into_iter()
            .enumerate()
            .map(|(idx, job)| (JobId(idx), job))
            .collect();
        let mut tasks = JoinSet::new();
        let mut task_jobs: HashMap<tokio::task::Id, (JobId, String)> = HashMap::new();
        let mut result = JobBatchResult {
            total,
            ..JobBatchResult::default()
        };
        let mut ticker = tokio::time::interval(self.config.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            total,
            max_concurrent = self.config.max_concurrent,
            timeout_ms = self.config.job_timeout.map(|t| t.as_millis() as u64),
            "job pool started"
        );

        loop {
            if queue.is_empty() && tasks.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled(), if !result.was_cancelled => {
                    result.was_cancelled = true;
                    warn!(
                        pending = queue.len(),
                        running = tasks.len(),
                        "cancellation requested, terminating in-flight jobs"
                    );
                    for (id, job) in queue.drain(..) {
                        table.transition(id, JobState::Cancelled);
                        let record = JobRecord {
                            id,
                            label: job.label,
                            state: JobState::Cancelled,
                            exit_code: None,
                            failure: None,
                            started_at: None,
                            finished_at: None,
                            output_path: job.command.output_path,
                            stderr_tail: None,
                        };
                        self.finish(&mut result, record);
                    }
                }
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    let record = match joined {
                        Ok((task_id, record)) => {
                            task_jobs.remove(&task_id);
                            record
                        }
                        Err(join_error) => {
                            let Some(record) = aborted_record(&mut task_jobs, &join_error) else {
                                continue;
                            };
                            table.transition(record.id, JobState::Failed);
                            record
                        }
                    };
                    self.finish(&mut result, record);
                }
                permit = Arc::clone(&semaphore).acquire_owned(), if !result.was_cancelled && !queue.is_empty() => {
                    let Ok(permit) = permit else {
                        error!("job pool semaphore closed unexpectedly");
                        self.cancellation.cancel();
                        continue;
                    };
                    let Some((id, job)) = queue.pop_front() else {
                        continue;
                    };
                    table.transition(id, JobState::Running);
                    let label = job.label.clone();
                    let handle = tasks.spawn(run_job(
                        id,
                        job,
                        self.config.job_timeout,
                        self.cancellation.child(),
                        Arc::clone(&table),
                        permit,
                    ));
                    task_jobs.insert(handle.id(), (id, label));
                }
                _ = ticker.tick() => {
                    self.emit_progress(table.snapshot().finished, total, started);
                }
            }
        }

        result.peak_running = table.snapshot().peak_running;
        result.elapsed = started.elapsed();
        self.emit_progress(total, total, started);
        info!(
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            cancelled = result.cancelled,
            peak_running = result.peak_running,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "job pool finished"
        );
        result
    }

    fn finish(&self, result: &mut JobBatchResult, record: JobRecord) {
        result.fold(&record);
        if let Some(sink) = &self.completions {
            if sink.send(record).is_err() {
                debug!("completion receiver dropped, continuing without notifications");
            }
        }
    }

    fn emit_progress(&self, completed: usize, total: usize, started: Instant) {
        let report = ProgressReport::compute(completed, total, started, Instant::now());
        match &self.progress {
            Some(sink) => sink(&report),
            None => info!(
                completed = report.completed,
                total = report.total,
                percent = report.percent,
                elapsed_ms = report.elapsed.as_millis() as u64,
                eta_ms = report.eta.map(|eta| eta.as_millis() as u64),
                "progress {report}"
            ),
        }
    }
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    TimedOut(Duration),
    Cancelled,
}

/// 单个作业的完整生命周期：启动、等待（与超时/取消竞赛）、登记终态、释放许可。
async fn run_job(
    id: JobId,
    job: Job,
    timeout: Option<Duration>,
    cancellation: Cancellation,
    table: Arc<JobTable>,
    permit: OwnedSemaphorePermit,
) -> JobRecord {
    let Job { label, command } = job;
    let started_at = SystemTime::now();
    let clock = Instant::now();
    debug!(job = %id, label = %label, command = %command, "launching job");

    let mut stderr_tail = None;
    let spawned = match clear_stale_output(id, command.output_path.as_deref()).await {
        Ok(()) => command
            .to_command()
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| format!("{}: {err}", command.program.display())),
        Err(detail) => Err(detail),
    };
    let (state, exit_code, failure) = match spawned {
        Err(detail) => (
            JobState::Failed,
            None,
            Some(JobFailure::Launch { detail }),
        ),
        Ok(mut child) => {
            let stderr = child
                .stderr
                .take()
                .map(|pipe| tokio::spawn(collect_tail(pipe)));

            let exit = tokio::select! {
                biased;
                _ = cancellation.cancelled() => Exit::Cancelled,
                _ = expire(timeout) => Exit::TimedOut(timeout.unwrap_or_default()),
                status = child.wait() => Exit::Status(status),
            };
            if matches!(exit, Exit::Cancelled | Exit::TimedOut(_)) {
                if let Err(err) = child.kill().await {
                    warn!(job = %id, label = %label, error = %err, "failed to kill job process");
                }
            }
            if let Some(handle) = stderr {
                if let Ok(Ok(tail)) = tokio::time::timeout(STDERR_DRAIN_GRACE, handle).await {
                    stderr_tail = (!tail.is_empty()).then_some(tail);
                }
            }

            match exit {
                Exit::Cancelled => (JobState::Cancelled, None, None),
                Exit::TimedOut(after) => {
                    (JobState::Failed, None, Some(JobFailure::TimedOut { after }))
                }
                Exit::Status(Ok(status)) if status.success() => {
                    (JobState::Succeeded, status.code(), None)
                }
                Exit::Status(Ok(status)) => match status.code() {
                    Some(code) => (
                        JobState::Failed,
                        Some(code),
                        Some(JobFailure::ExitCode { code }),
                    ),
                    None => (JobState::Failed, None, Some(JobFailure::Signal)),
                },
                Exit::Status(Err(err)) => (
                    JobState::Failed,
                    None,
                    Some(JobFailure::Wait {
                        detail: err.to_string(),
                    }),
                ),
            }
        }
    };

    table.transition(id, state);
    drop(permit);

    let elapsed_ms = clock.elapsed().as_millis() as u64;
    match &failure {
        None if state == JobState::Succeeded => {
            info!(job = %id, label = %label, elapsed_ms, "job succeeded");
        }
        None => info!(job = %id, label = %label, elapsed_ms, "job cancelled"),
        Some(failure) => warn!(
            job = %id,
            label = %label,
            code = failure.code(),
            exit_code,
            elapsed_ms,
            stderr = stderr_tail.as_deref().unwrap_or(""),
            "job failed: {failure}"
        ),
    }

    JobRecord {
        id,
        label,
        state,
        exit_code,
        failure,
        started_at: Some(started_at),
        finished_at: Some(SystemTime::now()),
        output_path: command.output_path,
        stderr_tail,
    }
}

/// 作业任务异常结束（panic 或被中止）时构造失败记录；任务编号未登记时只记日志，不计入汇总。
fn aborted_record(
    task_jobs: &mut HashMap<tokio::task::Id, (JobId, String)>,
    join_error: &JoinError,
) -> Option<JobRecord> {
    let Some((id, label)) = task_jobs.remove(&join_error.id()) else {
        error!(task = %join_error.id(), error = %join_error, "unknown job task aborted");
        return None;
    };
    error!(job = %id, label = %label, error = %join_error, "job task aborted");
    Some(JobRecord {
        id,
        label,
        state: JobState::Failed,
        exit_code: None,
        failure: Some(JobFailure::Wait {
            detail: join_error.to_string(),
        }),
        started_at: None,
        finished_at: Some(SystemTime::now()),
        output_path: None,
        stderr_tail: None,
    })
}

/// 启动前删除上一次运行遗留的输出文件，成功退出但未写文件的作业不会被误读为新数据。
async fn clear_stale_output(id: JobId, output: Option<&Path>) -> Result<(), String> {
    let Some(output) = output else {
        return Ok(());
    };
    match tokio::fs::remove_file(output).await {
        Ok(()) => {
            debug!(job = %id, path = %output.display(), "removed stale engine output");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(format!(
            "cannot remove stale output {}: {err}",
            output.display()
        )),
    }
}

async fn expire(timeout: Option<Duration>) {
    match timeout {
        Some(after) => tokio::time::sleep(after).await,
        None => std::future::pending().await,
    }
}

async fn collect_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut tail = Vec::with_capacity(STDERR_TAIL_BYTES);
    let mut chunk = [0u8; 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_enforces_state_machine_and_tracks_peak() {
        let table = JobTable::new(3);
        assert!(table.transition(JobId(0), JobState::Running));
        assert!(table.transition(JobId(1), JobState::Running));
        assert!(!table.transition(JobId(1), JobState::Pending));
        assert!(table.transition(JobId(0), JobState::Succeeded));
        assert!(!table.transition(JobId(0), JobState::Failed));
        assert!(table.transition(JobId(2), JobState::Cancelled));
        assert!(!table.transition(JobId(2), JobState::Running));
        assert!(!table.transition(JobId(9), JobState::Running));

        let snapshot = table.snapshot();
        assert_eq!(snapshot.running, 1);
        assert_eq!(snapshot.peak_running, 2);
        assert_eq!(snapshot.finished, 2);
        assert_eq!(snapshot.pending, 0);
    }

    #[test]
    fn pool_config_floors_concurrency_at_one() {
        assert_eq!(PoolConfig::new(0).max_concurrent, 1);
    }

    #[tokio::test]
    async fn empty_job_list_completes_immediately() {
        let pool = JobPool::new(PoolConfig::new(2));
        let result = pool.run(Vec::new()).await;
        assert_eq!(result.total, 0);
        assert!(result.is_success());
    }

    async fn crash() -> JobRecord {
        panic!("engine task crashed")
    }

    #[tokio::test]
    async fn aborted_task_without_registered_job_is_not_folded() {
        let mut tasks = JoinSet::new();
        tasks.spawn(crash());
        let Some(Err(join_error)) = tasks.join_next_with_id().await else {
            panic!("task must fail");
        };

        let mut task_jobs = HashMap::new();
        assert!(aborted_record(&mut task_jobs, &join_error).is_none());

        task_jobs.insert(join_error.id(), (JobId(4), "shop/web1/2024-05".to_owned()));
        let record = aborted_record(&mut task_jobs, &join_error).expect("registered task");
        assert_eq!(record.id, JobId(4));
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.failure.map(|f| f.code()), Some("logbatch.job.wait_failed"));
        assert!(task_jobs.is_empty());
    }

    #[tokio::test]
    async fn stale_output_is_removed_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("2024-05.txt");
        std::fs::write(&output, "hits 999999\n").unwrap();

        clear_stale_output(JobId(0), Some(output.as_path())).await.unwrap();
        assert!(!output.exists());
        clear_stale_output(JobId(0), Some(output.as_path())).await.unwrap();
        clear_stale_output(JobId(0), None).await.unwrap();
    }
}
