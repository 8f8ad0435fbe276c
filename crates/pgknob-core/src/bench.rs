//! `pgbench` orchestration.
//!
//! A probe (`pgbench -i` to initialize, plain `pgbench` to load) runs as a
//! child process inside a worker task. Each invocation resolves exactly one
//! outcome through a oneshot channel, and only one probe may run against the
//! target at a time.
//!
//! ```text
//!   caller ──start_run──▶ BenchOrchestrator ──try_lock──▶ busy guard
//!      │                         │
//!      │                    tokio::spawn
//!      │                         ▼
//!      │                  worker (owns guard)
//!      │                    select! {
//!      │                      cancel  ─▶ kill + reap ─▶ Cancelled
//!      │                      pgbench ─▶ exit status + report parse
//!      │                    }
//!      │                         │ oneshot (exactly once)
//!      ◀──── RunHandle::outcome ─┘
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OwnedMutexGuard, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::ConnectionParams;

static NUMBER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid regex"));

const THROUGHPUT_MARKER: &str = "tps";
const LATENCY_MARKER: &str = "latency";

/// Bytes of stderr kept in [`BenchError::Failed`].
const STDERR_TAIL: usize = 2048;

/// Error type for probe runs.
#[derive(Debug, Clone, PartialEq)]
pub enum BenchError {
    /// Another probe is already running.
    Busy,
    /// The probe binary could not be started.
    Spawn(String),
    /// The probe exited unsuccessfully.
    Failed {
        status: Option<i32>,
        stderr: String,
    },
    /// The report lacks a throughput or latency figure.
    Parse(String),
    /// The run was cancelled before it finished.
    Cancelled,
    /// The worker ended without reporting an outcome.
    WorkerLost,
}

impl std::fmt::Display for BenchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BenchError::Busy => write!(f, "a benchmark is already running"),
            BenchError::Spawn(msg) => write!(f, "failed to start pgbench: {}", msg),
            BenchError::Failed { status, stderr } => {
                match status {
                    Some(code) => write!(f, "pgbench exited with status {}", code)?,
                    None => write!(f, "pgbench was terminated by a signal")?,
                }
                if !stderr.is_empty() {
                    write!(f, ": {}", stderr)?;
                }
                Ok(())
            }
            BenchError::Parse(msg) => write!(f, "unparseable pgbench report: {}", msg),
            BenchError::Cancelled => write!(f, "benchmark cancelled"),
            BenchError::WorkerLost => write!(f, "benchmark worker exited without a result"),
        }
    }
}

impl std::error::Error for BenchError {}

/// Throughput and latency of one successful load run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Transactions per second.
    pub throughput: f64,
    /// Average latency in milliseconds.
    pub latency_ms: f64,
}

/// Probe settings. Zero counts are left to pgbench defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct BenchConfig {
    pub program: PathBuf,
    pub clients: u32,
    pub threads: u32,
    pub duration_secs: u64,
    pub scale: u32,
    pub partitions: u32,
    pub foreign_keys: bool,
    pub no_vacuum: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("pgbench"),
            clients: 0,
            threads: 0,
            duration_secs: 0,
            scale: 0,
            partitions: 0,
            foreign_keys: false,
            no_vacuum: false,
        }
    }
}

fn connection_args(target: &ConnectionParams, args: &mut Vec<String>) {
    args.extend([
        "-h".to_string(),
        target.host.clone(),
        "-p".to_string(),
        target.port.to_string(),
        "-U".to_string(),
        target.user.clone(),
        target.database.clone(),
    ]);
}

/// Arguments of the initialization run (`pgbench -i`).
pub fn init_args(config: &BenchConfig, target: &ConnectionParams) -> Vec<String> {
    let mut args = vec!["-i".to_string()];
    if config.scale != 0 {
        args.push(format!("--scale={}", config.scale));
    }
    if config.foreign_keys {
        args.push("--foreign-keys".to_string());
    }
    if config.partitions != 0 {
        args.push(format!("--partitions={}", config.partitions));
    }
    if config.no_vacuum {
        args.push("--no-vacuum".to_string());
    }
    connection_args(target, &mut args);
    args
}

/// Arguments of the load run.
pub fn load_args(config: &BenchConfig, target: &ConnectionParams) -> Vec<String> {
    let mut args = Vec::new();
    if config.clients != 0 {
        args.extend(["-c".to_string(), config.clients.to_string()]);
    }
    if config.threads != 0 {
        args.extend(["-j".to_string(), config.threads.to_string()]);
    }
    if config.duration_secs != 0 {
        args.extend(["-T".to_string(), config.duration_secs.to_string()]);
    }
    connection_args(target, &mut args);
    args
}

/// First number following `marker` on the first line that has one.
fn figure_after(report: &str, marker: &str) -> Option<f64> {
    report.lines().find_map(|line| {
        let at = line.find(marker)?;
        let rest = &line[at + marker.len()..];
        NUMBER_REGEX.find(rest)?.as_str().parse().ok()
    })
}

/// Extracts throughput and latency from a pgbench report.
pub fn parse_report(report: &str) -> Result<ProbeResult, BenchError> {
    let throughput = figure_after(report, THROUGHPUT_MARKER)
        .ok_or_else(|| BenchError::Parse("no throughput (tps) figure".to_string()))?;
    let latency_ms = figure_after(report, LATENCY_MARKER)
        .ok_or_else(|| BenchError::Parse("no latency figure".to_string()))?;
    Ok(ProbeResult {
        throughput,
        latency_ms,
    })
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// One probe invocation, ready to run.
struct Probe {
    program: PathBuf,
    args: Vec<String>,
    password: Option<String>,
}

impl Probe {
    /// Starts the child with piped output.
    ///
    /// `kill_on_drop` covers a worker that is torn down with the runtime.
    fn spawn(&self) -> Result<Child, BenchError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &self.password {
            cmd.env("PGPASSWORD", password);
        }
        cmd.spawn()
            .map_err(|e| BenchError::Spawn(format!("{}: {}", self.program.display(), e)))
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Waits for `child` to exit and returns its stdout.
async fn finish(child: &mut Child) -> Result<String, BenchError> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (status, stdout, stderr) =
        tokio::try_join!(child.wait(), read_pipe(stdout), read_pipe(stderr)).map_err(|e| {
            BenchError::Failed {
                status: None,
                stderr: format!("waiting for pgbench: {}", e),
            }
        })?;

    if !status.success() {
        return Err(BenchError::Failed {
            status: status.code(),
            stderr: stderr_tail(&stderr),
        });
    }
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

/// Pending probe invocation.
///
/// Dropping the handle cancels the probe.
pub struct RunHandle<T> {
    rx: oneshot::Receiver<Result<T, BenchError>>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl<T> RunHandle<T> {
    /// Waits for the single outcome of the invocation.
    pub async fn outcome(mut self) -> Result<T, BenchError> {
        (&mut self.rx).await.unwrap_or(Err(BenchError::WorkerLost))
    }

    /// Cancels the probe and waits for the worker to exit.
    pub async fn abort(mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "benchmark worker failed");
            }
        }
    }
}

impl<T> Drop for RunHandle<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs `pgbench` against one target, one invocation at a time.
pub struct BenchOrchestrator {
    config: BenchConfig,
    target: ConnectionParams,
    busy: Arc<Mutex<()>>,
}

impl BenchOrchestrator {
    pub fn new(config: BenchConfig, target: ConnectionParams) -> Self {
        Self {
            config,
            target,
            busy: Arc::new(Mutex::new(())),
        }
    }

    /// Whether a probe is currently running.
    pub fn is_busy(&self) -> bool {
        self.busy.try_lock().is_err()
    }

    fn probe(&self, args: Vec<String>) -> Probe {
        Probe {
            program: self.config.program.clone(),
            args,
            password: self.target.password.clone(),
        }
    }

    /// Starts schema and data initialization (`pgbench -i`).
    pub fn start_prepare(&self, cancel: CancellationToken) -> Result<RunHandle<()>, BenchError> {
        let probe = self.probe(init_args(&self.config, &self.target));
        self.spawn("prepare", probe, cancel, |_| Ok(()))
    }

    /// Starts a load run.
    pub fn start_run(&self, cancel: CancellationToken) -> Result<RunHandle<ProbeResult>, BenchError> {
        let probe = self.probe(load_args(&self.config, &self.target));
        self.spawn("run", probe, cancel, parse_report)
    }

    /// Initializes the benchmark schema and waits for completion.
    pub async fn prepare(&self, cancel: CancellationToken) -> Result<(), BenchError> {
        self.start_prepare(cancel)?.outcome().await
    }

    /// Runs the load and waits for its throughput and latency.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ProbeResult, BenchError> {
        self.start_run(cancel)?.outcome().await
    }

    fn spawn<T: Send + 'static>(
        &self,
        mode: &'static str,
        probe: Probe,
        cancel: CancellationToken,
        parse: fn(&str) -> Result<T, BenchError>,
    ) -> Result<RunHandle<T>, BenchError> {
        let guard = Arc::clone(&self.busy)
            .try_lock_owned()
            .map_err(|_| BenchError::Busy)?;

        let cancel = cancel.child_token();
        let (tx, rx) = oneshot::channel();
        info!(mode, program = %probe.program.display(), args = ?probe.args, "starting pgbench");
        let worker = tokio::spawn(probe_worker(mode, probe, cancel.clone(), tx, guard, parse));

        Ok(RunHandle {
            rx,
            cancel,
            worker: Some(worker),
        })
    }
}

async fn probe_worker<T>(
    mode: &'static str,
    probe: Probe,
    cancel: CancellationToken,
    tx: oneshot::Sender<Result<T, BenchError>>,
    guard: OwnedMutexGuard<()>,
    parse: fn(&str) -> Result<T, BenchError>,
) {
    let started = std::time::Instant::now();
    let outcome = if cancel.is_cancelled() {
        Err(BenchError::Cancelled)
    } else {
        match probe.spawn() {
            Ok(mut child) => {
                let finished = tokio::select! {
                    _ = cancel.cancelled() => None,
                    out = finish(&mut child) => Some(out),
                };
                match finished {
                    Some(out) => out.and_then(|stdout| parse(&stdout)),
                    None => {
                        // Reaped before the guard goes, so no two probes overlap.
                        if let Err(e) = child.kill().await {
                            warn!(mode, error = %e, "failed to kill pgbench");
                        }
                        Err(BenchError::Cancelled)
                    }
                }
            }
            Err(e) => Err(e),
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    match &outcome {
        Ok(_) => info!(mode, duration_ms, "pgbench finished"),
        Err(BenchError::Cancelled) => info!(mode, duration_ms, "pgbench cancelled"),
        Err(e) => warn!(mode, duration_ms, error = %e, "pgbench failed"),
    }

    // The child has exited by now. Released before reporting, so the caller
    // can start the next probe at once.
    drop(guard);
    if tx.send(outcome).is_err() {
        debug!(mode, "benchmark outcome dropped, caller went away");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ConnectionParams {
        ConnectionParams {
            host: "db.internal".into(),
            port: 6432,
            user: "bench".into(),
            password: Some("s3cret".into()),
            database: "tpcb".into(),
        }
    }

    const REPORT: &str = "\
pgbench (16.2)
transaction type: <builtin: TPC-B (sort of)>
scaling factor: 10
number of clients: 8
number of threads: 2
duration: 60 s
number of transactions actually processed: 7407
latency average = 6.78 ms
initial connection time = 12.501 ms
tps = 123.45 (without initial connection time)
";

    #[test]
    fn load_args_skip_zero_counts() {
        let config = BenchConfig {
            clients: 8,
            duration_secs: 60,
            ..Default::default()
        };
        assert_eq!(
            load_args(&config, &target()),
            ["-c", "8", "-T", "60", "-h", "db.internal", "-p", "6432", "-U", "bench", "tpcb"]
        );
    }

    #[test]
    fn init_args_carry_schema_options() {
        let config = BenchConfig {
            scale: 10,
            partitions: 4,
            foreign_keys: true,
            no_vacuum: true,
            ..Default::default()
        };
        assert_eq!(
            init_args(&config, &target()),
            [
                "-i",
                "--scale=10",
                "--foreign-keys",
                "--partitions=4",
                "--no-vacuum",
                "-h",
                "db.internal",
                "-p",
                "6432",
                "-U",
                "bench",
                "tpcb"
            ]
        );
    }

    #[test]
    fn password_never_in_args() {
        let config = BenchConfig::default();
        assert!(!load_args(&config, &target()).iter().any(|a| a.contains("s3cret")));
        assert!(!format!("{:?}", target()).contains("s3cret"));
    }

    #[test]
    fn parse_report_takes_figures_after_markers() {
        assert_eq!(
            parse_report(REPORT).unwrap(),
            ProbeResult {
                throughput: 123.45,
                latency_ms: 6.78,
            }
        );
    }

    #[test]
    fn parse_report_first_line_wins() {
        let report = "tps = 10.5 (including connections establishing)\n\
                      tps = 11.5 (excluding connections establishing)\n\
                      latency average = 2 ms\n";
        let result = parse_report(report).unwrap();
        assert_eq!(result.throughput, 10.5);
        assert_eq!(result.latency_ms, 2.0);
    }

    #[test]
    fn parse_report_requires_both_figures() {
        assert!(matches!(
            parse_report("latency average = 6.78 ms\n"),
            Err(BenchError::Parse(_))
        ));
        assert!(matches!(
            parse_report("tps = 123.45\nlatency average = n/a\n"),
            Err(BenchError::Parse(_))
        ));
        assert!(matches!(parse_report(""), Err(BenchError::Parse(_))));
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = "x".repeat(STDERR_TAIL) + "FATAL: role does not exist";
        let tail = stderr_tail(long.as_bytes());
        assert_eq!(tail.len(), STDERR_TAIL);
        assert!(tail.ends_with("FATAL: role does not exist"));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;
        use std::time::Duration;

        /// Writes an executable fake `pgbench`.
        fn fake_pgbench(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("pgbench");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn orchestrator(program: PathBuf) -> BenchOrchestrator {
            let config = BenchConfig {
                program,
                clients: 4,
                threads: 2,
                duration_secs: 5,
                ..Default::default()
            };
            BenchOrchestrator::new(config, target())
        }

        #[tokio::test]
        async fn run_reports_parsed_result() {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("invocation");
            let body = format!(
                "echo \"$@\" > '{}'\necho \"$PGPASSWORD\" >> '{}'\ncat <<'EOF'\n{}EOF",
                log.display(),
                log.display(),
                REPORT
            );
            let bench = orchestrator(fake_pgbench(dir.path(), &body));

            let result = bench.run(CancellationToken::new()).await.unwrap();
            assert_eq!(result.throughput, 123.45);
            assert_eq!(result.latency_ms, 6.78);

            let invocation = std::fs::read_to_string(&log).unwrap();
            assert_eq!(
                invocation,
                "-c 4 -j 2 -T 5 -h db.internal -p 6432 -U bench tpcb\ns3cret\n"
            );
            assert!(!bench.is_busy());
        }

        #[tokio::test]
        async fn non_zero_exit_is_a_failure() {
            let dir = tempfile::tempdir().unwrap();
            let body = "echo 'tps = 1.0'\necho 'connection refused' >&2\nexit 2";
            let bench = orchestrator(fake_pgbench(dir.path(), body));

            let err = bench.run(CancellationToken::new()).await.unwrap_err();
            assert_eq!(
                err,
                BenchError::Failed {
                    status: Some(2),
                    stderr: "connection refused".into(),
                }
            );
        }

        #[tokio::test]
        async fn missing_marker_is_a_parse_error() {
            let dir = tempfile::tempdir().unwrap();
            let bench = orchestrator(fake_pgbench(dir.path(), "echo 'tps = 99.5'"));

            let err = bench.run(CancellationToken::new()).await.unwrap_err();
            assert!(matches!(err, BenchError::Parse(_)));
        }

        #[tokio::test]
        async fn prepare_passes_init_flag() {
            let dir = tempfile::tempdir().unwrap();
            let body = "[ \"$1\" = \"-i\" ] || exit 3";
            let bench = orchestrator(fake_pgbench(dir.path(), body));

            bench.prepare(CancellationToken::new()).await.unwrap();
        }

        #[tokio::test]
        async fn missing_binary_is_a_spawn_error() {
            let dir = tempfile::tempdir().unwrap();
            let bench = orchestrator(dir.path().join("no-such-pgbench"));

            let err = bench.run(CancellationToken::new()).await.unwrap_err();
            assert!(matches!(err, BenchError::Spawn(_)));
            assert!(!bench.is_busy());
        }

        #[tokio::test]
        async fn second_run_is_rejected_while_busy() {
            let dir = tempfile::tempdir().unwrap();
            let bench = orchestrator(fake_pgbench(dir.path(), "sleep 30"));

            let first = bench.start_run(CancellationToken::new()).unwrap();
            assert!(bench.is_busy());
            assert!(matches!(
                bench.start_run(CancellationToken::new()),
                Err(BenchError::Busy)
            ));
            assert!(matches!(
                bench.prepare(CancellationToken::new()).await,
                Err(BenchError::Busy)
            ));

            first.abort().await;
            assert!(!bench.is_busy());
        }

        #[tokio::test]
        async fn cancellation_ends_the_run() {
            let dir = tempfile::tempdir().unwrap();
            let slow = dir.path().join("slow");
            std::fs::write(&slow, "").unwrap();
            let body = format!(
                "[ -f '{}' ] && sleep 30\ncat <<'EOF'\n{}EOF",
                slow.display(),
                REPORT
            );
            let bench = orchestrator(fake_pgbench(dir.path(), &body));
            let cancel = CancellationToken::new();

            let handle = bench.start_run(cancel.clone()).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();

            let outcome = tokio::time::timeout(Duration::from_secs(5), handle.outcome())
                .await
                .expect("worker did not exit");
            assert_eq!(outcome, Err(BenchError::Cancelled));

            std::fs::remove_file(&slow).unwrap();
            let result = bench.run(CancellationToken::new()).await.unwrap();
            assert_eq!(result.throughput, 123.45);
        }

        /// Whether `pid` is a live process. Zombies count as gone.
        #[cfg(target_os = "linux")]
        fn process_alive(pid: u32) -> bool {
            match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
                Ok(stat) => stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.trim_start().chars().next())
                    .is_some_and(|state| state != 'Z'),
                Err(_) => false,
            }
        }

        #[cfg(target_os = "linux")]
        #[tokio::test]
        async fn cancelled_child_exits_before_guard_is_released() {
            let dir = tempfile::tempdir().unwrap();
            let pid_file = dir.path().join("pid");
            let body = format!("echo $$ > '{}'\nexec sleep 30", pid_file.display());
            let bench = orchestrator(fake_pgbench(dir.path(), &body));
            let cancel = CancellationToken::new();

            let handle = bench.start_run(cancel.clone()).unwrap();
            let pid: u32 = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if let Some(pid) = std::fs::read_to_string(&pid_file)
                        .ok()
                        .and_then(|s| s.trim().parse().ok())
                    {
                        break pid;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("fake pgbench did not start");
            assert!(process_alive(pid));

            cancel.cancel();
            assert_eq!(handle.outcome().await, Err(BenchError::Cancelled));

            assert!(!process_alive(pid), "pgbench {} still running", pid);
            assert!(!bench.is_busy());
        }

        #[tokio::test]
        async fn dropped_handle_frees_the_orchestrator() {
            let dir = tempfile::tempdir().unwrap();
            let bench = orchestrator(fake_pgbench(dir.path(), "sleep 30"));

            drop(bench.start_run(CancellationToken::new()).unwrap());

            tokio::time::timeout(Duration::from_secs(5), async {
                while bench.is_busy() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("busy guard was not released");
        }
    }
}
