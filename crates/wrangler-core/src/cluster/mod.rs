//! The independent shared-memory task cluster (§4.7): an N-way parallel
//! executor of a line-delimited command list, unrelated to the DAG
//! coordinator — it has no DAG, only an input stream and a pool of child
//! processes sized to the configured parallelism.

mod lexer;
mod signal_guard;

pub use lexer::{split_words, LexError};
pub use signal_guard::SigintGuard;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use chrono::Local;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Collect,
    Old,
    FailHard,
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cannot open input: {0}")]
    OpenInput(#[source] std::io::Error),
    #[error("cannot open progress file: {0}")]
    OpenProgress(#[source] std::io::Error),
    #[error("line {0}: {1}")]
    Lex(usize, LexError),
}

/// Whether an exit code belongs to the configured success-code set.
/// `success_codes` is bounded to `0..=255`; an out-of-range `-S` value is
/// rejected by the CLI layer rather than indexed here (see DESIGN.md for the
/// open question this resolves).
pub fn is_success_exit(exit_code: i32, success_codes: &[u8]) -> bool {
    if !(0..=255).contains(&exit_code) {
        return false;
    }
    let code = exit_code as u8;
    code == 0 || success_codes.contains(&code)
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub seq: usize,
    pub line_no: usize,
    pub argv: Vec<String>,
    pub start: Instant,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub signaled: bool,
    pub pid: u32,
}

pub struct ClusterConfig {
    pub cpus: usize,
    pub mode: Mode,
    pub success_codes: Vec<u8>,
    pub progress_path: Option<PathBuf>,
    pub setup: Option<String>,
    pub cleanup: Option<String>,
    pub app_name: String,
}

pub struct ClusterSummary {
    pub stat_ok: bool,
    pub lines: usize,
    pub tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub extra: usize,
    pub duration: Duration,
    pub start: chrono::DateTime<Local>,
    pub pid: u32,
    pub app: String,
}

struct RunningChild {
    child: Child,
    record: TaskRecord,
}

/// Read `input`, skipping blank/comment lines, and parse each surviving line
/// into an argument vector using shell-style quoting (§6). A line longer
/// than the reader's internal buffer is transparently continued by
/// `BufRead::read_line`, which keeps reading until it sees a newline.
fn read_task_lines<R: BufRead>(input: R) -> Result<Vec<(usize, Vec<String>)>, ClusterError> {
    let mut tasks = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(ClusterError::OpenInput)?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let stripped = trimmed.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        let argv = split_words(trimmed).map_err(|e| ClusterError::Lex(line_no, e))?;
        if argv.is_empty() {
            continue;
        }
        tasks.push((line_no, argv));
    }
    Ok(tasks)
}

fn run_hook(label: &str, command: &str) -> Option<i32> {
    info!(hook = label, command, "running hook");
    match Command::new("/bin/sh").arg("-c").arg(command).status() {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(hook = label, error = %e, "failed to spawn hook");
            None
        }
    }
}

/// Drive the whole cluster run: setup hook, task pool, cleanup hook,
/// progress reporting. Returns the summary the caller maps to an exit code.
pub fn run<R: BufRead>(input: R, config: &ClusterConfig) -> Result<ClusterSummary, ClusterError> {
    let start_instant = Instant::now();
    let start_wall = Local::now();

    if let Some(setup) = &config.setup {
        run_hook("setup", setup);
    }

    let tasks = read_task_lines(input)?;
    let total_lines = tasks.len();

    let mut progress_file = match &config.progress_path {
        Some(path) => Some(open_progress(path)?),
        None => None,
    };

    let mut pending = tasks.into_iter().enumerate();
    let mut running: Vec<RunningChild> = Vec::new();
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut executed = 0usize;
    let mut fail_hard_stop = false;

    // Deferred for the whole reap loop: SIGINT during a wait-any call must
    // not re-enter the scheduler, only flag that we should stop early.
    let sigint_guard = SigintGuard::new();

    loop {
        if sigint_guard.interrupted() {
            fail_hard_stop = true;
        }
        while !fail_hard_stop && running.len() < config.cpus {
            let Some((seq, (line_no, argv))) = pending.next() else {
                break;
            };
            match spawn_task(seq, line_no, &argv) {
                Ok(rc) => running.push(rc),
                Err(e) => {
                    warn!(line = line_no, error = %e, "failed to spawn task");
                    failed += 1;
                    executed += 1;
                }
            }
        }

        if running.is_empty() {
            if fail_hard_stop || pending_is_empty(&mut pending) {
                break;
            }
            continue;
        }

        let (finished_idx, status) = wait_any(&mut running);
        let mut rc = running.remove(finished_idx);
        rc.record.duration = rc.record.start.elapsed();
        let (exit_code, signaled) = status;
        rc.record.exit_code = exit_code;
        rc.record.signaled = signaled;
        executed += 1;

        let ok = !signaled && exit_code.is_some_and(|c| is_success_exit(c, &config.success_codes));
        if ok {
            succeeded += 1;
        } else {
            failed += 1;
            if config.mode == Mode::FailHard {
                fail_hard_stop = true;
            }
        }

        if let Some(f) = progress_file.as_mut() {
            write_progress(f, &rc.record);
        }
        debug!(line = rc.record.line_no, ok, "task finished");
    }

    if let Some(cleanup) = &config.cleanup {
        run_hook("cleanup", cleanup);
    }

    let extra = total_lines.saturating_sub(executed);
    let stat_ok = match config.mode {
        Mode::Old => true,
        Mode::Collect | Mode::FailHard => failed == 0,
    };

    let summary = ClusterSummary {
        stat_ok,
        lines: total_lines,
        tasks: executed,
        succeeded,
        failed,
        extra,
        duration: start_instant.elapsed(),
        start: start_wall,
        pid: std::process::id(),
        app: config.app_name.clone(),
    };

    info!(
        "[cluster-summary stat=\"{}\", lines={}, tasks={}, succeeded={}, failed={}, extra={}, duration={:.3}, start={}, pid={}, app=\"{}\"]",
        if summary.stat_ok { "ok" } else { "fail" },
        summary.lines,
        summary.tasks,
        summary.succeeded,
        summary.failed,
        summary.extra,
        summary.duration.as_secs_f64(),
        summary.start.format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
        summary.pid,
        summary.app,
    );

    Ok(summary)
}

fn pending_is_empty(pending: &mut impl Iterator<Item = (usize, (usize, Vec<String>))>) -> bool {
    pending.next().is_none()
}

fn spawn_task(seq: usize, line_no: usize, argv: &[String]) -> std::io::Result<RunningChild> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.stdin(Stdio::null());
    let child = cmd.spawn()?;
    let pid = child.id();
    Ok(RunningChild {
        child,
        record: TaskRecord {
            seq,
            line_no,
            argv: argv.to_vec(),
            start: Instant::now(),
            duration: Duration::ZERO,
            exit_code: None,
            signaled: false,
            pid,
        },
    })
}

/// Block until at least one running child has exited, mirroring the
/// original's synchronous wait-any-child reap loop (§5: "the parent blocks
/// in a wait-any call to reap"). Returns the index into `running` and the
/// child's (exit_code, signaled) outcome.
#[cfg(unix)]
fn wait_any(running: &mut [RunningChild]) -> (usize, (Option<i32>, bool)) {
    loop {
        let mut status: i32 = 0;
        // SAFETY: pid -1 blocks for any child of this process; `status` is
        // a valid out-parameter. A `SigintGuard` is held for the whole
        // reap loop so `SIGINT` cannot re-enter the scheduler here; EINTR
        // from other signals is retried.
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            // No children left to reap (ECHILD): shouldn't happen since the
            // caller only calls this while `running` is non-empty, but
            // avoid spinning forever if it does.
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }
        if let Some(idx) = running.iter().position(|rc| rc.record.pid == pid as u32) {
            let exited = libc::WIFEXITED(status);
            let signaled = libc::WIFSIGNALED(status);
            let code = if exited { Some(libc::WEXITSTATUS(status)) } else { None };
            return (idx, (code, signaled));
        }
    }
}

#[cfg(not(unix))]
fn wait_any(running: &mut [RunningChild]) -> (usize, (Option<i32>, bool)) {
    loop {
        for (idx, rc) in running.iter_mut().enumerate() {
            if let Ok(Some(status)) = rc.child.try_wait() {
                return (idx, (status.code(), false));
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn open_progress(path: &Path) -> Result<std::fs::File, ClusterError> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(ClusterError::OpenProgress)
}

fn write_progress(f: &mut std::fs::File, record: &TaskRecord) {
    use std::io::Write as _;
    let start_iso = chrono::DateTime::<Local>::from(
        std::time::SystemTime::now() - record.duration,
    )
    .format("%Y-%m-%dT%H:%M:%S%.3f%:z");
    let status = record.exit_code.unwrap_or(-1);
    let argv0 = record.argv.first().map(String::as_str).unwrap_or("");

    let rusage = read_rusage_children();
    let _ = writeln!(
        f,
        "[cluster-task id={}, start={}, duration={:.3}, status={}, line={}, pid={}, app=\"{}\"] utime={:.3} stime={:.3} maxrss={}",
        record.seq,
        start_iso,
        record.duration.as_secs_f64(),
        status,
        record.line_no,
        record.pid,
        argv0,
        rusage.0,
        rusage.1,
        rusage.2,
    );
}

#[cfg(unix)]
fn read_rusage_children() -> (f64, f64, i64) {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: `usage` is a valid, fully-zeroed `libc::rusage`; RUSAGE_CHILDREN
    // is a well-known `who` value and the call only writes into `usage`.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) };
    if rc != 0 {
        return (0.0, 0.0, 0);
    }
    let utime = usage.ru_utime.tv_sec as f64 + usage.ru_utime.tv_usec as f64 / 1_000_000.0;
    let stime = usage.ru_stime.tv_sec as f64 + usage.ru_stime.tv_usec as f64 / 1_000_000.0;
    (utime, stime, usage.ru_maxrss)
}

#[cfg(not(unix))]
fn read_rusage_children() -> (f64, f64, i64) {
    (0.0, 0.0, 0)
}

/// `SEQEXEC_CPUS=auto` resolves to the detected online CPU count.
pub fn resolve_cpus(spec: &str) -> Option<usize> {
    if spec.eq_ignore_ascii_case("auto") {
        std::thread::available_parallelism().ok().map(|n| n.get())
    } else {
        spec.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_task_lines_skips_blank_and_comment_lines() {
        let input = "echo ok\n\n# comment\nfalse\n";
        let tasks = read_task_lines(Cursor::new(input)).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].1, vec!["echo".to_string(), "ok".to_string()]);
        assert_eq!(tasks[1].1, vec!["false".to_string()]);
    }

    #[test]
    fn success_code_set_membership() {
        assert!(is_success_exit(0, &[]));
        assert!(!is_success_exit(1, &[]));
        assert!(is_success_exit(1, &[1]));
        assert!(!is_success_exit(-1, &[]));
        assert!(!is_success_exit(256, &[]));
    }

    #[test]
    fn end_to_end_collect_mode_reports_one_failure() {
        let input = "echo ok\nfalse\necho ok\n";
        let config = ClusterConfig {
            cpus: 1,
            mode: Mode::Collect,
            success_codes: vec![],
            progress_path: None,
            setup: None,
            cleanup: None,
            app_name: "cluster".to_string(),
        };
        let summary = run(Cursor::new(input), &config).unwrap();
        assert_eq!(summary.tasks, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert!(!summary.stat_ok);
    }

    #[test]
    fn old_mode_always_reports_ok() {
        let input = "false\n";
        let config = ClusterConfig {
            cpus: 1,
            mode: Mode::Old,
            success_codes: vec![],
            progress_path: None,
            setup: None,
            cleanup: None,
            app_name: "cluster".to_string(),
        };
        let summary = run(Cursor::new(input), &config).unwrap();
        assert!(summary.stat_ok);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn fail_hard_stops_after_first_failure() {
        let input = "false\necho should-not-run\n";
        let config = ClusterConfig {
            cpus: 1,
            mode: Mode::FailHard,
            success_codes: vec![],
            progress_path: None,
            setup: None,
            cleanup: None,
            app_name: "cluster".to_string(),
        };
        let summary = run(Cursor::new(input), &config).unwrap();
        assert_eq!(summary.tasks, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.extra, 1);
        assert!(!summary.stat_ok);
    }

    #[test]
    fn resolve_cpus_parses_auto_and_integers() {
        assert_eq!(resolve_cpus("4"), Some(4));
        assert!(resolve_cpus("auto").is_some());
        assert_eq!(resolve_cpus("not-a-number"), None);
    }
}
