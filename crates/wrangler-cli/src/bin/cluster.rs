//! `cluster` binary: the independent shared-memory task cluster (SPEC §6
//! "Cluster CLI"). Reads a line-delimited command list and runs it across
//! `-n` worker processes.

use std::io::BufReader;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use wrangler_core::cluster::{resolve_cpus, run, ClusterConfig, Mode};

const EXIT_OK: i32 = 0;
const EXIT_USAGE: i32 = 1;
const EXIT_STATUS_FILE: i32 = 2;
const EXIT_INPUT_FILE: i32 = 3;
const EXIT_TASK_FAILURES: i32 = 5;

#[derive(Parser)]
#[command(name = "cluster")]
struct Args {
    input: Option<PathBuf>,

    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    #[arg(short = 's')]
    status: Option<PathBuf>,

    #[arg(short = 'R')]
    progress_report: Option<PathBuf>,

    #[arg(short = 'S')]
    success_codes: Vec<u8>,

    #[arg(short = 'n', default_value = "1", env = "SEQEXEC_CPUS")]
    cpus: String,

    #[arg(short = 'e')]
    old_mode: bool,

    #[arg(short = 'f')]
    fail_hard: bool,
}

fn main() {
    let args = Args::parse();

    let filter_level = if args.debug > 0 { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_level)))
        .init();

    std::process::exit(run_cli(args));
}

fn run_cli(args: Args) -> i32 {
    if args.old_mode && args.fail_hard {
        eprintln!("cluster: -e and -f are mutually exclusive");
        return EXIT_USAGE;
    }
    let mode = if args.old_mode {
        Mode::Old
    } else if args.fail_hard {
        Mode::FailHard
    } else {
        Mode::Collect
    };

    let Some(cpus) = resolve_cpus(&args.cpus) else {
        eprintln!("cluster: invalid -n value {:?}", args.cpus);
        return EXIT_USAGE;
    };

    for code in &args.success_codes {
        if *code == 0 {
            tracing::warn!("cluster: -S 0 is redundant, 0 is always success");
        }
    }

    let progress_path = args
        .progress_report
        .or_else(|| std::env::var("SEQEXEC_PROGRESS_REPORT").ok().map(PathBuf::from));
    let setup = std::env::var("SEQEXEC_SETUP").ok();
    let cleanup = std::env::var("SEQEXEC_CLEANUP").ok();

    let config = ClusterConfig {
        cpus,
        mode,
        success_codes: args.success_codes,
        progress_path,
        setup,
        cleanup,
        app_name: "cluster".to_string(),
    };

    let summary = match &args.input {
        Some(path) => match std::fs::File::open(path) {
            Ok(f) => run(BufReader::new(f), &config),
            Err(e) => {
                eprintln!("cluster: cannot open input {}: {e}", path.display());
                return EXIT_INPUT_FILE;
            }
        },
        None => run(BufReader::new(std::io::stdin()), &config),
    };

    let summary = match summary {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cluster: {e}");
            return EXIT_INPUT_FILE;
        }
    };

    if let Some(status_path) = &args.status {
        if let Err(e) = write_status_file(status_path, &summary) {
            eprintln!("cluster: cannot open status file {}: {e}", status_path.display());
            return EXIT_STATUS_FILE;
        }
    }

    match mode {
        Mode::Old => EXIT_OK,
        Mode::Collect | Mode::FailHard => {
            if summary.failed > 0 {
                EXIT_TASK_FAILURES
            } else {
                EXIT_OK
            }
        }
    }
}

fn write_status_file(
    path: &std::path::Path,
    summary: &wrangler_core::cluster::ClusterSummary,
) -> std::io::Result<()> {
    use std::io::Write as _;
    let mut f = std::fs::File::create(path)?;
    writeln!(
        f,
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
    )
}
