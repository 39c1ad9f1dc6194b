//! `worker` binary: dials the coordinator, registers its host resources,
//! and executes whatever Commands it receives by shelling out to the
//! task's argv (SPEC §1 "out of scope": no kickstart-style wrapping, just
//! enough to drive the coordinator end to end).

use std::time::Instant;

use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wrangler_core::protocol::{self, IoData, Message, Registration, TaskResult};
use wrangler_core::transport::tcp::connect;

#[derive(Parser)]
#[command(name = "worker")]
struct Args {
    #[arg(long)]
    connect: String,

    #[arg(long)]
    hostname: String,

    #[arg(long)]
    memory: u32,

    #[arg(long)]
    threads: u16,

    #[arg(long, default_value_t = 1)]
    cores: u16,

    #[arg(long, default_value_t = 1)]
    sockets: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %e, "worker exited with error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let stream = connect(&args.connect).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    protocol::write_frame(
        &mut write_half,
        0,
        &Message::Registration(Registration {
            hostname: args.hostname.clone(),
            memory: args.memory,
            threads: args.threads,
            cores: args.cores,
            sockets: args.sockets,
        }),
    )
    .await?;

    let (_, hostrank_msg) = protocol::read_frame(&mut reader).await?;
    let rank = match hostrank_msg {
        Message::HostRank(h) => h.rank,
        other => anyhow::bail!("expected HostRank during registration, got {other:?}"),
    };
    info!(hostname = %args.hostname, rank, "registered with coordinator");

    loop {
        let (_, msg) = protocol::read_frame(&mut reader).await?;
        match msg {
            Message::Shutdown => {
                info!("received shutdown, exiting");
                break;
            }
            Message::Command(cmd) => {
                let start = Instant::now();
                let output = tokio::process::Command::new(&cmd.argv[0])
                    .args(&cmd.argv[1..])
                    .output()
                    .await;

                let (exit_code, stdout, stderr) = match output {
                    Ok(o) => (o.status.code().unwrap_or(-1), o.stdout, o.stderr),
                    Err(e) => {
                        warn!(task = %cmd.name, error = %e, "failed to spawn task");
                        (-1, Vec::new(), Vec::new())
                    }
                };
                let runtime = start.elapsed().as_secs_f64();

                if !stdout.is_empty() {
                    protocol::write_frame(
                        &mut write_half,
                        0,
                        &Message::IoData(IoData {
                            task_name: cmd.name.clone(),
                            filename: "stdout".to_string(),
                            bytes: stdout,
                        }),
                    )
                    .await?;
                }
                if !stderr.is_empty() {
                    protocol::write_frame(
                        &mut write_half,
                        0,
                        &Message::IoData(IoData {
                            task_name: cmd.name.clone(),
                            filename: "stderr".to_string(),
                            bytes: stderr,
                        }),
                    )
                    .await?;
                }

                protocol::write_frame(
                    &mut write_half,
                    0,
                    &Message::Result(TaskResult {
                        name: cmd.name,
                        exit_code,
                        runtime,
                    }),
                )
                .await?;
            }
            other => {
                warn!(?other, "unexpected message, ignoring");
            }
        }
    }
    Ok(())
}
