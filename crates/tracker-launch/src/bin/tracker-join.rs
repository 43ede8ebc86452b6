//! Join a tracker from a shell-script worker.
//!
//! Reads `tracker_uri=`/`tracker_port=`/`tracker_session=` arguments, or the
//! `TRACKER_*` environment when they are absent, joins, and prints the
//! resulting `WorkerEnv` as JSON on stdout.
//!
//! Usage: tracker-join <addr> [rank=<n>] [tracker_uri=.. tracker_port=..]

use std::process;

use anyhow::Context;
use tracker::{Rank, TrackerAddr, WorkerJoin};
use tracker_launch::init_tracing;

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&args).await {
        tracing::error!(error = %format!("{e:#}"), "Join failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: &[String]) -> anyhow::Result<()> {
    let addr = args
        .iter()
        .find(|a| !a.contains('='))
        .context("missing <addr>: host:port peers use to reach this worker")?;

    let tracker = if args.iter().any(|a| a.starts_with("tracker_uri=")) {
        TrackerAddr::from_args(args)?
    } else {
        TrackerAddr::from_env()?
    };

    let mut join = WorkerJoin::new(tracker, addr.clone());
    if let Some(rank) = args.iter().find_map(|a| a.strip_prefix("rank=")) {
        let rank: u32 = rank.parse().with_context(|| format!("invalid rank '{rank}'"))?;
        join = join.with_rank(Rank::new(rank));
    }

    let env = join.join().await?;
    println!("{}", serde_json::to_string(&env)?);
    Ok(())
}
