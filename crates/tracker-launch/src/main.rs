use std::process;

use anyhow::Context;
use tracker::{LocalSpawner, MpiSpawner, WorkerSpawner};
use tracker_launch::{Backend, LaunchArgs, USAGE, init_tracing};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let launch = match LaunchArgs::parse(&args) {
        Ok(Some(launch)) => launch,
        Ok(None) => {
            println!("{USAGE}");
            return;
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(launch).await {
        tracing::error!(error = %format!("{e:#}"), "Launch failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(launch: LaunchArgs) -> anyhow::Result<()> {
    let spawner: Box<dyn WorkerSpawner> = match launch.backend {
        Backend::Mpi { program } => Box::new(MpiSpawner::new().with_program(program)),
        Backend::Local => Box::new(LocalSpawner),
    };

    let envs = tracker::submit(launch.nslave, &launch.command, spawner.as_ref())
        .await
        .with_context(|| format!("bootstrap of {} workers failed", launch.nslave))?;

    tracing::info!(workers = envs.len(), "All workers finished");
    Ok(())
}
