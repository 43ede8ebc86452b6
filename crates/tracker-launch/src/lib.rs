//! Shared pieces of the `tracker-launch` and `tracker-join` binaries.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const USAGE: &str = "Usage: tracker-launch [--local | --mpirun <program>] <nslave> <cmd...>";

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins; otherwise `TRACKER_LOG` picks the level for the tracker
/// crates. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("TRACKER_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "tracker={level},tracker_launch={level},tracker::bridge::codec=off"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Mpi { program: String },
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    pub nslave: usize,
    pub command: Vec<String>,
    pub backend: Backend,
}

impl LaunchArgs {
    /// Parse `argv` (including the program name).
    ///
    /// `Ok(None)` means too few arguments: print usage and exit cleanly.
    pub fn parse(args: &[String]) -> Result<Option<Self>, String> {
        let mut backend = Backend::Mpi {
            program: "mpirun".to_string(),
        };

        let mut i = 1; // skip argv[0]
        while let Some(arg) = args.get(i) {
            match arg.as_str() {
                "--local" => backend = Backend::Local,
                "--mpirun" => {
                    i += 1;
                    let program = args.get(i).ok_or("--mpirun requires a value")?;
                    backend = Backend::Mpi {
                        program: program.clone(),
                    };
                }
                "--help" | "-h" => return Ok(None),
                _ => break,
            }
            i += 1;
        }

        let rest = &args[i.min(args.len())..];
        if rest.len() < 2 {
            return Ok(None);
        }
        let nslave = rest[0]
            .parse()
            .map_err(|_| format!("<nslave> must be a number, got '{}'", rest[0]))?;

        Ok(Some(Self {
            nslave,
            command: rest[1..].to_vec(),
            backend,
        }))
    }
}
