use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clusteval_plugin_sdk::CapabilityKind;
use clusteval_server::{RemoteClient, DEFAULT_BIND};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Command-line client for the clustering evaluation server")]
struct Cli {
    /// Server address.
    #[arg(long, default_value = DEFAULT_BIND)]
    server: String,
    /// Act as this client id instead of requesting a new one.
    #[arg(long)]
    client_id: Option<String>,
    /// Print results as JSON.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the run definitions the server knows.
    Runs,
    /// List persisted results that can be resumed.
    Resumes,
    /// List runs with unfinished work.
    Queue,
    /// List runnables currently executing.
    Active,
    /// Submit a run.
    Perform { run: String },
    /// Resume a persisted result.
    Resume { result: String },
    /// Terminate a run submitted with the same client id.
    Terminate { run: String },
    /// Show the status of the runs submitted with this client id.
    Status,
    /// Show progress and best parameters of this client id's optimization
    /// runs.
    Optimization,
    /// List registered capabilities, optionally of one kind.
    Capabilities { kind: Option<CapabilityKind> },
    /// Resize the server's worker pool.
    Threads { count: usize },
    /// Change the server's log level.
    LogLevel { level: String },
    /// Shut the server down.
    Shutdown {
        /// How long running runnables get to stop before being terminated.
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let cli = Cli::parse();
    let mut client = RemoteClient::connect(cli.server.as_str())
        .with_context(|| format!("failed to connect to {}", cli.server))?;
    let fresh_id = cli.client_id.is_none();
    if let Some(id) = &cli.client_id {
        client = client.with_client_id(id.clone());
    }

    let json = cli.json;
    match cli.command {
        Commands::Runs => print_list(json, client.get_runs()?)?,
        Commands::Resumes => print_list(json, client.get_run_resumes()?)?,
        Commands::Queue => print_list(json, client.get_queue()?)?,
        Commands::Active => {
            let active = client.get_active_runnables()?;
            if json {
                print_json(&active)?;
            } else {
                for entry in active {
                    let worker = entry.runnable.worker.unwrap_or_default();
                    println!("{worker}\t{}\t{}", entry.run, entry.runnable.identity);
                }
            }
        }
        Commands::Perform { run } => {
            let accepted = client.perform_run(&run)?;
            announce_client_id(&mut client, fresh_id)?;
            report(
                accepted,
                &format!("run `{run}` submitted"),
                &format!("run `{run}` was not accepted"),
            )?;
        }
        Commands::Resume { result } => {
            let accepted = client.resume_run(&result)?;
            announce_client_id(&mut client, fresh_id)?;
            report(
                accepted,
                &format!("result `{result}` resumed"),
                &format!("result `{result}` was not resumed"),
            )?;
        }
        Commands::Terminate { run } => {
            let terminated = client.terminate_run(&run)?;
            report(
                terminated,
                &format!("run `{run}` terminated"),
                &format!("run `{run}` has nothing left to terminate"),
            )?;
        }
        Commands::Status => {
            let statuses = client.get_run_status()?;
            if json {
                print_json(&statuses)?;
            } else {
                for (run, progress) in statuses {
                    println!("{run}\t{}\t{:.1}%", progress.status, progress.percent_complete);
                }
            }
        }
        Commands::Optimization => {
            let statuses = client.get_optimization_run_status()?;
            if json {
                print_json(&statuses)?;
            } else {
                for (run, status) in statuses {
                    println!("{run}\t{}\t{}", status.method, status.progress.status);
                    for pair in status.pairs {
                        let best: Vec<String> = pair
                            .best
                            .iter()
                            .map(|(measure, best)| {
                                format!("{measure}={} ({})", best.quality, best.parameters)
                            })
                            .collect();
                        println!(
                            "  {}/{}\t{:.1}%\t{}",
                            pair.program,
                            pair.data,
                            pair.percent_complete,
                            best.join("; ")
                        );
                    }
                }
            }
        }
        Commands::Capabilities { kind } => {
            let bindings = client.get_capabilities(kind)?;
            if json {
                print_json(&bindings)?;
            } else {
                for binding in bindings {
                    let version = binding.version.map(|v| format!(" {v}")).unwrap_or_default();
                    println!("{}/{}{version}", binding.kind, binding.name);
                }
            }
        }
        Commands::Threads { count } => {
            let workers = client.set_thread_number(count)?;
            println!("{workers} worker(s)");
        }
        Commands::LogLevel { level } => {
            client.set_log_level(&level)?;
            println!("log level set to {level}");
        }
        Commands::Shutdown { timeout_ms } => {
            let forced = client.shutdown(Duration::from_millis(timeout_ms))?;
            println!("server stopped ({forced} runnable(s) terminated)");
        }
    }
    Ok(())
}

/// Runs belong to the client id that submitted them; print a fresh one so
/// later `status` and `terminate` calls can reuse it.
fn announce_client_id(client: &mut RemoteClient, fresh: bool) -> Result<()> {
    if fresh {
        eprintln!("client id: {}", client.client_id()?);
    }
    Ok(())
}

fn report(ok: bool, success: &str, failure: &str) -> Result<()> {
    if ok {
        println!("{success}");
        Ok(())
    } else {
        anyhow::bail!("{failure}; see the server log for details")
    }
}

fn print_list(json: bool, items: Vec<String>) -> Result<()> {
    if json {
        return print_json(&items);
    }
    for item in items {
        println!("{item}");
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let encoded = serde_json::to_string_pretty(value).context("failed to encode result")?;
    println!("{encoded}");
    Ok(())
}
