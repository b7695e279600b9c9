use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Barrier;
use std::time::Instant;
use tracing::info;
use vmintern_core::{init_logging, ConfigManager};
use vmintern_runtime::{
    ClassDefinition, ContextDescriptor, LoaderObject, Runtime, RuntimeStatistics,
};

#[derive(Parser)]
#[command(name = "vmintern")]
#[command(about = "vmintern - exercise and inspect the interning runtime core", long_about = None)]
#[command(version)]
struct Cli {
    /// Output format (json, pretty)
    #[arg(short, long, global = true, default_value = "pretty")]
    output: OutputFormat,

    /// Configuration file (defaults to ./.vmintern.toml when present)
    #[arg(short, long, global = true, env = "VMINTERN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Load classes from many threads, unload them, and report table state
    Stress {
        /// Mutator threads (defaults to the number of CPUs)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Distinct identifiers each context interns
        #[arg(short, long, default_value_t = 1_000)]
        identifiers: usize,

        /// Contexts each thread registers per round
        #[arg(long, default_value_t = 4)]
        contexts: usize,

        /// Load/unload rounds
        #[arg(short, long, default_value_t = 5)]
        rounds: usize,
    },

    /// Start a runtime and print its statistics
    Stats,

    /// Write a default configuration file
    InitConfig {
        /// Destination path
        #[arg(default_value = ".vmintern.toml")]
        path: PathBuf,
    },
}

#[derive(Serialize)]
struct StressResult {
    threads: usize,
    rounds: usize,
    contexts_registered: usize,
    identifiers_interned: usize,
    contexts_unloaded: usize,
    elapsed_ms: u128,
    statistics: RuntimeStatistics,
}

#[derive(Serialize)]
struct InitConfigResult {
    path: String,
    status: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::load_from(path),
        None => ConfigManager::load(),
    }
    .context("Failed to load configuration")?;
    init_logging(&manager.config().logging).context("Failed to initialize logging")?;

    match execute_command(&cli, manager) {
        Ok(output) => {
            print_output(&cli.output, &output)?;
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn execute_command(cli: &Cli, manager: ConfigManager) -> Result<serde_json::Value> {
    match &cli.command {
        Commands::Stress {
            threads,
            identifiers,
            contexts,
            rounds,
        } => {
            let threads = threads.unwrap_or_else(num_cpus::get).max(1);
            execute_stress(manager, threads, *identifiers, *contexts, *rounds)
        }
        Commands::Stats => {
            let runtime =
                Runtime::from_manager(manager).context("Failed to start runtime")?;
            Ok(serde_json::to_value(runtime.statistics())?)
        }
        Commands::InitConfig { path } => {
            ConfigManager::create_default_config(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Ok(serde_json::to_value(InitConfigResult {
                path: path.display().to_string(),
                status: "created".to_string(),
            })?)
        }
    }
}

fn execute_stress(
    manager: ConfigManager,
    threads: usize,
    identifiers: usize,
    contexts: usize,
    rounds: usize,
) -> Result<serde_json::Value> {
    let runtime = Runtime::from_manager(manager).context("Failed to start runtime")?;
    let started = Instant::now();
    let mut contexts_unloaded = 0;

    for round in 0..rounds {
        let barrier = Barrier::new(threads);
        std::thread::scope(|scope| -> Result<()> {
            let workers: Vec<_> = (0..threads)
                .map(|worker| {
                    let runtime = &runtime;
                    let barrier = &barrier;
                    scope.spawn(move || -> Result<()> {
                        let mutator = runtime.attach_mutator();
                        {
                            let _waiting = mutator.blocked();
                            barrier.wait();
                        }
                        for slot in 0..contexts {
                            let loader =
                                LoaderObject::new(format!("round-{round}/worker-{worker}/{slot}"));
                            let context =
                                runtime.register_context(ContextDescriptor::for_loader(&loader));
                            for i in 0..identifiers {
                                let name = format!("pkg/Class{i}");
                                let id = runtime.intern_identifier(name.as_bytes())?;
                                context.retain_identifier(id)?;
                                if i % 64 == 0 {
                                    context.retain_text(runtime.intern_str(&name))?;
                                    mutator.poll();
                                }
                            }
                            let main = runtime.intern_identifier(
                                format!("{}/Main", loader.name()).as_bytes(),
                            )?;
                            context.define_class(ClassDefinition::new(main))?;
                        }
                        Ok(())
                    })
                })
                .collect();
            for worker in workers {
                worker
                    .join()
                    .map_err(|_| anyhow::anyhow!("stress worker panicked"))??;
            }
            Ok(())
        })?;

        let report = runtime.collect();
        contexts_unloaded += report.purge.purged;
        runtime.run_identifier_maintenance();
        runtime.run_text_maintenance();
        info!(round, purged = report.purge.purged, "stress round finished");
    }

    let result = StressResult {
        threads,
        rounds,
        contexts_registered: threads * contexts * rounds,
        identifiers_interned: threads * contexts * rounds * identifiers,
        contexts_unloaded,
        elapsed_ms: started.elapsed().as_millis(),
        statistics: runtime.statistics(),
    };
    Ok(serde_json::to_value(result)?)
}

fn print_output(format: &OutputFormat, value: &serde_json::Value) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Pretty => {
            print_pretty(value, 0)?;
        }
    }
    Ok(())
}

fn print_pretty(value: &serde_json::Value, depth: usize) -> Result<()> {
    let indent = "  ".repeat(depth);
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                let key_colored = key.cyan().bold();
                match val {
                    serde_json::Value::String(s) => {
                        println!("{}{}: {}", indent, key_colored, s.green());
                    }
                    serde_json::Value::Number(n) => {
                        println!("{}{}: {}", indent, key_colored, n.to_string().yellow());
                    }
                    serde_json::Value::Bool(b) => {
                        let val_colored = if *b {
                            "true".green()
                        } else {
                            "false".red()
                        };
                        println!("{}{}: {}", indent, key_colored, val_colored);
                    }
                    serde_json::Value::Object(_) => {
                        println!("{}{}:", indent, key_colored);
                        print_pretty(val, depth + 1)?;
                    }
                    _ => {
                        println!("{}{}: {}", indent, key_colored, val);
                    }
                }
            }
        }
        _ => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
    }
    Ok(())
}
