use streamfuzz_core::config::{StreamfuzzConfig, default_iterations};
use streamfuzz_core::fuzzer::{FuzzerEvent, FuzzerState, TestResult};
use streamfuzz_core::logging::setup_logger;

use clap::Parser;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(long)]
    seed: Option<u64>,
    #[clap(long)]
    listen: Option<SocketAddr>,
    #[clap(long, default_value = "info")]
    log_level: String,
    #[clap(long, value_parser)]
    log_file: Option<PathBuf>,
    /// Write the crash logs as JSON to this file when the run ends.
    #[clap(long, value_parser)]
    logs_out: Option<PathBuf>,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    setup_logger(cli.log_file.as_deref(), &cli.log_level)?;

    let mut config = match cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            StreamfuzzConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("streamfuzz.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}"
                );
                StreamfuzzConfig::load_from_file(&default_config_path)?
            } else {
                println!(
                    "No config file specified and default 'streamfuzz.toml' not found, using built-in defaults."
                );
                StreamfuzzConfig::default()
            }
        }
    };

    let fuzzer = config.fuzzer.get_or_insert_with(Default::default);
    if let Some(iterations) = cli.iterations {
        fuzzer.max_iterations = iterations;
    }
    if let Some(seed) = cli.seed {
        fuzzer.seed = Some(seed);
    }
    if let Some(listen) = cli.listen {
        fuzzer.listen = listen;
    }
    let max_iterations = config
        .fuzzer
        .as_ref()
        .map_or(default_iterations(), |f| f.max_iterations);

    log::debug!("Effective configuration: {config:#?}");

    let server = config.build_server()?;
    if !server
        .inputs()
        .iter()
        .any(|entry| entry.item().is_selectable())
    {
        anyhow::bail!("No selectable inputs configured, nothing to fuzz");
    }

    let events = server.subscribe();
    println!(
        "Starting fuzz loop for {} iterations with {} inputs and {} mutation configs...",
        max_iterations,
        server.inputs().len(),
        server.configurations().len()
    );
    let start_time = Instant::now();
    server.start()?;

    let mut finished = 0u64;
    let mut crashes = 0u64;
    let mut halted = false;
    while finished < max_iterations {
        let event = match events.recv_timeout(Duration::from_secs(1)) {
            Ok(event) => event,
            Err(_) if server.state() == FuzzerState::Stopped => {
                halted = true;
                break;
            }
            Err(_) => continue,
        };
        match event {
            FuzzerEvent::StateChanged(FuzzerState::Stopped) => {
                halted = true;
                break;
            }
            FuzzerEvent::TestEnded(report) => {
                finished += 1;
                if report.result == TestResult::Crash {
                    crashes += 1;
                }
                if finished % (max_iterations / 100).max(1) == 0 {
                    let elapsed = start_time.elapsed().as_secs_f32();
                    let tests_per_sec = if elapsed > 0.0 {
                        finished as f32 / elapsed
                    } else {
                        0.0
                    };
                    print!(
                        "\rTest: {finished}/{max_iterations}, Crashes: {crashes}, Tests/sec: {tests_per_sec:.2}   "
                    );
                    std::io::stdout().flush()?;
                }
            }
            FuzzerEvent::CrashLogged(entry) => {
                println!("\n!!! CRASH (Test {}) !!!", entry.test_number);
                println!("  Input: {}", entry.input);
                match (&entry.config, &entry.config_source) {
                    (Some(config), Some(source)) => println!("  Config: {config} ({source:?})"),
                    (Some(config), None) => println!("  Config: {config}"),
                    _ => println!("  Config: <unmutated>"),
                }
                println!("  Sample: {}", entry.sample_id);
                println!("  Description: {}", entry.description);
                println!("  Evidence: {:?} ({})", entry.evidence_path, entry.evidence_hash);
            }
            _ => {}
        }
    }
    server.shutdown();

    let stats = server.stats();
    println!("\nFuzz loop finished in {:.2?}.", start_time.elapsed());
    println!(
        "Total Tests: {}, Crashes: {}, Inconclusive: {}",
        stats.tests, stats.crashes, stats.fails
    );
    for entry in server.configurations() {
        let config_stats = entry.stats();
        let source = entry
            .source()
            .map(|path| format!(" ({path:?})"))
            .unwrap_or_default();
        println!(
            "  #{} {}{}: {} tests, {} crashes",
            entry.id(),
            entry.item(),
            source,
            config_stats.tests,
            config_stats.crashes
        );
    }

    if let Some(logs_out) = cli.logs_out {
        let json = serde_json::to_string_pretty(&server.logs())?;
        std::fs::write(&logs_out, json)
            .map_err(|e| anyhow::anyhow!("Failed to write crash logs to {:?}: {}", logs_out, e))?;
        println!("Crash logs written to {logs_out:?}");
    }

    if halted {
        anyhow::bail!("Fuzzer stopped after {finished} of {max_iterations} tests, see the log");
    }
    Ok(())
}
