//! printkit command-line host
//!
//! Embeds the analyzer and the print engine behind a small CLI.
//! Exit codes: 0 success, 2 parse/file failure, 3 connection failure,
//! 4 print aborted by a firmware error.

use clap::{Parser, Subcommand};
use printkit::{
    analyze_program, init_logging, list_ports, AnalyzerOptions, Config, PrintEngine, PrinterState,
    ProgressCallback, Program,
};
use std::sync::Arc;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

const EXIT_PARSE: u8 = 2;
const EXIT_CONNECT: u8 = 3;
const EXIT_FIRMWARE: u8 = 4;

#[derive(Parser)]
#[command(name = "printkit", version, about = "3D printer host core")]
struct Cli {
    /// Path to a config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports a printer could be attached to
    Ports,
    /// Analyze a GCODE file: print time, filament, mass, cost
    Analyze {
        /// The GCODE file to analyze
        file: PathBuf,
        /// Also compute the per-layer path trace
        #[arg(long)]
        layers: bool,
    },
    /// Stream a GCODE file to the printer
    Print {
        /// The GCODE file to print
        file: PathBuf,
        /// Serial port (overrides the configured one; "Auto" probes)
        #[arg(long)]
        port: Option<String>,
        /// Baud rate (overrides the configured one)
        #[arg(long)]
        baud: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_logging() {
        eprintln!("printkit: {}", e);
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(EXIT_PARSE);
        }
    };

    match cli.command {
        Command::Ports => cmd_ports(),
        Command::Analyze { file, layers } => cmd_analyze(&config, &file, layers),
        Command::Print { file, port, baud } => cmd_print(config, &file, port, baud).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Ok(Config::load_from_file(path)?),
        None => Ok(Config::load_or_default()?),
    }
}

fn cmd_ports() -> ExitCode {
    match list_ports() {
        Ok(ports) if ports.is_empty() => {
            println!("No printer-like serial ports found");
            ExitCode::SUCCESS
        }
        Ok(ports) => {
            for port in ports {
                match port.manufacturer {
                    Some(mfg) => println!("{}\t{} ({})", port.port_name, port.description, mfg),
                    None => println!("{}\t{}", port.port_name, port.description),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(EXIT_CONNECT)
        }
    }
}

fn cmd_analyze(config: &Config, file: &std::path::Path, layers: bool) -> ExitCode {
    let program = match Program::load(file) {
        Ok(program) => program,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(EXIT_PARSE);
        }
    };

    let options = AnalyzerOptions {
        with_layers: layers,
    };
    let progress: ProgressCallback = Arc::new(|fraction| {
        tracing::debug!("analyzing... {:.0}%", fraction * 100.0);
    });
    let outcome = analyze_program(
        &program,
        &config.printer,
        &config.filament,
        &options,
        Some(progress),
        None,
    );
    let Some(result) = outcome.completed() else {
        // No abort flag was handed in, so this cannot happen; refuse to
        // report half an analysis regardless
        return ExitCode::from(EXIT_PARSE);
    };

    println!("Estimated print time: {}", format_duration(result.duration()));
    println!(
        "Filament: {:.1} mm ({:.2} cm^3, {:.1} g)",
        result.filament_mm, result.volume_cm3, result.mass_g
    );
    if let Some(cost) = result.cost {
        println!("Material cost: {:.2}", cost);
    }
    if let Some(layers) = &result.layers {
        println!("Layers: {}", layers.len());
    }
    if !result.model_errors.is_empty() {
        println!("Model errors reported by the slicer: {}", result.model_errors.len());
    }
    if !result.unknown_codes.is_empty() {
        let codes: Vec<String> = result.unknown_codes.iter().cloned().collect();
        println!("Codes not simulated: {}", codes.join(" "));
    }
    ExitCode::SUCCESS
}

async fn cmd_print(
    mut config: Config,
    file: &std::path::Path,
    port: Option<String>,
    baud: Option<u32>,
) -> ExitCode {
    if let Some(port) = port {
        config.connection.port = port;
    }
    if let Some(baud) = baud {
        config.connection.baud_rate = baud;
    }

    let program = match Program::load(file) {
        Ok(program) => program,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(EXIT_PARSE);
        }
    };

    // Cold analysis on a worker first so the engine can report an ETA
    let analysis = {
        let program = program.clone();
        let printer = config.printer.clone();
        let filament = config.filament.clone();
        tokio::task::spawn_blocking(move || {
            analyze_program(
                &program,
                &printer,
                &filament,
                &AnalyzerOptions::default(),
                None,
                None,
            )
            .completed()
        })
        .await
        .ok()
        .flatten()
    };

    let engine = PrintEngine::new(config);
    if let Err(e) = engine.connect().await {
        tracing::error!("{}", e);
        return ExitCode::from(EXIT_CONNECT);
    }

    if !wait_for_state(&engine, PrinterState::Operational, Duration::from_secs(30)).await {
        tracing::error!("printer did not come online");
        let _ = engine.disconnect().await;
        return ExitCode::from(EXIT_CONNECT);
    }

    if let Some(analysis) = analysis {
        tracing::info!(
            "estimated print time {}",
            format_duration(analysis.duration())
        );
        engine.set_reference_analysis(analysis).await;
    }

    if let Err(e) = async {
        engine.load(program).await?;
        engine.start().await
    }
    .await
    {
        tracing::error!("{}", e);
        let _ = engine.disconnect().await;
        return ExitCode::from(EXIT_CONNECT);
    }

    // Follow the job to a terminal state
    let mut last_percent = 0u32;
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let snapshot = engine.snapshot();
        match snapshot.state {
            PrinterState::Printing | PrinterState::Paused => {
                let percent = (snapshot.progress.fraction * 100.0) as u32;
                if percent / 10 > last_percent / 10 {
                    last_percent = percent;
                    match snapshot.progress.remaining_secs {
                        Some(remaining) => tracing::info!(
                            "{}% done, ~{} remaining",
                            percent,
                            format_duration(Duration::from_secs_f64(remaining))
                        ),
                        None => tracing::info!("{}% done", percent),
                    }
                }
            }
            PrinterState::Operational => {
                tracing::info!("print finished");
                let _ = engine.disconnect().await;
                return ExitCode::SUCCESS;
            }
            PrinterState::Error => {
                if let Some(error) = snapshot.error {
                    tracing::error!("{}", error);
                }
                let _ = engine.disconnect().await;
                return ExitCode::from(EXIT_FIRMWARE);
            }
            other => {
                tracing::error!("unexpected state {}", other);
                let _ = engine.disconnect().await;
                return ExitCode::from(EXIT_CONNECT);
            }
        }
    }
}

async fn wait_for_state(engine: &PrintEngine, target: PrinterState, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        let state = engine.state();
        if state == target {
            return true;
        }
        if state == PrinterState::Error {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
