//! Headless runner: loads a scene, runs it, prints the event stream and
//! optionally verifies that a second run reproduces the same trace.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use qnet_core::event::{EventPayload, SimEvent, TraceSummary};
use qnet_scene::{ActiveScene, SceneError, build_scene};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qnet-headless")]
#[command(about = "Run a hybrid classical/quantum network scene without a UI")]
struct Cli {
    /// Scene file (.ron or .json)
    #[arg(long)]
    scene: PathBuf,

    /// Maximum ticks to run (defaults to the scene's tick limit)
    #[arg(long)]
    ticks: Option<u64>,

    /// Print events as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Run the scene twice and compare trace hashes
    #[arg(long)]
    verify_determinism: bool,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when determinism verification fails.
fn run(cli: &Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let mut scene = build_scene(&cli.scene)?;
    let events = run_scene(&mut scene, cli.ticks)?;
    let hash = scene.engine.trace_hash();

    for event in &events {
        if cli.json {
            println!("{}", event.to_json_line()?);
        } else {
            println!("{}", describe(event));
        }
    }

    let summary = TraceSummary::from_events(&events);
    if !cli.json {
        println!();
        println!("=== {} ===", scene.scene_data.title);
        println!(
            "ticks: {}  events: {}  delivered: {}  dropped: {}  keys: {}",
            scene.engine.tick(),
            events.len(),
            summary.delivered,
            summary.dropped,
            summary.keys_established
        );
        println!("trace hash: {hash:#018x}");
    }
    if scene.engine.events().dropped_count() > 0 {
        warn!(
            evicted = scene.engine.events().dropped_count(),
            "event buffer overflowed"
        );
    }

    if cli.verify_determinism {
        let mut second = build_scene(&cli.scene)?;
        run_scene(&mut second, cli.ticks)?;
        let hash2 = second.engine.trace_hash();
        if hash != hash2 {
            eprintln!("determinism: FAIL ({hash:#018x} != {hash2:#018x})");
            return Ok(false);
        }
        info!("determinism verified: {hash:#018x}");
        if !cli.json {
            println!("determinism: PASS");
        }
    }
    Ok(true)
}

fn run_scene(scene: &mut ActiveScene, ticks: Option<u64>) -> Result<Vec<SimEvent>, SceneError> {
    match ticks {
        Some(n) => scene.run(n),
        None => scene.run_to_completion(),
    }
}

fn describe(event: &SimEvent) -> String {
    let at = event.node_name.as_deref().unwrap_or("-");
    let detail = match &event.payload {
        EventPayload::DataSent { data, .. } | EventPayload::DataReceived { data, .. } => {
            format!("{:?}", String::from_utf8_lossy(data))
        }
        EventPayload::PacketDropped { reason, .. } => format!("{reason:?}"),
        EventPayload::KeyEstablished {
            key_length_bits,
            error_rate,
            ..
        } => format!("{key_length_bits} bits, error rate {error_rate:.3}"),
        EventPayload::QkdInitiated {
            qubit_count,
            attempt,
            ..
        } => format!("{qubit_count} qubits, attempt {attempt}"),
        EventPayload::QkdAborted {
            reason, attempt, ..
        } => format!("{reason} on attempt {attempt}"),
        _ => String::new(),
    };
    format!(
        "[{:>5}] #{:<5} {:<24} {:<6} {}",
        event.tick,
        event.seq,
        event.kind().name(),
        at,
        detail
    )
}
