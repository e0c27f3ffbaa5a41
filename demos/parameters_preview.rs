//! Live parameter preview against a local host.
//!
//! Demonstrates:
//! - Restoring and saving the session token across runs
//! - Waiting for the user to enable the plugin in the host
//! - Printing the current model's parameters as frames arrive
//!
//! Usage:
//!   cargo run --example parameters_preview
//!   cargo run --example parameters_preview -- --port 22022
//!   cargo run --example parameters_preview -- --debug

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use nlplugin::{FileTokenStore, ParameterPreview, Plugin, Result};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_PORT: u16 = 22022;

/// Minimum time between two printed tables.
const PRINT_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// Types
// ============================================================================

/// Command-line arguments.
#[derive(Debug, Clone)]
struct Args {
    port: u16,
    debug: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let port = args
            .iter()
            .position(|a| a == "--port")
            .and_then(|i| args.get(i + 1))
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        Self {
            port,
            debug: args.iter().any(|a| a == "--debug"),
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    println!("=== Parameters Preview ===\n");

    let plugin = Plugin::builder()
        .name("Parameters Preview")
        .developer("nlplugin")
        .version(env!("CARGO_PKG_VERSION"))
        .debug(args.debug)
        .build()?;

    let store = FileTokenStore::new(token_path());
    println!("[Setup] Token file: {}", store.path().display());

    let preview = ParameterPreview::attach(plugin.clone(), store)?;
    preview.toggle(&format!("ws://localhost:{}/", args.port))?;
    println!("[Connect] ws://localhost:{}/", args.port);
    println!("          Enable the plugin in the host to see parameters.");
    println!("          Press Ctrl+C to exit.\n");

    let mut updates = preview.subscribe();
    let mut states = plugin.subscribe_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("[State] {state}");
            }

            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                print_snapshot(&preview);
                tokio::time::sleep(PRINT_INTERVAL).await;
            }
        }
    }

    preview.plugin().stop();
    println!("\n[Done]");
    Ok(())
}

// ============================================================================
// Functions
// ============================================================================

/// Initialize tracing/logging.
fn init_logging(debug: bool) {
    let filter = if debug { "nlplugin=debug" } else { "nlplugin=info" };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

/// Token file under the user's config directory.
fn token_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nlplugin")
        .join("parameters_preview.token")
}

fn print_snapshot(preview: &ParameterPreview) {
    let snapshot = preview.snapshot();
    if snapshot.model_id.is_empty() {
        println!("[Model] none");
        return;
    }

    println!("[Model] {}", snapshot.model_id);
    println!("-- Live parameters --");
    print!("{}", snapshot.live);
    println!("-- Cubism parameters --");
    print!("{}", snapshot.cubism);
    println!();
}
