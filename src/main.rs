
use bindweed::comm::GameLoop;
use bindweed::config::Config;

use clap::Parser;
use log::{error, info};

use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the JSON config file
    #[clap(short, long, default_value = "config.json")]
    config: PathBuf,
    /// Override the listen address from the config
    #[clap(short, long)]
    listen: Option<String>,
    /// Override the tick interval in milliseconds
    #[clap(short, long)]
    tick_ms: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(tick_ms) = args.tick_ms {
        config.tick_ms = tick_ms;
    }

    // A signal just raises the flag; the loop notices at its next tick
    // boundary and winds down in an orderly way.
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in &[signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(*signal, Arc::clone(&shutdown)) {
            error!("Couldn't install a handler for signal {}: {}", signal, e);
        }
    }

    let mut game = match GameLoop::new(config, shutdown) {
        Ok(game) => game,
        Err(e) => {
            error!("Couldn't start up: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = game.run() {
        error!("Fatal: {}", e);
        process::exit(1);
    }
    info!("Closed down cleanly.");
}
