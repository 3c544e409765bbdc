use clap::Parser;
use log::error;
use minepay::config::Config;
use minepay::payout::PayoutManager;
use minepay::scheduler::{CurrencyWorker, Scheduler};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "minepayd", about = "Time-driven payout settlement daemon")]
struct Cli {
    #[arg(long = "config", default_value = "config.yml")]
    config: PathBuf,
    #[arg(short = 'l', long = "log-level")]
    log_level: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    let level = cli.log_level.unwrap_or_else(|| config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&level)).init();

    let mut workers = Vec::new();
    for currency in config.enabled_currencies() {
        match PayoutManager::from_config(&config.sc_rpc_client, currency) {
            Ok(manager) => workers.push(CurrencyWorker::new(manager, &config.schedule)),
            Err(e) => {
                error!("Cannot set up {}: {}", currency.currency_code, e);
                process::exit(1);
            }
        }
    }
    if workers.is_empty() {
        error!("No enabled currencies; nothing to schedule");
        process::exit(1);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .expect("failed to install the shutdown handler");

    Scheduler::new(workers).run(shutdown);
}
