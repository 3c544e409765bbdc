use clap::{Parser, ValueEnum};
use log::error;
use minepay::config::Config;
use minepay::errors::Error;
use minepay::payout::PayoutManager;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "payout_manager",
    about = "Run a single settlement engine operation for one currency"
)]
struct Cli {
    #[arg(short = 'c', long = "currency")]
    currency: String,
    #[arg(short = 'f', long = "function", value_enum)]
    function: PayoutOp,
    /// Run read-only: every query executes, nothing is committed or posted.
    #[arg(short = 's', long = "simulate")]
    simulate: bool,
    /// Positional arguments for functions that take them.
    #[arg(short = 'a', long = "args", num_args = 0..)]
    args: Vec<String>,
    #[arg(long = "config", default_value = "config.yml")]
    config: PathBuf,
    #[arg(short = 'l', long = "log-level")]
    log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "snake_case")]
enum PayoutOp {
    PullPayouts,
    Payout,
    ConfirmTrans,
    AssociateAll,
    ResetAllLocked,
    UnpaidLocked,
    UnpaidUnlocked,
    DumpComplete,
    DumpIncomplete,
    LocalAssociateLocked,
    LocalAssociateAllLocked,
    InitDb,
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str, Error> {
    args.get(index).map(|s| s.as_str()).ok_or_else(|| {
        Error::Config(format!("missing argument {}: {}", index + 1, name))
    })
}

fn dispatch(
    manager: &PayoutManager,
    op: PayoutOp,
    args: &[String],
    simulate: bool,
) -> Result<(), Error> {
    match op {
        PayoutOp::PullPayouts => manager.pull_payouts(simulate).map(|_| ()),
        PayoutOp::Payout => manager.send_payout(simulate).map(|_| ()),
        PayoutOp::ConfirmTrans => manager.confirm_trans(simulate).map(|_| ()),
        PayoutOp::AssociateAll => manager.associate_all(simulate),
        PayoutOp::ResetAllLocked => manager.reset_all_locked(simulate).map(|_| ()),
        PayoutOp::UnpaidLocked => manager.unpaid_locked().map(|_| ()),
        PayoutOp::UnpaidUnlocked => manager.unpaid_unlocked().map(|_| ()),
        PayoutOp::DumpComplete => manager.dump_complete().map(|_| ()),
        PayoutOp::DumpIncomplete => manager.dump_incomplete(),
        PayoutOp::LocalAssociateLocked => {
            let row_id: i32 = arg(args, 0, "payout id")?
                .parse()
                .map_err(|_| Error::Config("payout id must be an integer".to_owned()))?;
            let txid = arg(args, 1, "txid")?;
            manager
                .local_associate_locked(row_id, txid, simulate)
                .map(|_| ())
        }
        PayoutOp::LocalAssociateAllLocked => {
            let txid = arg(args, 0, "txid")?;
            manager
                .local_associate_all_locked(txid, simulate)
                .map(|_| ())
        }
        PayoutOp::InitDb => manager.init_db(simulate),
    }
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
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&level)).init();

    let result = config
        .currency(&cli.currency)
        .and_then(|currency| PayoutManager::from_config(&config.sc_rpc_client, currency))
        .and_then(|manager| dispatch(&manager, cli.function, &cli.args, cli.simulate));
    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}
