use bigdecimal::BigDecimal;
use clap::{Parser, ValueEnum};
use log::error;
use minepay::config::Config;
use minepay::errors::Error;
use minepay::trade::TradeManager;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;

#[derive(Parser)]
#[command(
    name = "trade_manager",
    about = "Reconcile coordinator trade requests against executed fills"
)]
struct Cli {
    #[arg(short = 'f', long = "function", value_enum)]
    function: TradeOp,
    /// Run read-only: nothing is posted to the coordinator.
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
enum TradeOp {
    GetOpenTradeRequests,
    CloseTradeRequest,
    CloseSellRequests,
    CloseBuyRequests,
    UpdateTradeRequest,
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str, Error> {
    args.get(index).map(|s| s.as_str()).ok_or_else(|| {
        Error::Config(format!("missing argument {}: {}", index + 1, name))
    })
}

fn decimal_arg(args: &[String], index: usize, name: &str) -> Result<BigDecimal, Error> {
    let text = arg(args, index, name)?;
    BigDecimal::from_str(text)
        .map_err(|_| Error::InvalidAmount(format!("{} is not a decimal: {:?}", name, text)))
}

fn int_arg(args: &[String], index: usize, name: &str) -> Result<i64, Error> {
    arg(args, index, name)?
        .parse()
        .map_err(|_| Error::Config(format!("{} must be an integer", name)))
}

fn optional_int_arg(args: &[String], index: usize, name: &str) -> Result<Option<i64>, Error> {
    match args.get(index) {
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} must be an integer", name))),
        None => Ok(None),
    }
}

fn dispatch(
    manager: &TradeManager,
    op: TradeOp,
    args: &[String],
    simulate: bool,
) -> Result<(), Error> {
    match op {
        TradeOp::GetOpenTradeRequests => manager.get_open_trade_requests().map(|_| ()),
        TradeOp::CloseTradeRequest => {
            let tr_id = int_arg(args, 0, "tr_id")?;
            let quantity = decimal_arg(args, 1, "quantity")?;
            let fees = decimal_arg(args, 2, "total_fees")?;
            manager
                .close_trade_request(tr_id, quantity, fees, simulate)
                .map(|_| ())
        }
        TradeOp::CloseSellRequests => {
            let currency = arg(args, 0, "currency")?;
            let btc_quantity = decimal_arg(args, 1, "btc_quantity")?;
            let btc_fees = decimal_arg(args, 2, "btc_fees")?;
            let start = optional_int_arg(args, 3, "start_tr_id")?;
            let stop = optional_int_arg(args, 4, "stop_tr_id")?;
            manager
                .close_sell_requests(currency, &btc_quantity, &btc_fees, start, stop, simulate)
                .map(|_| ())
        }
        TradeOp::CloseBuyRequests => {
            let currency = arg(args, 0, "currency")?;
            let btc_quantity = decimal_arg(args, 1, "btc_quantity")?;
            let btc_fees = decimal_arg(args, 2, "btc_fees")?;
            let start = optional_int_arg(args, 3, "start_tr_id")?;
            let stop = optional_int_arg(args, 4, "stop_tr_id")?;
            manager
                .close_buy_requests(currency, &btc_quantity, &btc_fees, start, stop, simulate)
                .map(|_| ())
        }
        TradeOp::UpdateTradeRequest => {
            let tr_id = int_arg(args, 0, "tr_id")?;
            let quantity = decimal_arg(args, 1, "quantity")?;
            let fees = decimal_arg(args, 2, "fees")?;
            let status = int_arg(args, 3, "status")?;
            manager
                .update_trade_request(tr_id, quantity, fees, status, simulate)
                .map(|_| ())
        }
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

    let result = TradeManager::from_config(&config.sc_rpc_client)
        .and_then(|manager| dispatch(&manager, cli.function, &cli.args, cli.simulate));
    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}
