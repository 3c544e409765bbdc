use crate::config::CoinservConfig;
use crate::errors::{Error, WalletErrorKind};
use crate::jsonrpc;
use crate::models::Money;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Seconds the wallet stays unlocked around a send.
const UNLOCK_WINDOW_SECS: u64 = 10;

const WALLET_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct WalletTransaction {
    pub confirmations: i64,
    pub fee: Option<Money>,
}

/// The coin daemon seam. `send_many` moves real funds and is NOT idempotent:
/// an `Err` does not prove the transaction was never broadcast, which is why
/// the settlement engine locks rows before calling it.
pub trait CoinRpc: Send {
    /// Cheap liveness probe.
    fn poke_rpc(&self) -> Result<(), Error>;

    /// Spendable balance of the given account, 8 fractional digits.
    fn get_balance(&self, account: &str) -> Result<Money, Error>;

    /// Submit one transaction paying every recipient. Returns the txid and
    /// whatever transaction metadata the daemon reports.
    fn send_many(
        &self,
        account: &str,
        recipients: &BTreeMap<String, Money>,
    ) -> Result<(String, Value), Error>;

    fn get_transaction(&self, txid: &str) -> Result<WalletTransaction, Error>;
}

/// Production gateway: bitcoind-style JSON-RPC over HTTP basic auth.
pub struct CoinservRpc {
    http: reqwest::blocking::Client,
    url: String,
    username: String,
    password: String,
    wallet_pass: String,
    payout_fee: Option<Money>,
}

impl CoinservRpc {
    pub fn from_config(config: &CoinservConfig, payout_fee: Option<Money>) -> Result<Self, Error> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(WALLET_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::WalletUnreachable(s!(e)))?;
        Ok(CoinservRpc {
            http,
            url: format!("http://{}:{}/", config.address, config.port),
            username: config.username.clone(),
            password: config.password.clone(),
            wallet_pass: config.wallet_pass.clone(),
            payout_fee,
        })
    }

    fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        debug!("coinserv call {} {}", method, params);
        let request = jsonrpc::Request::new(method, params);
        let response = self
            .http
            .post(self.url.as_str())
            .basic_auth(&self.username, Some(&self.password))
            .json(&request)
            .send()
            .map_err(|e| Error::WalletUnreachable(s!(e)))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| Error::WalletUnreachable(s!(e)))?;

        // The daemon reports RPC-level failures with a 500 and a JSON error
        // body, so parse the envelope before judging the status code.
        match serde_json::from_str::<jsonrpc::Response>(&text) {
            Ok(parsed) => parsed
                .into_result()
                .map_err(|e| map_rpc_error(method, &e)),
            Err(_) if !status.is_success() => Err(Error::wallet(
                WalletErrorKind::Transient,
                format!("{} returned {}", method, status),
            )),
            Err(e) => Err(Error::Malformed(format!(
                "undecodable wallet response to {}: {}",
                method, e
            ))),
        }
    }
}

fn map_rpc_error(method: &str, error: &jsonrpc::ErrorData) -> Error {
    let kind = match error.code {
        -6 => WalletErrorKind::InsufficientFunds,
        -5 => WalletErrorKind::NotFound,
        _ => WalletErrorKind::Unknown,
    };
    Error::wallet(kind, format!("{}: {}", method, error))
}

impl CoinRpc for CoinservRpc {
    fn poke_rpc(&self) -> Result<(), Error> {
        self.call("getinfo", json!([])).map(|_| ())
    }

    fn get_balance(&self, account: &str) -> Result<Money, Error> {
        let result = self.call("getbalance", json!([account]))?;
        Money::from_value(&result)
    }

    fn send_many(
        &self,
        account: &str,
        recipients: &BTreeMap<String, Money>,
    ) -> Result<(String, Value), Error> {
        if !self.wallet_pass.is_empty() {
            info!("Unlocking wallet for {}s", UNLOCK_WINDOW_SECS);
            self.call(
                "walletpassphrase",
                json!([self.wallet_pass.as_str(), UNLOCK_WINDOW_SECS]),
            )?;
        }
        if let Some(fee) = self.payout_fee {
            info!("Setting tx fee to {}", fee);
            self.call("settxfee", json!([fee.to_json()]))?;
        }

        let amounts: Value = recipients
            .iter()
            .map(|(address, amount)| (address.clone(), amount.to_json()))
            .collect::<serde_json::Map<String, Value>>()
            .into();
        let result = self.call("sendmany", json!([account, amounts]))?;
        let txid = result
            .as_str()
            .ok_or_else(|| Error::Malformed(format!("sendmany returned {}", result)))?
            .to_owned();

        // The payment already went through; a metadata lookup failure must
        // not turn success into an error.
        let meta = match self.call("gettransaction", json!([txid.as_str()])) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Paid with txid {} but metadata lookup failed: {}", txid, e);
                Value::Null
            }
        };
        Ok((txid, meta))
    }

    fn get_transaction(&self, txid: &str) -> Result<WalletTransaction, Error> {
        let result = self.call("gettransaction", json!([txid]))?;
        let confirmations = result
            .get("confirmations")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                Error::Malformed(format!("gettransaction missing confirmations: {}", result))
            })?;
        let fee = match result.get("fee") {
            Some(value) if !value.is_null() => Some(Money::from_value(value)?),
            _ => None,
        };
        Ok(WalletTransaction { confirmations, fee })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc_error(code: i32) -> jsonrpc::ErrorData {
        serde_json::from_value(json!({"code": code, "message": "boom"})).unwrap()
    }

    #[test]
    fn daemon_error_codes_map_to_kinds() {
        match map_rpc_error("sendmany", &rpc_error(-6)) {
            Error::Wallet { kind, .. } => assert_eq!(kind, WalletErrorKind::InsufficientFunds),
            other => panic!("unexpected {:?}", other),
        }
        match map_rpc_error("gettransaction", &rpc_error(-5)) {
            Error::Wallet { kind, .. } => assert_eq!(kind, WalletErrorKind::NotFound),
            other => panic!("unexpected {:?}", other),
        }
        for code in [-28, -32601] {
            match map_rpc_error("getinfo", &rpc_error(code)) {
                Error::Wallet { kind, .. } => assert_eq!(kind, WalletErrorKind::Unknown),
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
