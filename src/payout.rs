use crate::address;
use crate::config::{CurrencyConfig, ScRpcClientConfig};
use crate::errors::Error;
use crate::models::{Money, NewPayout, Payout};
use crate::store::{self, PayoutStore};
use crate::table;
use crate::transport::{ScRpc, ScTransport};
use crate::wallet::{CoinRpc, CoinservRpc};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Everything the engine needs to know about the currency it settles.
pub struct CurrencySettings {
    pub currency_code: String,
    pub valid_address_versions: Vec<u8>,
    pub account: String,
    pub min_confirms: i64,
    pub minimum_tx_output: Money,
}

#[derive(Debug, Default, PartialEq)]
pub struct PullStats {
    pub new: usize,
    pub repeat: usize,
    pub invalid: usize,
}

#[derive(Debug)]
pub enum SendOutcome {
    /// No payable rows, or every aggregate fell under the dust limit.
    NothingToDo,
    /// Simulation: what a real run would have submitted.
    Preview {
        recipients: BTreeMap<String, Money>,
        dropped: Vec<String>,
    },
    /// A transaction was broadcast and recorded locally.
    Paid {
        coin_txid: String,
        tx_meta: Value,
        finalized: Vec<Payout>,
    },
}

enum LockPlan {
    Nothing,
    Preview {
        recipients: BTreeMap<String, Money>,
        pids: BTreeMap<String, Vec<String>>,
        dropped: Vec<String>,
    },
    Locked {
        selected: Vec<i32>,
        recipients: BTreeMap<String, Money>,
        pids: BTreeMap<String, Vec<String>>,
        balance_before: Money,
    },
}

/// The per-currency settlement engine. Sole mutator of the payout store;
/// drives the coordinator transport and the coin wallet. Constructed by the
/// scheduler daemon and by the operator CLI, never shared.
pub struct PayoutManager {
    settings: CurrencySettings,
    store: PayoutStore,
    sc_rpc: Box<dyn ScRpc>,
    coin_rpc: Box<dyn CoinRpc>,
}

fn banner(simulate: bool) {
    if simulate {
        info!("{} Simulation mode {}", "#".repeat(20), "#".repeat(20));
    }
}

fn parse_payout_entry(entry: &Value) -> Result<(String, String, Money, String), Error> {
    let fields = entry
        .as_array()
        .filter(|f| f.len() == 4)
        .ok_or_else(|| Error::Malformed(s!("payout entry is not a 4-tuple")))?;
    let user = fields[0]
        .as_str()
        .ok_or_else(|| Error::Malformed(s!("payout user is not a string")))?;
    let addr = fields[1]
        .as_str()
        .ok_or_else(|| Error::Malformed(s!("payout address is not a string")))?;
    let amount = Money::from_value(&fields[2])?;
    if !amount.is_positive() {
        return Err(Error::InvalidAmount(format!(
            "payout amount must be positive, got {}",
            amount
        )));
    }
    let pid = fields[3]
        .as_str()
        .ok_or_else(|| Error::Malformed(s!("payout pid is not a string")))?;
    Ok((user.to_owned(), addr.to_owned(), amount, pid.to_owned()))
}

fn format_pids(pids: &[String]) -> String {
    if pids.len() > 9 {
        format!("{}... ({} more)", pids[..9].join(", "), pids.len() - 9)
    } else {
        pids.join(", ")
    }
}

fn print_summary(recipients: &BTreeMap<String, Money>, pids: &BTreeMap<String, Vec<String>>) {
    let rows = recipients
        .iter()
        .map(|(addr, amount)| {
            vec![
                addr.clone(),
                s!(amount),
                pids.get(addr).map(|p| format_pids(p)).unwrap_or_default(),
            ]
        })
        .collect();
    table::print_grid("Address payment summary", &["Address", "Total", "Pids"], rows);
}

impl PayoutManager {
    pub fn new(
        settings: CurrencySettings,
        store: PayoutStore,
        sc_rpc: Box<dyn ScRpc>,
        coin_rpc: Box<dyn CoinRpc>,
    ) -> Self {
        PayoutManager {
            settings,
            store,
            sc_rpc,
            coin_rpc,
        }
    }

    pub fn from_config(
        client: &ScRpcClientConfig,
        currency: &CurrencyConfig,
    ) -> Result<Self, Error> {
        let transport = ScTransport::new(&client.rpc_url, &client.rpc_signature, client.max_age)?;
        let coin_rpc = CoinservRpc::from_config(&currency.coinserv, currency.payout_fee)?;
        let store = PayoutStore::open(&client.database_path, &currency.currency_code)?;
        let settings = CurrencySettings {
            currency_code: currency.currency_code.clone(),
            valid_address_versions: currency.valid_address_versions.clone(),
            account: currency.coinserv.account.clone(),
            min_confirms: client.min_confirms,
            minimum_tx_output: client.minimum_tx_output,
        };
        Ok(PayoutManager::new(
            settings,
            store,
            Box::new(transport),
            Box::new(coin_rpc),
        ))
    }

    pub fn currency_code(&self) -> &str {
        &self.settings.currency_code
    }

    /// Ingest pending obligations from the coordinator into the local store.
    pub fn pull_payouts(&self, simulate: bool) -> Result<PullStats, Error> {
        banner(simulate);
        let cc = &self.settings.currency_code;
        let response = match self.sc_rpc.post("get_payouts", json!({ "currency": cc })) {
            Ok(response) => response,
            Err(Error::Unreachable(e)) => {
                warn!("Unable to connect to SC: {}", e);
                return Ok(PullStats::default());
            }
            Err(e) => return Err(e),
        };
        let entries = response
            .get("pids")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| Error::Malformed(s!("get_payouts response missing pids")))?;
        if entries.is_empty() {
            info!("No {} payouts to process..", cc);
            return Ok(PullStats::default());
        }

        let mut stats = PullStats::default();
        self.store.with_exclusive(|conn| {
            for entry in &entries {
                let (user, addr, amount, pid) = match parse_payout_entry(entry) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!("Ignoring malformed payout entry {}: {}", entry, e);
                        stats.invalid += 1;
                        continue;
                    }
                };
                if !address::version_matches(&addr, &self.settings.valid_address_versions) {
                    let err = Error::InvalidAddress(format!(
                        "{} address {} did not match a valid version {:?}",
                        cc, addr, self.settings.valid_address_versions
                    ));
                    warn!("Ignoring payout {}: {}", pid, err);
                    stats.invalid += 1;
                    continue;
                }
                if store::by_pid(conn, &pid, cc)?.is_some() {
                    debug!("Ignoring payout {} because it already exists locally", pid);
                    stats.repeat += 1;
                    continue;
                }
                if !simulate {
                    store::insert_payout(
                        conn,
                        &NewPayout {
                            pid: &pid,
                            user: &user,
                            address: &addr,
                            amount,
                            currency_code: cc,
                            pull_time: Utc::now().naive_utc(),
                        },
                    )?;
                }
                stats.new += 1;
            }
            Ok(())
        })?;

        info!(
            "Inserted {} new {} payouts and skipped {} old payouts from the server. \
             {} payouts with invalid entries.",
            stats.new, cc, stats.repeat, stats.invalid
        );
        Ok(stats)
    }

    /// Group every PULLED row by address and pay the lot in one wallet
    /// transaction. The lock commit strictly precedes `send_many`; the txid
    /// commit strictly precedes reporting success.
    pub fn send_payout(&self, simulate: bool) -> Result<SendOutcome, Error> {
        banner(simulate);
        let cc = &self.settings.currency_code;
        if let Err(e) = self.coin_rpc.poke_rpc() {
            warn!(
                "Error occurred while trying to get info from the {} RPC: {}",
                cc, e
            );
            return Err(e);
        }

        let plan = self.store.with_exclusive(|conn| {
            let payouts = store::unpaid_unlocked(conn, cc)?;
            if payouts.is_empty() {
                info!("No payouts to process, exiting");
                return Ok(LockPlan::Nothing);
            }

            let mut recipients: BTreeMap<String, Money> = BTreeMap::new();
            let mut pids: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for payout in &payouts {
                *recipients
                    .entry(payout.address.clone())
                    .or_insert_with(Money::zero) += payout.amount;
                pids.entry(payout.address.clone())
                    .or_insert_with(Vec::new)
                    .push(payout.pid.clone());
            }

            let mut dropped = Vec::new();
            for (addr, total) in &recipients {
                if *total < self.settings.minimum_tx_output {
                    warn!(
                        "Removing {} with payout amount of {} (which is lower than network \
                         output min of {}) from the {} payout set",
                        addr, total, self.settings.minimum_tx_output, cc
                    );
                    dropped.push(addr.clone());
                }
            }
            for addr in &dropped {
                recipients.remove(addr);
                pids.remove(addr);
            }

            let selected: Vec<i32> = payouts
                .iter()
                .filter(|p| recipients.contains_key(&p.address))
                .map(|p| p.id)
                .collect();
            let total_out: Money = recipients.values().sum();

            let balance = self.coin_rpc.get_balance(&self.settings.account)?;
            info!(
                "Account balance for {} account {:?}: {}",
                cc, self.settings.account, balance
            );
            info!("Total to be paid {}", total_out);

            if total_out.is_zero() {
                info!("Paying out 0 funds! Aborting...");
                return Ok(LockPlan::Nothing);
            }
            if balance < total_out {
                error!("Payout wallet is out of funds!");
                return Err(Error::FundsInsufficient {
                    available: balance,
                    required: total_out,
                });
            }

            if simulate {
                return Ok(LockPlan::Preview {
                    recipients,
                    pids,
                    dropped,
                });
            }

            // The lock must be durable before any coins can move.
            store::lock_rows(conn, &selected, Utc::now().naive_utc())?;
            Ok(LockPlan::Locked {
                selected,
                recipients,
                pids,
                balance_before: balance,
            })
        })?;

        match plan {
            LockPlan::Nothing => Ok(SendOutcome::NothingToDo),
            LockPlan::Preview {
                recipients,
                pids,
                dropped,
            } => {
                print_summary(&recipients, &pids);
                info!("We're simulating, so the transaction is not submitted");
                Ok(SendOutcome::Preview { recipients, dropped })
            }
            LockPlan::Locked {
                selected,
                recipients,
                pids,
                balance_before,
            } => {
                print_summary(&recipients, &pids);
                self.submit_locked(selected, recipients, balance_before)
            }
        }
    }

    fn submit_locked(
        &self,
        selected: Vec<i32>,
        recipients: BTreeMap<String, Money>,
        balance_before: Money,
    ) -> Result<SendOutcome, Error> {
        match self.coin_rpc.send_many(&self.settings.account, &recipients) {
            Ok((coin_txid, tx_meta)) => {
                let finalized = self.store.with_exclusive(|conn| {
                    store::mark_paid(conn, &selected, &coin_txid, Utc::now().naive_utc())
                })?;
                info!(
                    "Updated {} (local) payouts with txid {}",
                    finalized.len(),
                    coin_txid
                );
                Ok(SendOutcome::Paid {
                    coin_txid,
                    tx_meta,
                    finalized,
                })
            }
            Err(send_error) => {
                warn!("{}", send_error);
                let balance_after = match self.coin_rpc.get_balance(&self.settings.account) {
                    Ok(balance) => balance,
                    Err(check_error) => {
                        error!(
                            "Send failed AND the balance could not be re-read. Keeping {} \
                             payout entries locked until an operator intervenes.",
                            selected.len()
                        );
                        return Err(Error::WalletIndeterminate(format!(
                            "send failed ({}); balance re-read failed ({})",
                            send_error, check_error
                        )));
                    }
                };
                if balance_after == balance_before {
                    error!(
                        "RPC error occurred and wallet balance didn't change. \
                         Unlocking payouts."
                    );
                    self.store
                        .with_exclusive(|conn| store::unlock_rows(conn, &selected))?;
                    Err(send_error)
                } else {
                    error!(
                        "RPC error occurred and wallet balance changed! Keeping the payout \
                         entries locked. dump_incomplete can show you the details of the \
                         locked entries. If you're SURE a double payout hasn't occurred, \
                         use reset_all_locked to reset the entries."
                    );
                    Err(Error::WalletIndeterminate(s!(send_error)))
                }
            }
        }
    }

    /// Push (txid, fee, pids) for every PAID row to the coordinator.
    pub fn associate_all(&self, simulate: bool) -> Result<(), Error> {
        banner(simulate);
        let cc = &self.settings.currency_code;
        let payouts = self
            .store
            .with_exclusive(|conn| store::paid_unassociated(conn, cc))?;

        let mut buckets: BTreeMap<String, Vec<Payout>> = BTreeMap::new();
        for payout in payouts {
            if let Some(coin_txid) = payout.txid.clone() {
                buckets.entry(coin_txid).or_insert_with(Vec::new).push(payout);
            }
        }

        for (coin_txid, group) in buckets {
            let tx_fee = match self.coin_rpc.get_transaction(&coin_txid) {
                Ok(tx) => tx.fee.unwrap_or_else(Money::zero),
                Err(e) => {
                    warn!(
                        "Skipping transaction with id {}, failed looking it up from the \
                         {} wallet: {}",
                        coin_txid, cc, e
                    );
                    continue;
                }
            };
            if let Err(e) = self.associate(&coin_txid, &group, tx_fee, simulate) {
                warn!("Association of txid {} failed: {}", coin_txid, e);
            }
        }
        Ok(())
    }

    /// Tell the coordinator which txid paid these pids, and at what fee.
    pub fn associate(
        &self,
        coin_txid: &str,
        payouts: &[Payout],
        tx_fee: Money,
        simulate: bool,
    ) -> Result<bool, Error> {
        let pids: Vec<&str> = payouts.iter().map(|p| p.pid.as_str()).collect();
        info!(
            "Trying to associate {} payouts with txid {}",
            pids.len(),
            coin_txid
        );
        if simulate {
            info!("We're simulating, so don't actually post to SC");
            return Ok(false);
        }

        let response = self.sc_rpc.post(
            "associate_payouts",
            json!({
                "coin_txid": coin_txid,
                "pids": pids,
                "tx_fee": tx_fee.abs().to_json(),
                "currency": self.settings.currency_code,
            }),
        )?;
        if response.get("result").and_then(Value::as_bool).unwrap_or(false) {
            info!("Received success response from the server.");
            let ids: Vec<i32> = payouts.iter().map(|p| p.id).collect();
            self.store.with_exclusive(|conn| {
                store::mark_associated(conn, &ids, Utc::now().naive_utc())
            })?;
            Ok(true)
        } else {
            error!(
                "Failed to push association information for {} payouts!",
                self.settings.currency_code
            );
            Ok(false)
        }
    }

    /// Walk the coordinator's unconfirmed transactions and report the ones
    /// the wallet has buried deeply enough.
    pub fn confirm_trans(&self, simulate: bool) -> Result<usize, Error> {
        banner(simulate);
        let cc = &self.settings.currency_code;
        info!(
            "Attempting to grab unconfirmed {} transactions from SC, poking the RPC...",
            cc
        );
        if let Err(e) = self.coin_rpc.poke_rpc() {
            warn!(
                "Error occurred while trying to get info from the {} RPC: {}",
                cc, e
            );
            return Err(e);
        }

        let response = self.sc_rpc.get(&format!(
            "api/transaction?__filter_by={{\"confirmed\":false,\"currency\":\"{}\"}}",
            cc
        ))?;
        if !response.get("success").and_then(Value::as_bool).unwrap_or(false) {
            error!("Failure grabbing unconfirmed transactions: {}", response);
            return Err(Error::Protocol(s!("transaction listing reported failure")));
        }
        let objects = response
            .get("objects")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if objects.is_empty() {
            info!("No transactions were returned to confirm...exiting.");
            return Ok(0);
        }

        let mut tids: Vec<String> = Vec::new();
        for object in &objects {
            let coin_txid = match object.get("txid").and_then(Value::as_str) {
                Some(t) => t,
                None => {
                    warn!("Ignoring malformed transaction object {}", object);
                    continue;
                }
            };
            debug!("Connecting to coinserv to lookup confirms for {}", coin_txid);
            let tx = match self.coin_rpc.get_transaction(coin_txid) {
                Ok(tx) => tx,
                Err(e) => {
                    warn!("Unable to fetch txid {} from the {} wallet: {}", coin_txid, cc, e);
                    continue;
                }
            };
            if tx.confirmations > self.settings.min_confirms {
                info!(
                    "Confirmed txid {} with {} confirms",
                    coin_txid, tx.confirmations
                );
                tids.push(coin_txid.to_owned());
            } else {
                info!(
                    "TX {} not yet confirmed. {}/{} confirms",
                    coin_txid, tx.confirmations, self.settings.min_confirms
                );
            }
        }

        if tids.is_empty() {
            info!("No transactions in need of confirmation");
            return Ok(0);
        }
        if simulate {
            info!("We're simulating, so don't actually post to SC");
            return Ok(tids.len());
        }
        let count = tids.len();
        let response = self
            .sc_rpc
            .post("confirm_transactions", json!({ "tids": tids }))?;
        if response.get("result").and_then(Value::as_bool).unwrap_or(false) {
            info!("Successfully confirmed {} transactions", count);
            Ok(count)
        } else {
            error!("Failed to push confirmation information");
            Err(Error::Protocol(s!("confirm_transactions rejected")))
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Operator repair: the only exits from a locked-with-moved-funds state.
    ////////////////////////////////////////////////////////////////////////

    /// Flip every locked row back to payable. The caller asserts no send is
    /// in flight and no mid-send funds movement happened.
    pub fn reset_all_locked(&self, simulate: bool) -> Result<usize, Error> {
        banner(simulate);
        let cc = &self.settings.currency_code;
        let locked = self
            .store
            .with_exclusive(|conn| store::unpaid_locked(conn, cc))?;
        info!("Resetting {} payout ids", locked.len());
        if simulate {
            info!("Just kidding, we're simulating... Exit.");
            return Ok(locked.len());
        }
        self.store.with_exclusive(|conn| store::reset_locked(conn, cc))
    }

    /// Attach a known txid to one unpaid, locked row.
    pub fn local_associate_locked(
        &self,
        row_id: i32,
        coin_txid: &str,
        simulate: bool,
    ) -> Result<usize, Error> {
        banner(simulate);
        info!("Associating payout id {} with TX ID {}", row_id, coin_txid);
        if simulate {
            info!("Just kidding, we're simulating... Exit.");
            return Ok(0);
        }
        let updated = self.store.with_exclusive(|conn| {
            store::local_associate_locked(
                conn,
                row_id,
                &self.settings.currency_code,
                coin_txid,
                Utc::now().naive_utc(),
            )
        })?;
        if updated == 0 {
            warn!(
                "No unpaid locked {} payout with id {}",
                self.settings.currency_code, row_id
            );
        }
        Ok(updated)
    }

    /// Attach a known txid to every unpaid, locked row of this currency.
    /// Useful when a payment went out but the txid never reached the store;
    /// the coordinator still needs `associate_all` afterwards.
    pub fn local_associate_all_locked(
        &self,
        coin_txid: &str,
        simulate: bool,
    ) -> Result<usize, Error> {
        banner(simulate);
        let cc = &self.settings.currency_code;
        let locked = self
            .store
            .with_exclusive(|conn| store::unpaid_locked(conn, cc))?;
        info!(
            "Associating {} payout ids with TX ID {}",
            locked.len(),
            coin_txid
        );
        if simulate {
            info!("Just kidding, we're simulating... Exit.");
            return Ok(0);
        }
        self.store.with_exclusive(|conn| {
            store::local_associate_all_locked(conn, cc, coin_txid, Utc::now().naive_utc())
        })
    }

    ////////////////////////////////////////////////////////////////////////
    // Read-only reports
    ////////////////////////////////////////////////////////////////////////

    pub fn unpaid_locked(&self) -> Result<Vec<Payout>, Error> {
        let cc = &self.settings.currency_code;
        let rows = self
            .store
            .with_exclusive(|conn| store::unpaid_locked(conn, cc))?;
        table::print_payouts(&format!("Unpaid locked {} payouts", cc), &rows);
        Ok(rows)
    }

    pub fn unpaid_unlocked(&self) -> Result<Vec<Payout>, Error> {
        let cc = &self.settings.currency_code;
        let rows = self
            .store
            .with_exclusive(|conn| store::unpaid_unlocked(conn, cc))?;
        table::print_payouts(&format!("{} payouts ready to payout", cc), &rows);
        Ok(rows)
    }

    pub fn paid_unassoc(&self) -> Result<Vec<Payout>, Error> {
        let cc = &self.settings.currency_code;
        let rows = self
            .store
            .with_exclusive(|conn| store::paid_unassociated(conn, cc))?;
        table::print_payouts(&format!("Paid un-associated {} payouts", cc), &rows);
        Ok(rows)
    }

    pub fn dump_incomplete(&self) -> Result<(), Error> {
        self.unpaid_locked()?;
        self.paid_unassoc()?;
        self.unpaid_unlocked()?;
        Ok(())
    }

    pub fn dump_complete(&self) -> Result<Vec<Payout>, Error> {
        let cc = &self.settings.currency_code;
        let rows = self.store.with_exclusive(|conn| store::complete(conn, cc))?;
        table::print_payouts(&format!("Paid + associated {} payouts", cc), &rows);
        Ok(rows)
    }

    /// Deletes all data and rebuilds the table. Use carefully...
    pub fn init_db(&self, simulate: bool) -> Result<(), Error> {
        banner(simulate);
        if simulate {
            info!("Just kidding, we're simulating... Exit.");
            return Ok(());
        }
        warn!(
            "Dropping and recreating the {} payout table",
            self.settings.currency_code
        );
        self.store.drop_and_create()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::encode_with_version;
    use crate::errors::WalletErrorKind;
    use crate::models::PayoutState;
    use crate::wallet::WalletTransaction;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ScState {
        payouts_response: Value,
        transactions_response: Value,
        associate_result: bool,
        unreachable: bool,
        posts: Vec<(String, Value)>,
    }

    #[derive(Clone, Default)]
    struct MockSc(Arc<Mutex<ScState>>);

    impl MockSc {
        fn posts(&self) -> Vec<(String, Value)> {
            self.0.lock().unwrap().posts.clone()
        }
    }

    impl ScRpc for MockSc {
        fn post(&self, path: &str, data: Value) -> Result<Value, Error> {
            let mut state = self.0.lock().unwrap();
            if state.unreachable {
                return Err(Error::Unreachable(s!("connection refused")));
            }
            state.posts.push((path.to_owned(), data));
            match path {
                "get_payouts" => Ok(state.payouts_response.clone()),
                "associate_payouts" => Ok(json!({ "result": state.associate_result })),
                "confirm_transactions" => Ok(json!({ "result": true })),
                other => Err(Error::Protocol(format!("unexpected post to {}", other))),
            }
        }

        fn get(&self, _path: &str) -> Result<Value, Error> {
            Ok(self.0.lock().unwrap().transactions_response.clone())
        }
    }

    struct WalletState {
        reachable: bool,
        balances: Vec<Money>,
        balance_calls: usize,
        send_error: Option<WalletErrorKind>,
        send_txid: String,
        sends: Vec<(String, BTreeMap<String, Money>)>,
        transactions: BTreeMap<String, WalletTransaction>,
    }

    impl Default for WalletState {
        fn default() -> Self {
            WalletState {
                reachable: true,
                balances: vec![Money::zero()],
                balance_calls: 0,
                send_error: None,
                send_txid: s!("txH"),
                sends: Vec::new(),
                transactions: BTreeMap::new(),
            }
        }
    }

    #[derive(Clone, Default)]
    struct MockWallet(Arc<Mutex<WalletState>>);

    impl MockWallet {
        fn sends(&self) -> Vec<(String, BTreeMap<String, Money>)> {
            self.0.lock().unwrap().sends.clone()
        }
    }

    impl CoinRpc for MockWallet {
        fn poke_rpc(&self) -> Result<(), Error> {
            if self.0.lock().unwrap().reachable {
                Ok(())
            } else {
                Err(Error::WalletUnreachable(s!("daemon down")))
            }
        }

        fn get_balance(&self, _account: &str) -> Result<Money, Error> {
            let mut state = self.0.lock().unwrap();
            let index = state.balance_calls.min(state.balances.len() - 1);
            state.balance_calls += 1;
            Ok(state.balances[index])
        }

        fn send_many(
            &self,
            account: &str,
            recipients: &BTreeMap<String, Money>,
        ) -> Result<(String, Value), Error> {
            let mut state = self.0.lock().unwrap();
            state.sends.push((account.to_owned(), recipients.clone()));
            if let Some(kind) = state.send_error {
                return Err(Error::wallet(kind, "mock send failure"));
            }
            Ok((state.send_txid.clone(), json!({})))
        }

        fn get_transaction(&self, txid: &str) -> Result<WalletTransaction, Error> {
            self.0
                .lock()
                .unwrap()
                .transactions
                .get(txid)
                .cloned()
                .ok_or_else(|| {
                    Error::wallet(WalletErrorKind::NotFound, format!("no such tx {}", txid))
                })
        }
    }

    fn manager(sc: &MockSc, wallet: &MockWallet) -> PayoutManager {
        PayoutManager::new(
            CurrencySettings {
                currency_code: s!("LTC"),
                valid_address_versions: vec![48],
                account: s!("pool"),
                min_confirms: 12,
                minimum_tx_output: "0.01".parse().unwrap(),
            },
            PayoutStore::in_memory().unwrap(),
            Box::new(sc.clone()),
            Box::new(wallet.clone()),
        )
    }

    fn addr(seed: u8) -> String {
        encode_with_version(48, &[seed; 20])
    }

    fn seed_pulled(m: &PayoutManager, pid: &str, address: &str, amount: &str) {
        m.store
            .with_exclusive(|conn| {
                store::insert_payout(
                    conn,
                    &NewPayout {
                        pid,
                        user: "u",
                        address,
                        amount: amount.parse().unwrap(),
                        currency_code: "LTC",
                        pull_time: Utc::now().naive_utc(),
                    },
                )
            })
            .unwrap();
    }

    fn rows(m: &PayoutManager) -> Vec<Payout> {
        m.store
            .with_exclusive(|conn| {
                use crate::schema::payouts::dsl::*;
                use diesel::prelude::*;
                payouts.order(id.asc()).load::<Payout>(conn).map_err(|e| e.into())
            })
            .unwrap()
    }

    #[test]
    fn happy_pull_is_idempotent() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        sc.0.lock().unwrap().payouts_response = json!({
            "pids": [
                ["u1", addr(1), "0.50000000", "p1"],
                ["u2", addr(2), "0.10000000", "p2"],
            ]
        });
        let m = manager(&sc, &wallet);

        let stats = m.pull_payouts(false).unwrap();
        assert_eq!(stats, PullStats { new: 2, repeat: 0, invalid: 0 });
        let stored = rows(&m);
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|p| p.state() == PayoutState::Pulled));
        assert_eq!(stored[0].amount, "0.5".parse().unwrap());

        let again = m.pull_payouts(false).unwrap();
        assert_eq!(again, PullStats { new: 0, repeat: 2, invalid: 0 });
        assert_eq!(rows(&m).len(), 2);
    }

    #[test]
    fn pull_rejects_invalid_entries() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        sc.0.lock().unwrap().payouts_response = json!({
            "pids": [
                // Version 0 address, but only version 48 is valid.
                ["u1", "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", "1.0", "p3"],
                ["u2", addr(1), "0.123456789", "p4"],
                ["u3", addr(2), "-0.5", "p5"],
                ["u4", addr(3)],
            ]
        });
        let m = manager(&sc, &wallet);
        let stats = m.pull_payouts(false).unwrap();
        assert_eq!(stats, PullStats { new: 0, repeat: 0, invalid: 4 });
        assert!(rows(&m).is_empty());
    }

    #[test]
    fn pull_survives_unreachable_coordinator() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        sc.0.lock().unwrap().unreachable = true;
        let m = manager(&sc, &wallet);
        assert_eq!(m.pull_payouts(false).unwrap(), PullStats::default());
        assert!(rows(&m).is_empty());
    }

    #[test]
    fn simulated_pull_writes_nothing() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        sc.0.lock().unwrap().payouts_response = json!({
            "pids": [["u1", addr(1), "0.5", "p1"]]
        });
        let m = manager(&sc, &wallet);
        let stats = m.pull_payouts(true).unwrap();
        assert_eq!(stats, PullStats { new: 1, repeat: 0, invalid: 0 });
        assert!(rows(&m).is_empty());
    }

    #[test]
    fn send_aggregates_by_address() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        wallet.0.lock().unwrap().balances = vec!["1.0".parse().unwrap()];
        let m = manager(&sc, &wallet);
        let shared = addr(1);
        seed_pulled(&m, "p1", &shared, "0.3");
        seed_pulled(&m, "p2", &shared, "0.4");

        match m.send_payout(false).unwrap() {
            SendOutcome::Paid {
                coin_txid,
                finalized,
                ..
            } => {
                assert_eq!(coin_txid, "txH");
                assert_eq!(finalized.len(), 2);
            }
            other => panic!("expected Paid, got {:?}", other),
        }

        let sends = wallet.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, "pool");
        assert_eq!(sends[0].1.len(), 1);
        assert_eq!(sends[0].1[&shared], "0.7".parse().unwrap());

        for payout in rows(&m) {
            assert_eq!(payout.state(), PayoutState::Paid);
            assert_eq!(payout.txid.as_deref(), Some("txH"));
            assert!(payout.paid_time.is_some());
        }
    }

    #[test]
    fn dust_addresses_return_to_pulled() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        wallet.0.lock().unwrap().balances = vec!["1.0".parse().unwrap()];
        let m = manager(&sc, &wallet);
        let dusty = addr(1);
        let payable = addr(2);
        seed_pulled(&m, "p1", &dusty, "0.001");
        seed_pulled(&m, "p2", &payable, "0.5");

        match m.send_payout(false).unwrap() {
            SendOutcome::Paid { finalized, .. } => assert_eq!(finalized.len(), 1),
            other => panic!("expected Paid, got {:?}", other),
        }

        let sends = wallet.sends();
        assert_eq!(sends[0].1.len(), 1);
        assert_eq!(sends[0].1[&payable], "0.5".parse().unwrap());

        let stored = rows(&m);
        let dust_row = stored.iter().find(|p| p.address == dusty).unwrap();
        assert_eq!(dust_row.state(), PayoutState::Pulled);
        let paid_row = stored.iter().find(|p| p.address == payable).unwrap();
        assert_eq!(paid_row.state(), PayoutState::Paid);
    }

    #[test]
    fn wallet_error_with_unchanged_balance_unlocks() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        {
            let mut state = wallet.0.lock().unwrap();
            state.balances = vec!["1.0".parse().unwrap(), "1.0".parse().unwrap()];
            state.send_error = Some(WalletErrorKind::Transient);
        }
        let m = manager(&sc, &wallet);
        seed_pulled(&m, "p1", &addr(1), "0.5");

        match m.send_payout(false) {
            Err(Error::Wallet { kind, .. }) => assert_eq!(kind, WalletErrorKind::Transient),
            other => panic!("expected wallet error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(wallet.sends().len(), 1);
        for payout in rows(&m) {
            assert_eq!(payout.state(), PayoutState::Pulled);
        }
    }

    #[test]
    fn wallet_error_with_changed_balance_stays_locked() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        {
            let mut state = wallet.0.lock().unwrap();
            state.balances = vec!["1.0".parse().unwrap(), "0.4".parse().unwrap()];
            state.send_error = Some(WalletErrorKind::Unknown);
        }
        let m = manager(&sc, &wallet);
        seed_pulled(&m, "p1", &addr(1), "0.5");

        match m.send_payout(false) {
            Err(Error::WalletIndeterminate(_)) => {}
            other => panic!("expected WalletIndeterminate, got {:?}", other.map(|_| ())),
        }
        for payout in rows(&m) {
            assert_eq!(payout.state(), PayoutState::Locked);
            assert!(payout.lock_time.is_some());
        }

        // The operator repair path is the only exit.
        assert_eq!(m.reset_all_locked(false).unwrap(), 1);
        for payout in rows(&m) {
            assert_eq!(payout.state(), PayoutState::Pulled);
        }
    }

    #[test]
    fn insufficient_balance_rolls_back_locks() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        wallet.0.lock().unwrap().balances = vec!["0.1".parse().unwrap()];
        let m = manager(&sc, &wallet);
        seed_pulled(&m, "p1", &addr(1), "0.7");

        match m.send_payout(false) {
            Err(Error::FundsInsufficient { .. }) => {}
            other => panic!("expected FundsInsufficient, got {:?}", other.map(|_| ())),
        }
        assert!(wallet.sends().is_empty());
        for payout in rows(&m) {
            assert_eq!(payout.state(), PayoutState::Pulled);
        }
    }

    #[test]
    fn simulated_send_is_side_effect_free() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        wallet.0.lock().unwrap().balances = vec!["1.0".parse().unwrap()];
        let m = manager(&sc, &wallet);
        seed_pulled(&m, "p1", &addr(1), "0.5");

        match m.send_payout(true).unwrap() {
            SendOutcome::Preview { recipients, dropped } => {
                assert_eq!(recipients.len(), 1);
                assert!(dropped.is_empty());
            }
            other => panic!("expected Preview, got {:?}", other),
        }
        assert!(wallet.sends().is_empty());
        assert!(sc.posts().is_empty());
        for payout in rows(&m) {
            assert_eq!(payout.state(), PayoutState::Pulled);
        }
    }

    #[test]
    fn send_with_no_rows_is_a_noop() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        let m = manager(&sc, &wallet);
        match m.send_payout(false).unwrap() {
            SendOutcome::NothingToDo => {}
            other => panic!("expected NothingToDo, got {:?}", other),
        }
    }

    #[test]
    fn unreachable_wallet_blocks_send() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        wallet.0.lock().unwrap().reachable = false;
        let m = manager(&sc, &wallet);
        seed_pulled(&m, "p1", &addr(1), "0.5");
        match m.send_payout(false) {
            Err(Error::WalletUnreachable(_)) => {}
            other => panic!("expected WalletUnreachable, got {:?}", other.map(|_| ())),
        }
        for payout in rows(&m) {
            assert_eq!(payout.state(), PayoutState::Pulled);
        }
    }

    fn paid_fixture() -> (MockSc, MockWallet, PayoutManager) {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        wallet.0.lock().unwrap().balances = vec!["1.0".parse().unwrap()];
        let m = manager(&sc, &wallet);
        seed_pulled(&m, "p1", &addr(1), "0.3");
        seed_pulled(&m, "p2", &addr(1), "0.4");
        match m.send_payout(false).unwrap() {
            SendOutcome::Paid { .. } => {}
            other => panic!("fixture send failed: {:?}", other),
        }
        (sc, wallet, m)
    }

    #[test]
    fn associate_all_reports_fees_and_marks_rows() {
        let (sc, wallet, m) = paid_fixture();
        sc.0.lock().unwrap().associate_result = true;
        wallet.0.lock().unwrap().transactions.insert(
            s!("txH"),
            WalletTransaction {
                confirmations: 1,
                fee: Some("-0.0001".parse().unwrap()),
            },
        );

        m.associate_all(false).unwrap();

        let posts = sc.posts();
        let (path, payload) = posts.last().unwrap();
        assert_eq!(path, "associate_payouts");
        assert_eq!(payload["coin_txid"], "txH");
        assert_eq!(payload["currency"], "LTC");
        assert_eq!(payload["pids"].as_array().unwrap().len(), 2);
        // Fees go up as a positive exact decimal.
        assert_eq!(payload["tx_fee"].to_string(), "0.00010000");

        for payout in rows(&m) {
            assert_eq!(payout.state(), PayoutState::Associated);
            assert!(payout.assoc_time.is_some());
        }
    }

    #[test]
    fn associate_leaves_rows_for_retry_on_rejection() {
        let (sc, wallet, m) = paid_fixture();
        sc.0.lock().unwrap().associate_result = false;
        wallet.0.lock().unwrap().transactions.insert(
            s!("txH"),
            WalletTransaction { confirmations: 1, fee: None },
        );

        m.associate_all(false).unwrap();
        for payout in rows(&m) {
            assert_eq!(payout.state(), PayoutState::Paid);
        }
    }

    #[test]
    fn associate_skips_buckets_with_unknown_fees() {
        let (sc, _wallet, m) = paid_fixture();
        sc.0.lock().unwrap().associate_result = true;
        // txH is not in the mock wallet, so the fee lookup fails.
        m.associate_all(false).unwrap();
        assert!(sc
            .posts()
            .iter()
            .all(|(path, _)| path != "associate_payouts"));
        for payout in rows(&m) {
            assert_eq!(payout.state(), PayoutState::Paid);
        }
    }

    #[test]
    fn simulated_associate_posts_nothing() {
        let (sc, wallet, m) = paid_fixture();
        wallet.0.lock().unwrap().transactions.insert(
            s!("txH"),
            WalletTransaction { confirmations: 1, fee: None },
        );
        m.associate_all(true).unwrap();
        assert!(sc
            .posts()
            .iter()
            .all(|(path, _)| path != "associate_payouts"));
        for payout in rows(&m) {
            assert_eq!(payout.state(), PayoutState::Paid);
        }
    }

    #[test]
    fn confirm_reports_only_deep_transactions() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        {
            let mut state = sc.0.lock().unwrap();
            state.transactions_response = json!({
                "success": true,
                "objects": [
                    { "txid": "txA" },
                    { "txid": "txB" },
                    { "txid": "txGone" },
                ]
            });
        }
        {
            let mut state = wallet.0.lock().unwrap();
            state.transactions.insert(
                s!("txA"),
                WalletTransaction { confirmations: 13, fee: None },
            );
            state.transactions.insert(
                s!("txB"),
                WalletTransaction { confirmations: 3, fee: None },
            );
        }
        let m = manager(&sc, &wallet);

        assert_eq!(m.confirm_trans(false).unwrap(), 1);
        let posts = sc.posts();
        let (path, payload) = posts.last().unwrap();
        assert_eq!(path, "confirm_transactions");
        assert_eq!(payload["tids"], json!(["txA"]));
    }

    #[test]
    fn simulated_confirm_posts_nothing() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        sc.0.lock().unwrap().transactions_response = json!({
            "success": true,
            "objects": [{ "txid": "txA" }]
        });
        wallet.0.lock().unwrap().transactions.insert(
            s!("txA"),
            WalletTransaction { confirmations: 100, fee: None },
        );
        let m = manager(&sc, &wallet);
        assert_eq!(m.confirm_trans(true).unwrap(), 1);
        assert!(sc.posts().is_empty());
    }

    #[test]
    fn local_association_recovers_locked_rows() {
        let sc = MockSc::default();
        let wallet = MockWallet::default();
        {
            let mut state = wallet.0.lock().unwrap();
            state.balances = vec!["1.0".parse().unwrap(), "0.4".parse().unwrap()];
            state.send_error = Some(WalletErrorKind::Unknown);
        }
        let m = manager(&sc, &wallet);
        seed_pulled(&m, "p1", &addr(1), "0.5");
        assert!(m.send_payout(false).is_err());
        assert_eq!(rows(&m)[0].state(), PayoutState::Locked);

        assert_eq!(m.local_associate_all_locked("txZ", false).unwrap(), 1);
        let stored = rows(&m);
        assert_eq!(stored[0].state(), PayoutState::Paid);
        assert_eq!(stored[0].txid.as_deref(), Some("txZ"));
    }
}
