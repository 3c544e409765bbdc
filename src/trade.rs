use crate::config::ScRpcClientConfig;
use crate::errors::Error;
use crate::table;
use crate::transport::{ScRpc, ScTransport};
use bigdecimal::rounding::RoundingMode;
use bigdecimal::BigDecimal;
use log::{info, warn};
use serde_json::{json, Map, Value};
use std::io::{self, BufRead, Write};
use strum_macros::{Display, EnumString};

/// Coordinator-side status code for a completed trade request.
pub const STATUS_COMPLETE: i64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TradeKind {
    Buy,
    Sell,
}

/// An open buy/sell intent reported by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRequest {
    pub tr_id: i64,
    pub currency: String,
    pub quantity: BigDecimal,
    pub kind: TradeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeUpdate {
    pub tr_id: i64,
    pub status: i64,
    pub quantity: BigDecimal,
    pub fees: BigDecimal,
}

#[derive(Debug)]
pub struct ClosePlan {
    pub updates: Vec<TradeUpdate>,
    pub total_quantity: BigDecimal,
    pub avg_price: BigDecimal,
}

fn parse_trade_entry(entry: &Value) -> Result<TradeRequest, Error> {
    let fields = entry
        .as_array()
        .filter(|f| f.len() == 4)
        .ok_or_else(|| Error::Malformed(s!("trade request is not a 4-tuple")))?;
    let tr_id = fields[0]
        .as_i64()
        .ok_or_else(|| Error::Malformed(s!("tr_id is not an integer")))?;
    let currency = fields[1]
        .as_str()
        .ok_or_else(|| Error::Malformed(s!("currency is not a string")))?;
    let quantity = match &fields[2] {
        Value::Number(number) => number
            .to_string()
            .parse::<BigDecimal>()
            .map_err(|_| Error::Malformed(format!("unparseable quantity {}", number)))?,
        other => return Err(Error::Malformed(format!("quantity is not a number: {}", other))),
    };
    let kind = fields[3]
        .as_str()
        .and_then(|k| k.parse::<TradeKind>().ok())
        .ok_or_else(|| Error::Malformed(format!("bad trade type {}", fields[3])))?;
    Ok(TradeRequest {
        tr_id,
        currency: currency.to_owned(),
        quantity,
        kind,
    })
}

/// Validate the whole `get_trade_requests` response. One malformed entry
/// rejects the batch; a half-parsed trade listing is worse than none.
pub fn parse_trade_requests(response: &Value) -> Result<Vec<TradeRequest>, Error> {
    response
        .get("trs")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Malformed(s!("get_trade_requests response missing trs")))?
        .iter()
        .map(parse_trade_entry)
        .collect()
}

/// Split an executed BTC fill pro-rata over the matching open requests.
/// All arithmetic is exact decimal; results are rounded to 8 digits only at
/// the very end.
pub fn plan_close(
    requests: &[TradeRequest],
    kind: TradeKind,
    currency: &str,
    btc_quantity: &BigDecimal,
    btc_fees: &BigDecimal,
    start_tr_id: Option<i64>,
    stop_tr_id: Option<i64>,
) -> Result<ClosePlan, Error> {
    let selected: Vec<&TradeRequest> = requests
        .iter()
        .filter(|r| r.kind == kind && r.currency == currency)
        .filter(|r| start_tr_id.map_or(true, |start| r.tr_id >= start))
        .filter(|r| stop_tr_id.map_or(true, |stop| r.tr_id <= stop))
        .collect();
    if selected.is_empty() {
        return Err(Error::Invariant(format!(
            "no open {} requests match currency {}",
            kind, currency
        )));
    }
    let total_quantity = selected
        .iter()
        .fold(BigDecimal::from(0), |acc, r| acc + &r.quantity);
    if total_quantity == BigDecimal::from(0) {
        return Err(Error::InvalidAmount(s!("total request quantity is zero")));
    }

    let avg_price = btc_quantity / &total_quantity;
    let mut updates = Vec::with_capacity(selected.len());
    for request in selected {
        let share = &request.quantity / &total_quantity;
        let quantity = (&share * btc_quantity).with_scale_round(8, RoundingMode::HalfUp);
        let fees = (&share * btc_fees).with_scale_round(8, RoundingMode::HalfUp);
        updates.push(TradeUpdate {
            tr_id: request.tr_id,
            status: STATUS_COMPLETE,
            quantity,
            fees,
        });
    }
    Ok(ClosePlan {
        updates,
        total_quantity,
        avg_price,
    })
}

fn print_requests(title: &str, requests: &[TradeRequest]) {
    let rows = requests
        .iter()
        .map(|r| {
            vec![
                s!(r.tr_id),
                r.currency.clone(),
                s!(r.quantity),
                s!(r.kind),
            ]
        })
        .collect();
    table::print_grid(title, &["tr_id", "currency", "quantity", "type"], rows);
}

fn print_updates(updates: &[TradeUpdate]) {
    let rows = updates
        .iter()
        .map(|u| {
            vec![
                s!(u.tr_id),
                s!(u.status),
                s!(u.quantity),
                s!(u.fees),
            ]
        })
        .collect();
    table::print_grid(
        "Trade request updates to post",
        &["tr_id", "status", "quantity", "fees"],
        rows,
    );
}

fn stdin_confirm(prompt: &str) -> bool {
    print!("{} [y/n] ", prompt);
    let _ = io::stdout().flush();
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        return false;
    }
    line.trim() == "y"
}

/// Reconciles the coordinator's open trade requests against executed
/// exchange fills. Owns only a transport; never touches the payout store.
pub struct TradeManager {
    sc_rpc: Box<dyn ScRpc>,
    confirm: Box<dyn Fn(&str) -> bool + Send>,
}

impl TradeManager {
    pub fn new(sc_rpc: Box<dyn ScRpc>) -> Self {
        TradeManager {
            sc_rpc,
            confirm: Box::new(stdin_confirm),
        }
    }

    pub fn from_config(client: &ScRpcClientConfig) -> Result<Self, Error> {
        let transport = ScTransport::new(&client.rpc_url, &client.rpc_signature, client.max_age)?;
        Ok(TradeManager::new(Box::new(transport)))
    }

    #[cfg(test)]
    fn with_confirm(sc_rpc: Box<dyn ScRpc>, answer: bool) -> Self {
        TradeManager {
            sc_rpc,
            confirm: Box::new(move |_| answer),
        }
    }

    /// Fetch, validate and display the open requests, split into
    /// (sells, buys).
    pub fn get_open_trade_requests(
        &self,
    ) -> Result<(Vec<TradeRequest>, Vec<TradeRequest>), Error> {
        let response = match self.sc_rpc.post("get_trade_requests", json!({})) {
            Ok(response) => response,
            Err(Error::Unreachable(e)) => {
                warn!("Unable to connect to SC: {}", e);
                return Ok((Vec::new(), Vec::new()));
            }
            Err(e) => return Err(e),
        };
        let requests = parse_trade_requests(&response).map_err(|e| {
            warn!(
                "Invalid TR format returned from RPC call get_trade_requests: {}",
                e
            );
            e
        })?;
        if requests.is_empty() {
            info!("No trade requests returned from SC...");
        }

        let (sells, buys): (Vec<_>, Vec<_>) = requests
            .into_iter()
            .partition(|r| r.kind == TradeKind::Sell);
        info!("Got {} sell requests from SC", sells.len());
        info!("Got {} buy requests from SC", buys.len());
        print_requests("Open sell requests", &sells);
        print_requests("Open buy requests", &buys);
        Ok((sells, buys))
    }

    /// Close a single request with known final quantity and fees.
    pub fn close_trade_request(
        &self,
        tr_id: i64,
        quantity: BigDecimal,
        total_fees: BigDecimal,
        simulate: bool,
    ) -> Result<bool, Error> {
        let update = TradeUpdate {
            tr_id,
            status: STATUS_COMPLETE,
            quantity,
            fees: total_fees,
        };
        self.post_updates(&[update], simulate)
    }

    /// Arbitrary status update for one request, gated on operator approval.
    pub fn update_trade_request(
        &self,
        tr_id: i64,
        quantity: BigDecimal,
        fees: BigDecimal,
        status: i64,
        simulate: bool,
    ) -> Result<bool, Error> {
        let update = TradeUpdate {
            tr_id,
            status,
            quantity,
            fees,
        };
        info!("{}", "#".repeat(40));
        info!("Preparing to post the following values to server:");
        print_updates(std::slice::from_ref(&update));
        if !(self.confirm)("Does this look correct?") {
            return Ok(false);
        }
        self.post_updates(&[update], simulate)
    }

    pub fn close_sell_requests(
        &self,
        currency: &str,
        btc_quantity: &BigDecimal,
        btc_fees: &BigDecimal,
        start_tr_id: Option<i64>,
        stop_tr_id: Option<i64>,
        simulate: bool,
    ) -> Result<bool, Error> {
        self.close_requests(
            TradeKind::Sell,
            currency,
            btc_quantity,
            btc_fees,
            start_tr_id,
            stop_tr_id,
            simulate,
        )
    }

    pub fn close_buy_requests(
        &self,
        currency: &str,
        btc_quantity: &BigDecimal,
        btc_fees: &BigDecimal,
        start_tr_id: Option<i64>,
        stop_tr_id: Option<i64>,
        simulate: bool,
    ) -> Result<bool, Error> {
        self.close_requests(
            TradeKind::Buy,
            currency,
            btc_quantity,
            btc_fees,
            start_tr_id,
            stop_tr_id,
            simulate,
        )
    }

    fn close_requests(
        &self,
        kind: TradeKind,
        currency: &str,
        btc_quantity: &BigDecimal,
        btc_fees: &BigDecimal,
        start_tr_id: Option<i64>,
        stop_tr_id: Option<i64>,
        simulate: bool,
    ) -> Result<bool, Error> {
        if simulate {
            info!("{} Simulation mode {}", "#".repeat(20), "#".repeat(20));
        }
        let (sells, buys) = self.get_open_trade_requests()?;
        let pool = match kind {
            TradeKind::Sell => sells,
            TradeKind::Buy => buys,
        };
        let plan = plan_close(
            &pool,
            kind,
            currency,
            btc_quantity,
            btc_fees,
            start_tr_id,
            stop_tr_id,
        )?;
        info!(
            "Computed average price of {} BTC for all {} requests",
            plan.avg_price, kind
        );
        for update in &plan.updates {
            info!(
                "TR #{}: {} BTC, {} BTC in fees",
                update.tr_id, update.quantity, update.fees
            );
        }
        print_updates(&plan.updates);

        if !(self.confirm)("Does this look correct?") {
            info!("Exiting");
            return Ok(false);
        }
        self.post_updates(&plan.updates, simulate)
    }

    fn post_updates(&self, updates: &[TradeUpdate], simulate: bool) -> Result<bool, Error> {
        if simulate {
            info!("Simulating - not posting to server!");
            return Ok(false);
        }
        let mut trs = Map::new();
        for update in updates {
            trs.insert(
                update.tr_id.to_string(),
                json!({
                    "status": update.status,
                    "quantity": update.quantity.to_string(),
                    "fees": update.fees.to_string(),
                }),
            );
        }
        let response = self
            .sc_rpc
            .post("update_trade_requests", json!({ "update": true, "trs": trs }))?;
        if response.get("success").is_some() {
            info!(
                "Successfully posted {} updated trade requests to SC!",
                updates.len()
            );
            Ok(true)
        } else {
            warn!(
                "Failed posting request updates! Got the following response: {}",
                response
            );
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};

    fn dec(text: &str) -> BigDecimal {
        BigDecimal::from_str(text).unwrap()
    }

    fn request(tr_id: i64, currency: &str, quantity: &str, kind: TradeKind) -> TradeRequest {
        TradeRequest {
            tr_id,
            currency: currency.to_owned(),
            quantity: dec(quantity),
            kind,
        }
    }

    #[test]
    fn parses_well_formed_requests() {
        let response = json!({
            "trs": [
                [1, "LTC", 1.5, "sell"],
                [2, "LTC", 0.5, "buy"],
            ]
        });
        let requests = parse_trade_requests(&response).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], request(1, "LTC", "1.5", TradeKind::Sell));
        assert_eq!(requests[1], request(2, "LTC", "0.5", TradeKind::Buy));
    }

    #[test]
    fn one_malformed_entry_rejects_the_batch() {
        for bad in [
            json!({"trs": [[1, "LTC", 1.5, "hodl"]]}),
            json!({"trs": [["x", "LTC", 1.5, "sell"]]}),
            json!({"trs": [[1, "LTC", "1.5", "sell"]]}),
            json!({"trs": [[1, "LTC", 1.5]]}),
            json!({"nope": true}),
        ] {
            match parse_trade_requests(&bad) {
                Err(Error::Malformed(_)) => {}
                other => panic!("expected Malformed for {}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn pro_rata_split_is_exact() {
        let requests = vec![
            request(1, "LTC", "1.5", TradeKind::Sell),
            request(2, "LTC", "0.5", TradeKind::Sell),
            request(3, "DOGE", "9.0", TradeKind::Sell),
            request(4, "LTC", "4.0", TradeKind::Buy),
        ];
        let plan = plan_close(
            &requests,
            TradeKind::Sell,
            "LTC",
            &dec("0.2"),
            &dec("0.002"),
            None,
            None,
        )
        .unwrap();

        assert_eq!(plan.total_quantity, dec("2.0"));
        assert_eq!(plan.avg_price, dec("0.1"));
        assert_eq!(plan.updates.len(), 2);
        assert_eq!(plan.updates[0].tr_id, 1);
        assert_eq!(s!(plan.updates[0].quantity), "0.15000000");
        assert_eq!(s!(plan.updates[0].fees), "0.00150000");
        assert_eq!(plan.updates[1].tr_id, 2);
        assert_eq!(s!(plan.updates[1].quantity), "0.05000000");
        assert_eq!(s!(plan.updates[1].fees), "0.00050000");
        assert!(plan.updates.iter().all(|u| u.status == STATUS_COMPLETE));
    }

    #[test]
    fn id_range_filters_apply() {
        let requests = vec![
            request(1, "LTC", "1.0", TradeKind::Sell),
            request(2, "LTC", "1.0", TradeKind::Sell),
            request(3, "LTC", "1.0", TradeKind::Sell),
        ];
        let plan = plan_close(
            &requests,
            TradeKind::Sell,
            "LTC",
            &dec("0.3"),
            &dec("0"),
            Some(2),
            Some(2),
        )
        .unwrap();
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].tr_id, 2);
        assert_eq!(s!(plan.updates[0].quantity), "0.30000000");
    }

    #[test]
    fn empty_selection_is_an_error() {
        let requests = vec![request(1, "LTC", "1.0", TradeKind::Sell)];
        assert!(plan_close(
            &requests,
            TradeKind::Sell,
            "DOGE",
            &dec("0.1"),
            &dec("0"),
            None,
            None,
        )
        .is_err());
        assert!(plan_close(
            &requests,
            TradeKind::Buy,
            "LTC",
            &dec("0.1"),
            &dec("0"),
            None,
            None,
        )
        .is_err());
    }

    #[derive(Default)]
    struct ScState {
        trade_response: Value,
        posts: Vec<(String, Value)>,
    }

    #[derive(Clone, Default)]
    struct MockSc(Arc<Mutex<ScState>>);

    impl ScRpc for MockSc {
        fn post(&self, path: &str, data: Value) -> Result<Value, Error> {
            let mut state = self.0.lock().unwrap();
            state.posts.push((path.to_owned(), data));
            match path {
                "get_trade_requests" => Ok(state.trade_response.clone()),
                "update_trade_requests" => Ok(json!({ "success": true })),
                other => Err(Error::Protocol(format!("unexpected post to {}", other))),
            }
        }

        fn get(&self, _path: &str) -> Result<Value, Error> {
            Ok(Value::Null)
        }
    }

    fn sell_fixture() -> MockSc {
        let sc = MockSc::default();
        sc.0.lock().unwrap().trade_response = json!({
            "trs": [
                [1, "LTC", 1.5, "sell"],
                [2, "LTC", 0.5, "sell"],
            ]
        });
        sc
    }

    #[test]
    fn confirmed_close_posts_the_batch() {
        let sc = sell_fixture();
        let manager = TradeManager::with_confirm(Box::new(sc.clone()), true);
        let posted = manager
            .close_sell_requests("LTC", &dec("0.2"), &dec("0.002"), None, None, false)
            .unwrap();
        assert!(posted);

        let posts = sc.0.lock().unwrap().posts.clone();
        let (path, payload) = posts.last().unwrap();
        assert_eq!(path, "update_trade_requests");
        assert_eq!(payload["update"], json!(true));
        assert_eq!(payload["trs"]["1"]["status"], json!(STATUS_COMPLETE));
        assert_eq!(payload["trs"]["1"]["quantity"], json!("0.15000000"));
        assert_eq!(payload["trs"]["2"]["fees"], json!("0.00050000"));
    }

    #[test]
    fn declined_confirmation_posts_nothing() {
        let sc = sell_fixture();
        let manager = TradeManager::with_confirm(Box::new(sc.clone()), false);
        let posted = manager
            .close_sell_requests("LTC", &dec("0.2"), &dec("0.002"), None, None, false)
            .unwrap();
        assert!(!posted);
        let posts = sc.0.lock().unwrap().posts.clone();
        assert!(posts.iter().all(|(path, _)| path != "update_trade_requests"));
    }

    #[test]
    fn simulation_never_posts() {
        let sc = sell_fixture();
        let manager = TradeManager::with_confirm(Box::new(sc.clone()), true);
        let posted = manager
            .close_sell_requests("LTC", &dec("0.2"), &dec("0.002"), None, None, true)
            .unwrap();
        assert!(!posted);
        let posts = sc.0.lock().unwrap().posts.clone();
        assert!(posts.iter().all(|(path, _)| path != "update_trade_requests"));
    }
}
