use crate::errors::Error;
use crate::schema::payouts;
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::NaiveDateTime;
use diesel::deserialize::{self, FromSql};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::BigInt;
use diesel::backend::Backend;
use diesel::sqlite::Sqlite;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

/// Atomic units per whole coin. Every supported currency settles with
/// 8 fractional digits.
pub const COIN_PRECISION: i64 = 100_000_000;

/// An exact coin quantity held as atomic units. All arithmetic is integer
/// arithmetic; decimal text appears only at the wire and config boundaries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, AsExpression, FromSqlRow,
)]
#[sql_type = "BigInt"]
pub struct Money(i64);

impl Money {
    pub fn zero() -> Self {
        Money(0)
    }

    pub fn from_atomic(atomic: i64) -> Self {
        Money(atomic)
    }

    pub fn atomic(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn abs(&self) -> Money {
        Money(self.0.saturating_abs())
    }

    /// Parse a JSON value carrying a coin amount. The coordinator sends
    /// amounts either as decimal strings or as JSON numbers; both must
    /// survive exactly.
    pub fn from_value(value: &Value) -> Result<Money, Error> {
        match value {
            Value::String(text) => text.parse(),
            Value::Number(number) => number.to_string().parse(),
            other => Err(Error::InvalidAmount(format!(
                "expected a decimal amount, got {}",
                other
            ))),
        }
    }

    /// Render as an exact JSON number for wallet and coordinator calls.
    pub fn to_json(&self) -> Value {
        serde_json::Number::from_str(&s!(self))
            .map(Value::Number)
            .unwrap_or_else(|_| Value::String(s!(self)))
    }
}

impl FromStr for Money {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let decimal = BigDecimal::from_str(text.trim())
            .map_err(|_| Error::InvalidAmount(format!("not a decimal: {:?}", text)))?;
        let scaled = decimal * BigDecimal::from(COIN_PRECISION);
        if !scaled.is_integer() {
            return Err(Error::InvalidAmount(format!(
                "more than 8 fractional digits: {}",
                text
            )));
        }
        scaled
            .to_i64()
            .map(Money)
            .ok_or_else(|| Error::InvalidAmount(format!("amount out of range: {}", text)))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        write!(
            f,
            "{}{}.{:08}",
            sign,
            magnitude / COIN_PRECISION as u64,
            magnitude % COIN_PRECISION as u64
        )
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, other: Money) -> Money {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, other: Money) {
        self.0 += other.0;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        Money(iter.map(|m| m.0).sum())
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        Money(iter.map(|m| m.0).sum())
    }
}

impl ToSql<BigInt, Sqlite> for Money {
    fn to_sql<W: std::io::Write>(&self, out: &mut Output<W, Sqlite>) -> serialize::Result {
        <i64 as ToSql<BigInt, Sqlite>>::to_sql(&self.0, out)
    }
}

impl FromSql<BigInt, Sqlite> for Money {
    fn from_sql(bytes: Option<&<Sqlite as Backend>::RawValue>) -> deserialize::Result<Self> {
        <i64 as FromSql<BigInt, Sqlite>>::from_sql(bytes).map(Money)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&s!(self))
    }
}

struct MoneyVisitor;

impl<'de> Visitor<'de> for MoneyVisitor {
    type Value = Money;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a decimal coin amount")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Money, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Money, E> {
        format!("{}", v).parse().map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Money, E> {
        v.to_string().parse().map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Money, E> {
        v.to_string().parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Money, D::Error> {
        deserializer.deserialize_any(MoneyVisitor)
    }
}

/// Derived lifecycle position of a payout row. Never stored; always computed
/// from `txid`/`locked`/`associated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutState {
    Pulled,
    Locked,
    Paid,
    Associated,
}

/// One obligation from the coordinator: pay `amount` of `currency_code` to
/// `address` on behalf of `user`. `pid` is the coordinator's identifier and
/// is unique for all time.
#[derive(Debug, Clone, PartialEq, Queryable, Identifiable)]
#[table_name = "payouts"]
pub struct Payout {
    pub id: i32,
    pub pid: String,
    pub user: String,
    pub address: String,
    pub amount: Money,
    pub currency_code: String,
    pub txid: Option<String>,
    pub locked: bool,
    pub associated: bool,
    pub lock_time: Option<NaiveDateTime>,
    pub paid_time: Option<NaiveDateTime>,
    pub assoc_time: Option<NaiveDateTime>,
    pub pull_time: NaiveDateTime,
}

impl Payout {
    pub fn state(&self) -> PayoutState {
        match (self.txid.is_some(), self.locked, self.associated) {
            (false, false, _) => PayoutState::Pulled,
            (false, true, _) => PayoutState::Locked,
            (true, _, false) => PayoutState::Paid,
            (true, _, true) => PayoutState::Associated,
        }
    }

    pub fn txid_display(&self) -> &str {
        self.txid.as_deref().unwrap_or("NULL")
    }
}

#[derive(Debug, Insertable)]
#[table_name = "payouts"]
pub struct NewPayout<'a> {
    pub pid: &'a str,
    pub user: &'a str,
    pub address: &'a str,
    pub amount: Money,
    pub currency_code: &'a str,
    pub pull_time: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exact_decimals() {
        assert_eq!("0.1".parse::<Money>().unwrap(), Money(10_000_000));
        assert_eq!("0.50000000".parse::<Money>().unwrap(), Money(50_000_000));
        assert_eq!("21000000".parse::<Money>().unwrap().atomic(), 21_000_000 * COIN_PRECISION);
        assert_eq!("0.00000001".parse::<Money>().unwrap(), Money(1));
    }

    #[test]
    fn rejects_sub_atomic_precision() {
        assert!("0.000000001".parse::<Money>().is_err());
        assert!("1.123456789".parse::<Money>().is_err());
        assert!("nonsense".parse::<Money>().is_err());
    }

    #[test]
    fn renders_with_eight_digits() {
        assert_eq!(s!(Money(10_000_000)), "0.10000000");
        assert_eq!(s!(Money(-123)), "-0.00000123");
        assert_eq!(s!(Money(150_000_000)), "1.50000000");
    }

    #[test]
    fn wire_round_trip_is_exact() {
        let m = "0.70000000".parse::<Money>().unwrap();
        assert_eq!(serde_json::to_string(&m.to_json()).unwrap(), "0.70000000");
        assert_eq!(Money::from_value(&m.to_json()).unwrap(), m);
        assert_eq!(
            Money::from_value(&Value::String(s!("0.3"))).unwrap(),
            Money(30_000_000)
        );
        assert!(Money::from_value(&Value::Bool(true)).is_err());
    }

    #[test]
    fn derived_state_follows_flags() {
        let mut p = Payout {
            id: 1,
            pid: s!("p1"),
            user: s!("u1"),
            address: s!("addr"),
            amount: Money(1),
            currency_code: s!("LTC"),
            txid: None,
            locked: false,
            associated: false,
            lock_time: None,
            paid_time: None,
            assoc_time: None,
            pull_time: chrono::Utc::now().naive_utc(),
        };
        assert_eq!(p.state(), PayoutState::Pulled);
        p.locked = true;
        assert_eq!(p.state(), PayoutState::Locked);
        p.locked = false;
        p.txid = Some(s!("tx"));
        assert_eq!(p.state(), PayoutState::Paid);
        p.associated = true;
        assert_eq!(p.state(), PayoutState::Associated);
    }
}
