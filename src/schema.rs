table! {
    payouts (id) {
        id -> Integer,
        pid -> Text,
        user -> Text,
        address -> Text,
        amount -> BigInt,
        currency_code -> Text,
        txid -> Nullable<Text>,
        locked -> Bool,
        associated -> Bool,
        lock_time -> Nullable<Timestamp>,
        paid_time -> Nullable<Timestamp>,
        assoc_time -> Nullable<Timestamp>,
        pull_time -> Timestamp,
    }
}
