use crate::models::Money;
use failure::Fail;
use strum_macros::Display;

/// How a wallet RPC call went wrong. `send_many` is not idempotent, so the
/// caller must know whether retrying is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum WalletErrorKind {
    InsufficientFunds,
    NotFound,
    Transient,
    Unknown,
}

#[derive(Fail, Debug)]
pub enum Error {
    #[fail(display = "coordinator unreachable: {}", _0)]
    Unreachable(String),

    #[fail(display = "transport error: {}", _0)]
    Transport(String),

    #[fail(display = "invalid response signature: {}", _0)]
    SignatureInvalid(String),

    #[fail(display = "protocol error: {}", _0)]
    Protocol(String),

    #[fail(display = "malformed data: {}", _0)]
    Malformed(String),

    #[fail(display = "DB error: {}", _0)]
    Db(String),

    #[fail(display = "record already exists: {}", _0)]
    AlreadyExists(String),

    #[fail(display = "invalid address: {}", _0)]
    InvalidAddress(String),

    #[fail(display = "invalid amount: {}", _0)]
    InvalidAmount(String),

    #[fail(display = "configuration error: {}", _0)]
    Config(String),

    #[fail(display = "wallet unreachable: {}", _0)]
    WalletUnreachable(String),

    #[fail(display = "wallet error ({}): {}", kind, message)]
    Wallet {
        kind: WalletErrorKind,
        message: String,
    },

    #[fail(
        display = "insufficient funds: balance {}, required {}",
        available, required
    )]
    FundsInsufficient { available: Money, required: Money },

    #[fail(display = "indeterminate wallet outcome, operator required: {}", _0)]
    WalletIndeterminate(String),

    #[fail(display = "invariant violated: {}", _0)]
    Invariant(String),
}

impl Error {
    pub fn wallet(kind: WalletErrorKind, message: impl Into<String>) -> Self {
        Error::Wallet {
            kind,
            message: message.into(),
        }
    }
}

impl From<diesel::result::Error> for Error {
    fn from(error: diesel::result::Error) -> Self {
        match error {
            diesel::result::Error::DatabaseError(kind, _) => match kind {
                diesel::result::DatabaseErrorKind::UniqueViolation => {
                    Error::AlreadyExists(s!(error))
                }
                _ => Error::Db(format!("{:?}", error)),
            },
            _ => Error::Db(format!("{:?}", error)),
        }
    }
}

impl From<diesel::r2d2::Error> for Error {
    fn from(error: diesel::r2d2::Error) -> Self {
        Error::Db(s!(error))
    }
}

impl From<diesel::r2d2::PoolError> for Error {
    fn from(error: diesel::r2d2::PoolError) -> Self {
        Error::Db(s!(error))
    }
}

impl From<serde_json::error::Error> for Error {
    fn from(error: serde_json::error::Error) -> Self {
        Error::Malformed(s!(error))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::Config(s!(error))
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_timeout() {
            Error::Unreachable(s!(error))
        } else {
            Error::Transport(s!(error))
        }
    }
}
