//! Minimal JSON-RPC envelope for the coin daemon dialog.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub static JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Serialize, Clone)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
    pub id: u64,
}

impl Request {
    pub fn new(method: &str, params: Value) -> Self {
        Request {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_owned(),
            params,
            id: 1,
        }
    }
}

/// Error member of a response. The daemon's codes matter: they distinguish
/// "no such transaction" from "out of funds" from everything else.
#[derive(Debug, Deserialize)]
pub struct ErrorData {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for ErrorData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}) {}", self.code, self.message)
    }
}

#[derive(Debug, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<ErrorData>,
    #[serde(default)]
    pub id: Value,
}

impl Response {
    pub fn into_result(self) -> Result<Value, ErrorData> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}
