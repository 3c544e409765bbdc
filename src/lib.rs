#[macro_use]
mod macros;

pub mod address;
pub mod config;
pub mod errors;
pub mod jsonrpc;
pub mod models;
pub mod payout;
#[allow(unused_imports)]
pub mod schema;
pub mod scheduler;
pub mod signer;
pub mod store;
pub mod table;
pub mod trade;
pub mod transport;
pub mod wallet;

#[macro_use]
extern crate diesel;
