pub mod config;
pub mod extract;
pub mod ledger;
pub mod normalize;
pub mod remote;
pub mod retry;
pub mod runtime;
pub mod upload;
