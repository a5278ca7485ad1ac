//! Battle Core
//!
//! Peer-to-peer skill battles: users pay an entry fee, matchmaking draws a
//! verifiable winner from a committed seed, and the payout processor credits
//! the winner exactly once while booking the platform's cut.

pub mod audit;
pub mod batch;
pub mod book;
pub mod config;
pub mod error;
pub mod flight;
pub mod ledger;
pub mod matchmaking;
pub mod models;
pub mod payout;
pub mod scheduler;
pub mod seed;
pub mod service;
pub mod split;

#[cfg(test)]
mod test_support;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use service::{BattleService, OpOutcome};
