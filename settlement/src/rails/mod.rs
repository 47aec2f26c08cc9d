//! Reference rail adapters
//!
//! - [`NativeRail`] - same-ledger transfer through a per-rail escrow account
//! - [`TokenRail`] - allow-listed assets, holds against spendable balance
//! - [`AttestedRail`] - relayed off-chain network with signed asynchronous confirmations

pub mod attested;
pub mod native;
pub mod token;

pub use attested::{AttestedRail, AttestedRailConfig, InMemoryGateway, Instruction, RailGateway};
pub use native::NativeRail;
pub use token::TokenRail;
