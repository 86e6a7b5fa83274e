//! Per-record encryption and key recovery for survey responses.
//!
//! Survey responses are encrypted field by field under a per-survey DEK. The
//! DEK is wrapped under a KEK derived from the owner's credential and, for
//! ORGANIZATION surveys, under an escrow KEK split across custodians. A lost
//! credential can be replaced through a reviewed, time-delayed recovery
//! request executed by the [`processor`].

pub mod actor;
pub mod audit;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dek;
pub mod error;
pub mod escrow;
pub mod events;
pub mod field;
pub mod processor;
pub mod recovery;
pub mod secret_store;
pub mod server;
pub mod survey;
pub mod telemetry;

#[cfg(test)]
mod testutil;
