//! Bot container lifecycle reconciliation.
//!
//! The control plane keeps persisted bot status in agreement with the
//! container runtime: [`events::EventConsumer`] follows the runtime's event
//! feed, [`watchdog::StartupWatchdog`] decides when a starting bot is ready,
//! [`health::HealthProber`] probes running bots and clears wedged starts, and
//! [`reconcile::Reconciler`] repairs drift and finds orphaned resources.

pub mod config;
pub mod events;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod monitor;
pub mod notify;
pub mod probe;
pub mod proxy;
pub mod reconcile;
pub mod store;
pub mod supervisor;
mod support;
pub mod watchdog;

#[cfg(test)]
mod testkit;

pub use support::format_error_chain;
