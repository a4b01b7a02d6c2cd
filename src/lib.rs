//! Concurrent load driver for line-delimited JSON poker servers.
//!
//! A fleet of [`session::PlayerSession`]s is run by [`harness::run_fleet`]
//! under a fixed admission bound, each one registering, joining a game and
//! playing all-in-then-fold. [`flood::run_flood`] is the duration-bounded
//! variant that hammers one HTTP endpoint with stateless requests.

pub mod config;
pub mod counters;
pub mod flood;
pub mod harness;
pub mod protocol;
pub mod session;
pub mod transport;
