//! Starpot lottery - a shared multi-client lottery round
//!
//! Any number of independent clients join a single round by paying a fixed
//! entry fee into a common pot, one client draws a uniformly random winner,
//! and any client resets the round to start a fresh generation. There is no
//! server-side logic and no lock shared between clients: every guarantee
//! rests on the atomic primitives of the [`starpot_core::DocumentStore`].
//!
//! - [`JoinCoordinator`] admits an identity at most once per generation.
//! - [`DrawCoordinator`] elects exactly one winner per generation.
//! - [`ResetCoordinator`] advances the round to an empty generation.
//! - [`reconciler`] keeps a live, authoritative [`RoundView`] per client.
//! - [`LotteryClient`] binds an identity and a store to all of the above.

pub mod client;
pub mod config;
pub mod draw;
pub mod error;
pub mod join;
pub mod reconciler;
pub mod reset;
pub mod rng;
pub mod round;

pub use client::LotteryClient;
pub use config::{LotteryConfig, RetryPolicy, DEFAULT_APP_ID, DEFAULT_ENTRY_FEE, DEFAULT_ROUND_KEY};
pub use draw::{DrawCoordinator, DrawOutcome};
pub use error::{LotteryError, Result};
pub use join::{JoinCoordinator, JoinOutcome};
pub use reconciler::{Connectivity, Consistency, ReconcilerHandle, RoundView};
pub use reset::{ResetCoordinator, ResetOutcome};
pub use rng::{RandomSource, ScriptedRandom, SeededRandom, ThreadRandom};
pub use round::{Participant, Round, RoundRef, RoundState};
