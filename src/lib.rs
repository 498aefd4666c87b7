//! # Karakuri
//!
//! A test harness for effect-driven sagas on Tokio.
//!
//! Karakuri runs a saga against a simulated store, intercepts every effect
//! the saga yields through a monitoring interface, and lets tests assert on
//! the set of witnessed effects once the saga and all of the asynchronous
//! work it spawned have settled. Expectations match on deep equality and are
//! order-independent within a kind; the saga under test is real async code,
//! not a hand-stepped iterator.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use karakuri::*;
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result {
//!     let mut test = SagaTester::new(|ctx| async move {
//!         ctx.take("INCREMENT").await?;
//!         ctx.put(Action::of("INCREMENTED")).await?;
//!         Ok(Value::Null)
//!     });
//!
//!     test.with_state(json!({ "count": 0 }))
//!         .dispatch(Action::of("INCREMENT"))
//!         .expect_take("INCREMENT")
//!         .expect_put(Action::of("INCREMENTED"));
//!
//!     test.run().await
//! }
//! ```
//!
//! ## Core Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SagaTester`] | Configures, runs, and checks a saga under test |
//! | [`SagaContext`] | Handed to the saga; the source of every effect |
//! | [`Action`] | A dispatched message: a kind string plus a JSON payload |
//! | [`Pattern`] | Matches actions by kind for waits and channels |
//! | [`Effect`] | Pure-data descriptor of one yielded effect |
//! | [`EffectKind`] | The closed classification effects are bucketed under |
//! | [`SimStore`] | Simulated store: state, reducer, dispatch, subscriptions |
//! | [`TaskHandle`] | Handle to a forked saga: cancellation and completion |
//! | [`ActionChannel`] | Buffers matching actions for explicit consumption |
//! | [`SagaMonitor`] | Observation seam the harness records through |
//!
//! ## Settling
//!
//! [`SagaTester::run`] does not just await the main saga. It repeatedly
//! gathers every completion source discovered so far (the main task, forked
//! tasks, external promises), awaits them all, and starts over whenever new
//! work appeared mid-wait. Only a quiescent pass counts as settled. The loop
//! races a timeout (250ms by default, tunable via [`RunOptions`]); on
//! expiry the main task is cancelled and the run fails with
//! [`Error::Timeout`].

mod action;
mod channel;
mod context;
mod effect;
mod effect_id;
mod engine;
mod error;
mod expectation;
mod harness;
mod monitor;
mod multiset;
mod store;
mod task;

pub use action::{Action, Pattern};
pub use channel::{ActionChannel, ChannelId};
pub use context::{CpsDone, RaceArm, Saga, SagaContext};
pub use effect::{Effect, EffectKind};
pub use effect_id::EffectId;
pub use error::Error;
pub use harness::{RunOptions, SagaTester};
pub use monitor::{EffectOutcome, SagaMonitor};
pub use multiset::EffectBag;
pub use store::{Reducer, SimStore, SubscriptionId};
pub use task::TaskHandle;

/// Convenience alias for `Result<T, karakuri::Error>`.
pub type Result<T = ()> = std::result::Result<T, Error>;
