//! # freshet-core
//!
//! Push-based, backpressured stream operators with queue fusion.
//!
//! This crate is the protocol core of a reactive-streams library: the
//! subscription state machines, backpressure arithmetic, the serialized
//! work-in-progress drain loop, the queue-fusion side channel, and the
//! multicast/connectable machinery, together with a representative
//! operator catalog built on them.
//!
//! ## Design principles
//!
//! 1. **Lock-free hot paths** - demand counters, value slots, and drain
//!    serialization are single atomic operations
//! 2. **Serialized delivery** - a subscriber observes a strictly ordered
//!    signal stream no matter how many threads produce
//! 3. **Demand is law** - `on_next` never outruns `request` unless the
//!    unbounded sentinel was requested
//! 4. **Nothing is lost silently** - signals with nowhere to go land in
//!    the process-wide unsignalled sink
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use freshet_core::operator::{range, FilterStage, TakeStage};
//! use freshet_core::testing::TestSubscriber;
//! use freshet_core::Stage;
//!
//! let evens = Arc::new(FilterStage::new(Arc::new(range(1, 100)), |v| Ok(v % 2 == 0)));
//! let first_three = TakeStage::new(evens, 3);
//!
//! let subscriber = TestSubscriber::new();
//! first_three.subscribe(subscriber.downstream());
//! subscriber.assert_values(&[2, 4, 6]).assert_complete();
//! ```
//!
//! ## Signal flow
//!
//! ```text
//!   Stage::subscribe(downstream)
//!        │
//!        ▼
//!   on_subscribe(handle) ──► request(n) ──► on_next(v)* ──► on_complete
//!                                 ▲                            or on_error
//!                                 └── cancel() at any point
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Unsafe is confined to the queue and slot primitives.
#![allow(unsafe_code)]

pub mod demand;
pub mod error;
pub mod hooks;
pub mod operator;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod slot;
pub mod stream;
pub mod testing;
pub mod upstream;

pub use error::StreamError;
pub use stream::{
    ConditionalSubscriber, Downstream, FusedSubscription, FusionMode, Stage, Subscriber,
    Subscription, SubscriptionHandle,
};
