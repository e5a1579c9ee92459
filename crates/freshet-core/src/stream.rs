//! Core stream protocol: stages, subscribers, subscriptions, fusion.
//!
//! A [`Stage`] is an immutable operator factory. Subscribing instantiates a
//! per-downstream subscription object; subscriptions form a chain from the
//! terminal consumer back to the source. Values and terminal signals travel
//! downstream (`on_next` / `on_error` / `on_complete`), demand travels
//! upstream (`request`), teardown travels upstream (`cancel`).
//!
//! ## Signal ordering
//!
//! For one subscription: `on_subscribe` happens before every other
//! downstream signal, at most one terminal signal is delivered, and no
//! `on_next` follows a terminal. `request` and `cancel` may arrive on any
//! thread at any time after `on_subscribe`.
//!
//! ## Capability dispatch
//!
//! Optional capabilities are expressed as tagged handles rather than
//! downcasts: a stage receives a [`Downstream`] (plain or conditional) and
//! hands its subscriber a [`SubscriptionHandle`] (plain or fused). Operators
//! `match` once at subscribe time and keep the strongly-typed handle.

use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::sync::Arc;

use crate::error::StreamError;

// ---------------------------------------------------------------------------
// FusionMode
// ---------------------------------------------------------------------------

/// Bit mask negotiated once per subscription via
/// [`FusedSubscription::request_fusion`].
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FusionMode(u8);

impl FusionMode {
    /// No fusion; use the push path.
    pub const NONE: Self = Self(0);

    /// The source is fully known; `poll` returning `None` is completion
    /// and no terminal push signals are used.
    pub const SYNC: Self = Self(1);

    /// `poll` drains a queue filled concurrently; terminal signals still
    /// arrive on the push path and the producer wakes the consumer to
    /// poll.
    pub const ASYNC: Self = Self(1 << 1);

    /// Either queue mode.
    pub const ANY: Self = Self(Self::SYNC.0 | Self::ASYNC.0);

    /// The fused pair must not cross a thread boundary; operators that run
    /// user callbacks on the producing thread deny Sync fusion when this
    /// bit is requested.
    pub const THREAD_BARRIER: Self = Self(1 << 2);

    /// Returns `true` when every bit of `other` is present in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` when no queue mode was granted.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 & Self::ANY.0 == 0
    }

    /// Removes the bits of `other` from `self`.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for FusionMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for FusionMode {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for FusionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "NONE");
        }
        let mut first = true;
        let mut emit = |f: &mut fmt::Formatter<'_>, name: &str| -> fmt::Result {
            if !first {
                write!(f, "|")?;
            }
            first = false;
            write!(f, "{name}")
        };
        if self.contains(Self::SYNC) {
            emit(f, "SYNC")?;
        }
        if self.contains(Self::ASYNC) {
            emit(f, "ASYNC")?;
        }
        if self.contains(Self::THREAD_BARRIER) {
            emit(f, "THREAD_BARRIER")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Protocol traits
// ---------------------------------------------------------------------------

/// An immutable stream stage: constructed once, subscribed many times.
///
/// Each subscription is independent unless the stage is a connectable
/// (see the multicast operator).
pub trait Stage<T>: Send + Sync {
    /// Instantiates a subscription for `downstream` and begins signalling.
    fn subscribe(&self, downstream: Downstream<T>);
}

/// Receiver of downstream signals.
pub trait Subscriber<T>: Send + Sync {
    /// Called exactly once, before any other signal, with the handle the
    /// subscriber uses to request and cancel.
    fn on_subscribe(&self, upstream: SubscriptionHandle<T>);

    /// Delivers one element. Never called after a terminal signal, and
    /// never beyond the cumulative requested amount unless demand is
    /// unbounded.
    fn on_next(&self, value: T);

    /// Terminal failure signal, delivered at most once, in lieu of
    /// completion.
    fn on_error(&self, error: StreamError);

    /// Terminal completion signal, delivered at most once.
    fn on_complete(&self);
}

/// A subscriber that can refuse an element without consuming demand.
///
/// Sources with native produced-element accounting use the returned flag:
/// a `false` return means the element did not count against demand, which
/// lets rejection-heavy chains (filters) avoid request amplification.
pub trait ConditionalSubscriber<T>: Subscriber<T> {
    /// Offers `value`; returns whether it was accepted.
    fn try_on_next(&self, value: T) -> bool;
}

/// Upstream-facing control surface of a subscription.
pub trait Subscription: Send + Sync {
    /// Adds `n` to the demand. `n` must be positive; a zero request is a
    /// protocol violation surfaced through `on_error`.
    fn request(&self, n: u64);

    /// Cancels the subscription. Idempotent, non-blocking, and never
    /// signals downstream; late in-flight values are routed to the
    /// unsignalled sink.
    fn cancel(&self);
}

/// A subscription that can elide the push path through a queue interface.
///
/// After `request_fusion` grants a mode, the downstream pulls elements via
/// [`poll`](Self::poll) from inside its own request handling or drain loop
/// instead of receiving `on_next` pushes.
pub trait FusedSubscription<T>: Subscription {
    /// Negotiates a fusion mode; called at most once, before any demand is
    /// signalled. Returns the granted mode.
    fn request_fusion(&self, requested: FusionMode) -> FusionMode;

    /// Pulls the next element.
    ///
    /// In Sync mode, `Ok(None)` means the stream is complete.
    ///
    /// # Errors
    ///
    /// A source failure discovered during the pull is returned here and
    /// must be treated by the caller as if it had arrived via `on_error`.
    fn poll(&self) -> Result<Option<T>, StreamError>;

    /// Returns `true` when no element is currently pollable.
    fn is_empty(&self) -> bool;

    /// Returns the number of elements currently pollable.
    fn len(&self) -> usize;

    /// Discards all pollable elements.
    fn clear(&self);
}

// ---------------------------------------------------------------------------
// Tagged handles
// ---------------------------------------------------------------------------

/// The downstream side handed to [`Stage::subscribe`].
pub enum Downstream<T> {
    /// An ordinary subscriber.
    Plain(Arc<dyn Subscriber<T>>),
    /// A subscriber with the conditional capability.
    Conditional(Arc<dyn ConditionalSubscriber<T>>),
}

impl<T> Downstream<T> {
    /// Forwards `on_subscribe`.
    pub fn on_subscribe(&self, upstream: SubscriptionHandle<T>) {
        match self {
            Self::Plain(s) => s.on_subscribe(upstream),
            Self::Conditional(s) => s.on_subscribe(upstream),
        }
    }

    /// Forwards one element.
    pub fn on_next(&self, value: T) {
        match self {
            Self::Plain(s) => s.on_next(value),
            Self::Conditional(s) => s.on_next(value),
        }
    }

    /// Offers one element; a plain subscriber always accepts.
    pub fn try_on_next(&self, value: T) -> bool {
        match self {
            Self::Plain(s) => {
                s.on_next(value);
                true
            }
            Self::Conditional(s) => s.try_on_next(value),
        }
    }

    /// Forwards the failure terminal.
    pub fn on_error(&self, error: StreamError) {
        match self {
            Self::Plain(s) => s.on_error(error),
            Self::Conditional(s) => s.on_error(error),
        }
    }

    /// Forwards the completion terminal.
    pub fn on_complete(&self) {
        match self {
            Self::Plain(s) => s.on_complete(),
            Self::Conditional(s) => s.on_complete(),
        }
    }
}

impl<T> Clone for Downstream<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(s) => Self::Plain(Arc::clone(s)),
            Self::Conditional(s) => Self::Conditional(Arc::clone(s)),
        }
    }
}

impl<T> fmt::Debug for Downstream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(_) => write!(f, "Downstream::Plain"),
            Self::Conditional(_) => write!(f, "Downstream::Conditional"),
        }
    }
}

/// The upstream handle delivered through [`Subscriber::on_subscribe`].
pub enum SubscriptionHandle<T> {
    /// Push-path only.
    Plain(Arc<dyn Subscription>),
    /// Also offers the queue interface.
    Fused(Arc<dyn FusedSubscription<T>>),
}

impl<T> SubscriptionHandle<T> {
    /// Forwards a demand request.
    pub fn request(&self, n: u64) {
        match self {
            Self::Plain(s) => s.request(n),
            Self::Fused(s) => s.request(n),
        }
    }

    /// Forwards cancellation.
    pub fn cancel(&self) {
        match self {
            Self::Plain(s) => s.cancel(),
            Self::Fused(s) => s.cancel(),
        }
    }

    /// Capability test: the fused interface, when the upstream offers it.
    #[must_use]
    pub fn fused(&self) -> Option<&Arc<dyn FusedSubscription<T>>> {
        match self {
            Self::Plain(_) => None,
            Self::Fused(s) => Some(s),
        }
    }
}

impl<T> Clone for SubscriptionHandle<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(s) => Self::Plain(Arc::clone(s)),
            Self::Fused(s) => Self::Fused(Arc::clone(s)),
        }
    }
}

impl<T> fmt::Debug for SubscriptionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(_) => write!(f, "SubscriptionHandle::Plain"),
            Self::Fused(_) => write!(f, "SubscriptionHandle::Fused"),
        }
    }
}
