//! The operator catalog.
//!
//! One module per operator family. Sources (`scalar`, `range`, `slice`)
//! originate elements; the rest wrap a source stage and transform its
//! protocol: bounding (`take`), backpressure policy (`latest`, `drop`),
//! per-element transformation (`map`, `filter`), combination
//! (`zip_iterable`, `combine_latest`), sequence reduction (`deferred`,
//! `has_elements`, `default_if_empty`), lifecycle observation (`peek`),
//! and shared subscription (`multicast`, `ref_count`).

pub mod combine_latest;
pub mod default_if_empty;
pub mod deferred;
pub mod drop;
pub mod filter;
pub mod has_elements;
pub mod latest;
pub mod map;
pub mod multicast;
pub mod peek;
pub mod range;
pub mod ref_count;
pub mod scalar;
pub mod slice;
pub mod take;
pub mod zip_iterable;

pub use combine_latest::{CombineLatestStage, DEFAULT_PREFETCH};
pub use default_if_empty::DefaultIfEmptyStage;
pub use deferred::DeferredScalar;
pub use drop::DropStage;
pub use filter::FilterStage;
pub use has_elements::HasElementsStage;
pub use latest::LatestStage;
pub use map::MapStage;
pub use multicast::{Connectable, ConnectionHandle, MulticastStage};
pub use peek::PeekStage;
pub use range::{range, RangeStage};
pub use ref_count::RefCountStage;
pub use scalar::{empty, just, never, EmptyStage, EmptySubscription, JustStage, NeverStage, ScalarSubscription};
pub use slice::{from_slice, SliceStage};
pub use take::TakeStage;
pub use zip_iterable::ZipIterableStage;
