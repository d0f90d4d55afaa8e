// Span cache: bounded, persistent, least-recently-used storage of byte ranges.

mod disk;
mod index;
mod persist;
pub mod read_through;
pub mod shutdown;
pub mod span;
pub mod span_cache;
pub mod stats;

pub use read_through::{read_through, CachedSource};
pub use shutdown::flush_on_shutdown;
pub use span::{ByteRange, ReadPlan, Span, SpanKey};
pub use span_cache::{SpanCache, WriteOutcome};
pub use stats::CacheStatsSnapshot;
