// Data source abstraction: the remote byte provider behind the span cache.

pub mod traits;

pub use traits::MediaSource;
