/// IBB daemon library
///
/// Tooling around the bytestream core: currently a loopback driver that
/// pushes data through a pair of in-process endpoints.

pub mod loopback;

pub use loopback::{run_loopback, LoopbackOptions, LoopbackReport};
