// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod batching;
pub mod lifecycle;
pub mod liveness;
pub mod resolution;
pub mod utils;

pub use utils::*;
