pub mod adapters;
pub mod attach;
pub mod container;
pub mod expert;
pub mod graph;
pub mod library;
pub mod routing;
pub mod transforms;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
