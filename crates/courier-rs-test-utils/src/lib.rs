//! Test helpers shared across courier crates.

pub mod adapter;
pub mod config;
pub mod store;

pub use adapter::RecordingAdapter;
pub use config::fast_config;
pub use store::FlakyStore;
