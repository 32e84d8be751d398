pub mod health;
pub mod item;
pub mod memory;
pub mod metrics;
pub mod pgstore;
pub mod store;
pub mod test_utils;
