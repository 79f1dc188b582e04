//! Test harness for running many mockroute DHT clients on a simulated network.

pub mod integration;

pub use integration::{DhtNetwork, HarnessConfig, HarnessError, Mocknet, MocknetConfig};
