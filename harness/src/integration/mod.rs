//! Mock DHT network harness
//!
//! Spins up many DHT clients inside one process, connected through a
//! simulated network instead of sockets:
//!
//! - `Mocknet`: the shared in-process network with failure, link, latency
//!   and drop controls
//! - `DhtNetwork`: turns an identity (and optionally a store) into a live
//!   client on a `Mocknet`
//! - `NetworkInvariants` and `TestScenarios` for end-to-end checks

pub mod dht_network;
pub mod invariants;
pub mod mocknet;
pub mod scenarios;

pub use dht_network::{
    bootstrap_all, DhtNetwork, HarnessConfig, HarnessError, RoutingServer, WrapPolicy,
};
pub use invariants::{InvariantViolation, NetworkInvariants};
pub use mocknet::{Mocknet, MocknetConfig, RegistrationError, SimulatedHost};
pub use scenarios::TestScenarios;
