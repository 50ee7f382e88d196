//! # rudder
//!
//! A user-space control plane for the Linux kernel's IPVS layer-4 load
//! balancer. rudder manages named virtual services and their real
//! backends, keeps backend weights continuously in sync with active
//! health probes, and can mirror its configured state to an external
//! key-value store so multiple instances converge on the same routing
//! table.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │    Configuration Manager     │      ┌─────────────┐
//! │                              │────▶│ IPVS driver │
//! │  services ──── backends      │      └─────────────┘
//! └──────┬───────────────▲───────┘
//!        │ spawns        │ reweights
//!        ▼               │
//! ┌─────────────┐   ┌────┴────────┐
//! │ pulse tasks │──▶│   stasher   │
//! │ (1/backend) │   │ (1 consumer)│
//! └─────────────┘   └─────────────┘
//! ```
//!
//! The [`core::Context`] owns the registry and serializes every
//! mutation. One [`pulse`] task per backend feeds a shared update
//! channel; the weight stasher consumes it and translates health
//! transitions into weight mutations, preserving the declared weight
//! across flaps and restoring it in proportion to measured health.
//!
//! The kernel bindings ([`ipvs::IpvsDriver`]), external store
//! ([`store::StoreBinding`]), discovery registrar
//! ([`disco::DiscoveryDriver`]) and VIP attachment helper
//! ([`net::AddressAttacher`]) are injection seams; their production
//! implementations live outside this crate.

pub mod config;
pub mod core;
pub mod disco;
pub mod ipvs;
pub mod net;
pub mod pulse;
pub mod store;
