//! AirHound library — portable surveillance detection engine.
//!
//! One of three portable layers in the AirHound toolkit (alongside the
//! [signature schema](../schemas/signatures.v1.schema.json) and
//! [event protocol schema](../schemas/device-message.v1.schema.json)).
//! This crate contains all scanning, filtering, and protocol logic with no
//! platform dependencies, testable on any host with `cargo test`. Platform
//! binaries (ESP32 firmware, Linux daemon, Kismet companion) are thin consumers
//! that provide radio access and output sinks.
//!
//! The library is organized in two code layers:
//! - **Layer 1** (implemented): `scanner`, `filter`, `defaults`, `protocol`,
//!   `comm`, `board` — `no_std`, no allocator, no external dependencies.
//! - **Layer 2** (implemented, behind the `std` feature): `targets`,
//!   `channel`, `tracker`, `wids`, `gps`, `export`, `drone`, `context`,
//!   `config`, `error` — the cooperative mesh-node core: MAC-randomization
//!   de-anonymization, deauth/baseline anomaly detection, multi-node
//!   triangulation, and the mesh message broker that ties them together.
//!   These require `alloc` and `std` (`HashMap`, threads, file I/O) and are
//!   consumed by `firmware-std`, not the no_std Embassy binary.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod board;
pub mod comm;
pub mod defaults;
pub mod filter;
pub mod protocol;
pub mod rules;
pub mod scanner;

#[cfg(feature = "std")]
pub mod channel;
#[cfg(feature = "std")]
pub mod config;
#[cfg(feature = "std")]
pub mod context;
#[cfg(feature = "std")]
pub mod drone;
#[cfg(feature = "std")]
pub mod error;
#[cfg(feature = "std")]
pub mod export;
#[cfg(feature = "std")]
pub mod gps;
#[cfg(feature = "std")]
pub mod targets;
#[cfg(feature = "std")]
pub mod tracker;
#[cfg(feature = "std")]
pub mod wids;
