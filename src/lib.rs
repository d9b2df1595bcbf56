//! # Encoder DAQ Core Library
//!
//! Time-stamped acquisition of a quadrature rotary encoder against an IRIG-B time
//! reference. Two busy-polling loops (the edge sampler and the IRIG decoder) publish
//! fixed-layout records into a shared packet region; a host relay copies finished records
//! out and sends each one as a UDP datagram; a receiver turns the datagrams back into CSV.
//!
//! ## Crate Structure
//!
//! - **`clock`**: Capture of the shared tick counter together with its wraparound count.
//! - **`config`**: The `DaqConfig` structure, loaded from TOML with environment overrides.
//! - **`data`**: The packet region, its byte layout, the double-buffered exchange and the
//!   record codecs.
//! - **`error`**: The `DaqError` enum used across the crate.
//! - **`hardware`**: Capability traits for the input register and tick counter, with
//!   memory-mapped and simulated implementations.
//! - **`irig`**: IRIG-B pulse classification, time code packing and the frame decoder.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`receiver`**: UDP datagram receiver and CSV recorder.
//! - **`relay`**: The host relay moving records from the region to the network.
//! - **`sampler`**: The encoder edge sampler.
//! - **`session`**: Wiring of both loops and the relay into one acquisition run.

pub mod clock;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod irig;
pub mod logging;
pub mod receiver;
pub mod relay;
pub mod sampler;
pub mod session;

pub use error::{AppResult, DaqError};
