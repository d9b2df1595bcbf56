//! Custom error types for the acquisition pipeline.
//!
//! This module defines the primary error type, `DaqError`, used by every host-side part of
//! the crate. Using the `thiserror` crate, it provides a centralized and consistent way to
//! surface failures from configuration, shared-memory mapping, the datagram channel and the
//! recorder.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps `figment` errors raised while reading the TOML file or the
//!   environment overrides.
//! - **`Configuration`**: Semantic errors caught by validation, such as a pin number outside
//!   the 32-bit input register or an unparsable socket address.
//! - **`Io`**: Wraps `std::io::Error` for file, socket and device access.
//! - **`SharedMemory`**: The packet region could not be mapped or has the wrong size.
//! - **`Packet`**: A datagram did not match any known record layout.
//! - **`Csv`**: The recorder could not write a row.
//! - **`PinSetup`**: The one-shot pin configuration step failed. This aborts the session.
//! - **`ProducerPanicked`**: A sampling thread died instead of returning its summary.
//! - **`Timecode`**: A decoded IRIG frame carried out-of-range BCD digits.
//!
//! The busy sampling loops never produce errors. Every per-edge decision is made once and
//! recorded in counters, so these variants only appear on the host side of the handoff.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by the host side of the acquisition pipeline.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File, socket or device I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The shared packet region could not be mapped.
    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    /// A datagram did not match any record layout.
    #[error("Malformed packet: {0}")]
    Packet(String),

    /// CSV recorder failure.
    #[error("CSV recording error: {0}")]
    Csv(#[from] csv::Error),

    /// The pin configuration step exited unsuccessfully.
    #[error("Pin setup failed: {0}")]
    PinSetup(String),

    /// A producer thread panicked before reporting completion.
    #[error("{0} thread panicked")]
    ProducerPanicked(&'static str),

    /// IRIG data words held digits outside their valid range.
    #[error("Invalid timecode: {0}")]
    Timecode(String),
}
