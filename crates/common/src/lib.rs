//! Common utilities and types shared across Voice Relay components.

#![warn(clippy::pedantic)]

/// Module for common data types (room, channel, region and reference ids)
pub mod types;

/// Module for logging bootstrap shared by the binaries
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;
