// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan speed control for a serial dimmer.
//!
//! The [`controller::Controller`] polls CPU/GPU temperatures, maps them to a
//! duty through a [`curve::RangeTable`], smooths the result with a
//! [`limiter::RateLimiter`], and writes it to a [`device::DeviceLink`].

pub mod config;
pub mod controller;
pub mod curve;
pub mod device;
pub mod error;
pub mod limiter;
pub mod ports;
pub mod sensors;

pub use error::{Error, Result};
