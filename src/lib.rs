//! The _p11device_ library crate.
//!
//! A device layer that binds a uniform model of sessions, keys, certificates
//! and capabilities to security tokens reached through a PKCS#11 style
//! function table.

#[macro_use]
extern crate log;

pub mod config;
pub mod constants;
pub mod device;
