//! Throttlegate - keyed action throttling with tiered lockout
//!
//! This crate guards sensitive operations (register, login, two-factor,
//! email verification) by counting attempts per caller in a shared counter
//! store, locking out abusive callers, and optionally requiring a
//! CAPTCHA-style challenge. Denials are returned as data with a reason code
//! and a retry-after hint; only configuration mistakes are errors.

pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod throttle;
