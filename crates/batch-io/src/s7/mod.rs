//! Siemens S7 over ISO-on-TCP (RFC1006), enough for LOGO! and S7-1200 V memory access.

mod client;
pub mod frame;

pub use client::{S7Config, S7Driver};
pub use frame::S7Error;
