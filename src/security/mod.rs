//! Outbound request safety checks.

pub mod ssrf;

pub use ssrf::{check_literal, check_target, is_blocked_ip};
