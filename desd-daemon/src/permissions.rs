//! Token-based authorization for control sessions.
//!
//! A session carries a set of token strings. An operation is granted when
//! any token matches the operation name and its arguments:
//!
//! - `*` grants everything
//! - `service_action:*` grants `service_action` with any arguments
//! - `service_action:web:*` grants any action on `web`
//! - `service_action:web:start` grants exactly that
//! - `kill_service:web` grants kill scripts against `web`
//!
//! `assert_permission` is the single predicate the command handlers call;
//! richer backends (per-connection credentials, token files) slot in by
//! changing where the session's token set comes from.

use crate::errors::{DaemonError, Result};

/// Whether one token grants `op` with `args`.
fn token_grants(token: &str, op: &str, args: &[&str]) -> bool {
    if token == "*" {
        return true;
    }
    let mut parts = token.split(':');
    if parts.next() != Some(op) {
        return false;
    }
    for arg in args {
        match parts.next() {
            Some("*") => return true,
            Some(part) if part == *arg => {}
            _ => return false,
        }
    }
    // A token more specific than the operation grants nothing.
    parts.next().is_none()
}

/// Fail with a denial unless some session token grants the operation.
pub fn assert_permission(tokens: &[String], op: &str, args: &[&str]) -> Result<()> {
    if tokens.iter().any(|token| token_grants(token, op, args)) {
        Ok(())
    } else {
        Err(DaemonError::Denied(format!("{op}:{}", args.join(":"))))
    }
}
