//! Message registry: the set of message names an endpoint accepts and the
//! per-message argument validators.
//!
//! A registry is a plain value constructed at program start. Extensions
//! overlay additional entries before the endpoint is built; lookup returns
//! the most recently overlaid entry for a name.

use std::collections::HashMap;

/// Inspects the argument fields (everything after the message name) and
/// decides whether the message is well-formed.
pub type Validator = fn(&[String]) -> bool;

#[derive(Clone, Default)]
pub struct Registry {
    entries: HashMap<&'static str, Validator>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn insert(&mut self, name: &'static str, validator: Validator) {
        debug_assert!(is_message_name(name));
        self.entries.insert(name, validator);
    }

    pub fn with(mut self, name: &'static str, validator: Validator) -> Self {
        self.insert(name, validator);
        self
    }

    /// Merge `other` over this registry; entries in `other` win.
    pub fn overlay(mut self, other: Registry) -> Self {
        self.entries.extend(other.entries);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<Validator> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

/// Message names: lowercase alphanumerics, underscore, and the dotted
/// namespacing used by the spawner vocabulary.
pub fn is_message_name(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'.')
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Service and action names: `\w[\w.-]*`.
pub fn is_service_name(s: &str) -> bool {
    let bytes = s.as_bytes();
    match bytes.first() {
        Some(&b) if is_word_byte(b) => {}
        _ => return false,
    }
    bytes[1..]
        .iter()
        .all(|&b| is_word_byte(b) || b == b'.' || b == b'-')
}

/// Handle names: `-` alone, or the service-name rule.
pub fn is_handle_name(s: &str) -> bool {
    s == "-" || is_service_name(s)
}

/// Signal names: `SIG` followed by capitals and digits.
pub fn is_signal_name(s: &str) -> bool {
    let rest = match s.strip_prefix("SIG") {
        Some(rest) if !rest.is_empty() => rest,
        _ => return false,
    };
    rest.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

fn is_killscript_duration(s: &str) -> bool {
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (s, None),
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    match frac {
        Some(f) => !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()),
        None => true,
    }
}

/// Kill-script wire field: space-separated signal names and decimal
/// durations, at least one token, no leading/trailing/double spaces.
pub fn is_killscript_field(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    s.split(' ')
        .all(|tok| !tok.is_empty() && (is_signal_name(tok) || is_killscript_duration(tok)))
}

fn v_any(_args: &[String]) -> bool {
    true
}

fn v_none(args: &[String]) -> bool {
    args.is_empty()
}

fn v_service_action(args: &[String]) -> bool {
    args.len() == 2 && is_service_name(&args[0]) && is_service_name(&args[1])
}

fn v_killscript(args: &[String]) -> bool {
    args.len() == 2 && is_service_name(&args[0]) && is_killscript_field(&args[1])
}

fn v_service_args(args: &[String]) -> bool {
    args.len() >= 2 && is_service_name(&args[0])
}

fn v_service_fds(args: &[String]) -> bool {
    args.len() >= 2 && is_service_name(&args[0]) && args[1..].iter().all(|h| is_handle_name(h))
}

fn v_service_auto_up(args: &[String]) -> bool {
    args.len() >= 2 && is_service_name(&args[0]) && (args[1] == "0" || args[1] == "1")
}

fn v_one_service(args: &[String]) -> bool {
    args.len() == 1 && is_service_name(&args[0])
}

fn v_service_signal(args: &[String]) -> bool {
    args.len() == 2 && is_service_name(&args[0]) && is_signal_name(&args[1])
}

fn v_service_tag(args: &[String]) -> bool {
    args.len() == 3 && is_service_name(&args[0])
}

fn v_one_signal(args: &[String]) -> bool {
    args.len() == 1 && is_signal_name(&args[0])
}

/// Commands accepted from control clients.
pub fn control_registry() -> Registry {
    Registry::new()
        .with("echo", v_any)
        .with("service_action", v_service_action)
        .with("killscript", v_killscript)
}

/// Commands Desd emits toward the spawner host. The client role validates
/// outbound messages against this table before sending.
pub fn spawner_registry() -> Registry {
    Registry::new()
        .with("statedump", v_none)
        .with("echo", v_any)
        .with("service.args", v_service_args)
        .with("service.fds", v_service_fds)
        .with("service.auto_up", v_service_auto_up)
        .with("service.start", v_one_service)
        .with("service.signal", v_service_signal)
        .with("service.delete", v_one_service)
        .with("service.tag", v_service_tag)
        .with("signal.clear", v_one_signal)
}
