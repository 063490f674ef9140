// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame validation and rewriting.
//!
//! A data frame is 20 decoded bytes: `[0..7)` header, `[7..11)` account
//! (four ASCII decimal digits), `[11..15)` event code, `[15..17)` group,
//! `[17..20)` zone. The rewriter shifts accounts inside the configured
//! window, substitutes event codes through the configured map, and emits
//! the frame with its trailing sentinel so downstream components send it
//! as-is.

use crate::config::{ConfigError, RewriteRulesConfig};
use crate::relay::frame::{FRAME_LEN, SENTINEL};
use std::collections::HashMap;

/// End of the pass-through header.
const HEADER_END: usize = 7;

/// End of the account field.
const ACCOUNT_END: usize = 11;

/// End of the event-code field.
const EVENT_CODE_END: usize = 15;

/// Immutable rewrite rules, converted from configuration at startup.
#[derive(Debug, Clone)]
pub struct RewriteRules {
    /// Byte every non-heartbeat frame must begin with.
    pub required_prefix: u8,

    /// Exact decoded length a non-heartbeat frame must have.
    pub valid_length: usize,

    /// Inclusive account window the shift applies to.
    pub account_window: (u32, u32),

    /// Signed shift added to accounts inside the window.
    pub account_shift: i32,

    /// Event-code substitutions.
    pub event_code_map: HashMap<String, String>,
}

impl TryFrom<&RewriteRulesConfig> for RewriteRules {
    type Error = ConfigError;

    fn try_from(cfg: &RewriteRulesConfig) -> Result<Self, Self::Error> {
        let prefix = match cfg.required_prefix.as_bytes() {
            [b] => *b,
            _ => {
                return Err(ConfigError::InvalidValue(
                    "required_prefix must be a single character".into(),
                ))
            }
        };

        Ok(Self {
            required_prefix: prefix,
            valid_length: cfg.valid_length,
            account_window: (cfg.account_window[0], cfg.account_window[1]),
            account_shift: cfg.account_shift,
            event_code_map: cfg.event_code_map.clone(),
        })
    }
}

impl RewriteRules {
    /// Validity predicate for non-heartbeat frames: exact length and
    /// required first byte.
    pub fn is_valid(&self, frame: &[u8]) -> bool {
        frame.len() == self.valid_length && frame.first() == Some(&self.required_prefix)
    }
}

/// Rewrite error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    /// Frame is not the fixed data-frame length.
    InvalidLength(usize),
    /// Account field is not four ASCII decimal digits.
    InvalidAccount(String),
    /// Shifted account does not fit in four decimal digits.
    AccountOverflow(i64),
}

impl std::fmt::Display for RewriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLength(len) => {
                write!(f, "invalid frame length: got {}, want {}", len, FRAME_LEN)
            }
            Self::InvalidAccount(field) => {
                write!(f, "account field '{}' is not a decimal number", field)
            }
            Self::AccountOverflow(n) => {
                write!(f, "shifted account {} does not fit in four digits", n)
            }
        }
    }
}

impl std::error::Error for RewriteError {}

/// Rewrite a validated data frame per the rules.
///
/// Pure over (frame, rules). The input excludes the sentinel; the output
/// includes it, ready to send upstream as-is. Bytes `[0..7)` and
/// `[15..20)` are passed through untouched.
pub fn rewrite(frame: &[u8], rules: &RewriteRules) -> Result<Vec<u8>, RewriteError> {
    if frame.len() != FRAME_LEN {
        return Err(RewriteError::InvalidLength(frame.len()));
    }

    let account_field = &frame[HEADER_END..ACCOUNT_END];
    let account: u32 = std::str::from_utf8(account_field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            RewriteError::InvalidAccount(String::from_utf8_lossy(account_field).into_owned())
        })?;

    let (low, high) = rules.account_window;
    let shifted: i64 = if (low..=high).contains(&account) {
        i64::from(account) + i64::from(rules.account_shift)
    } else {
        i64::from(account)
    };

    if !(0..=9999).contains(&shifted) {
        return Err(RewriteError::AccountOverflow(shifted));
    }

    let code = &frame[ACCOUNT_END..EVENT_CODE_END];
    let mapped_code: &[u8] = std::str::from_utf8(code)
        .ok()
        .and_then(|s| rules.event_code_map.get(s))
        .map(|s| s.as_bytes())
        .unwrap_or(code);

    let mut out = Vec::with_capacity(FRAME_LEN + 1);
    out.extend_from_slice(&frame[..HEADER_END]);
    out.extend_from_slice(format!("{:04}", shifted).as_bytes());
    out.extend_from_slice(mapped_code);
    out.extend_from_slice(&frame[EVENT_CODE_END..]);
    out.push(SENTINEL);
    Ok(out)
}

/// Parse the device identity (account field) out of a rewritten payload.
///
/// The payload carries its sentinel; only the fixed account offsets are
/// read. Returns `None` when the payload is too short or non-numeric,
/// which cannot happen for frames produced by [`rewrite`].
pub fn device_id(payload: &[u8]) -> Option<u32> {
    let field = payload.get(HEADER_END..ACCOUNT_END)?;
    std::str::from_utf8(field).ok()?.parse().ok()
}
