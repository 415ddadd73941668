// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Subject syntax.
//!
//! Subjects are `.`-separated tokens. In patterns `*` matches exactly one
//! token and `>` (last token only) matches one or more remaining tokens.

use crate::BusError;

const SINGLE: &str = "*";
const TAIL: &str = ">";

/// Validate a subject. Wildcards are only accepted when `pattern` is set.
pub fn validate(subject: &str, pattern: bool) -> Result<(), BusError> {
    let invalid = || BusError::InvalidSubject(subject.to_string());

    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(invalid());
        }
        let wildcard = *token == SINGLE || *token == TAIL;
        if wildcard && !pattern {
            return Err(invalid());
        }
        if *token == TAIL && i != last {
            return Err(invalid());
        }
        if !wildcard && (token.contains('*') || token.contains('>')) {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Whether literal `subject` is matched by `pattern`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(TAIL), Some(_)) => return true,
            (Some(SINGLE), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether every subject matched by `requested` is also matched by
/// `allowed`.
pub fn covers(allowed: &str, requested: &str) -> bool {
    let mut allow = allowed.split('.');
    let mut req = requested.split('.');
    loop {
        match (allow.next(), req.next()) {
            (Some(TAIL), Some(_)) => return true,
            (Some(_), Some(TAIL)) => return false,
            (Some(SINGLE), Some(_)) => {}
            (Some(a), Some(r)) if a == r => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
