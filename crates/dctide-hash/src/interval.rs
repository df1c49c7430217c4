//! Interval string parsing.
//!
//! Configuration values such as the share rescan interval accept either
//! a bare number of seconds (`"600"`) or a sequence of unit groups
//! (`"10m"`, `"1h30m"`, `"2d12h"`). Units are `s`, `m`, `h` and `d`.

use crate::error::HashError;

/// Parse an interval string into seconds.
///
/// # Errors
///
/// Fails on empty input, unknown units, groups without digits, or
/// overflow.
pub fn parse_interval(s: &str) -> Result<u64, HashError> {
    let err = || HashError::Interval(s.to_string());
    if s.is_empty() {
        return Err(err());
    }
    let mut total: u64 = 0;
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut num: u64 = 0;
        let mut digits = 0;
        while let Some(c) = chars.peek().copied() {
            let Some(d) = c.to_digit(10) else { break };
            num = num
                .checked_mul(10)
                .and_then(|n| n.checked_add(u64::from(d)))
                .ok_or_else(err)?;
            digits += 1;
            chars.next();
        }
        if digits == 0 {
            return Err(err());
        }
        let mult = match chars.peek().copied() {
            None => 1,
            Some('s') => 1,
            Some('m') => 60,
            Some('h') => 3600,
            Some('d') => 86400,
            Some(_) => return Err(err()),
        };
        if chars.peek().is_some() {
            chars.next();
        }
        total = num
            .checked_mul(mult)
            .and_then(|n| total.checked_add(n))
            .ok_or_else(err)?;
    }
    Ok(total)
}
