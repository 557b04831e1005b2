//! Human-readable durations used by flags, environment variables, and
//! `werf.toml` (`250ms`, `30s`, `5m`, `1h`, or bare seconds).

use std::time::Duration;

use crate::Error;

/// Parse a duration such as `30s` or `1500ms`.
///
/// `field` names the flag or config key so the error points at the offending
/// input.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use werf_core::duration::parse_duration;
///
/// assert_eq!(parse_duration("ttl", "30s").unwrap(), Duration::from_secs(30));
/// assert_eq!(parse_duration("ttl", "250ms").unwrap(), Duration::from_millis(250));
/// assert_eq!(parse_duration("ttl", "2").unwrap(), Duration::from_secs(2));
/// ```
pub fn parse_duration(field: &str, value: &str) -> crate::Result<Duration> {
    let trimmed = value.trim();
    let invalid = |reason| Error::InvalidDuration {
        field: field.to_owned(),
        value: value.to_owned(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("empty value"));
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    if digits.is_empty() {
        return Err(invalid("expected a number followed by ms, s, m, or h"));
    }

    let amount: u64 = digits.parse().map_err(|_| invalid("number out of range"))?;

    let millis_per_unit: u64 = match unit {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => return Err(invalid("unknown unit, expected ms, s, m, or h")),
    };

    amount
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| invalid("number out of range"))
}

/// Like [`parse_duration`] but rejects zero, for TTLs and timeouts that must
/// be positive.
pub fn parse_positive_duration(field: &str, value: &str) -> crate::Result<Duration> {
    let duration = parse_duration(field, value)?;
    if duration.is_zero() {
        return Err(Error::InvalidDuration {
            field: field.to_owned(),
            value: value.to_owned(),
            reason: "must be greater than zero",
        });
    }
    Ok(duration)
}

/// Render a duration in the shortest unit that represents it exactly.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_owned();
    }
    if millis % 3_600_000 == 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1_000 == 0 {
        format!("{}s", millis / 1_000)
    } else {
        format!("{millis}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_unit() {
        assert_eq!(parse_duration("f", "15ms").unwrap(), Duration::from_millis(15));
        assert_eq!(parse_duration("f", "15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("f", "15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("f", "2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("f", " 7 ").unwrap(), Duration::from_secs(7));
    }

    #[test]
    fn rejects_garbage() {
        for input in ["", "s", "10x", "-5s", "1.5s", "ten"] {
            let err = parse_duration("ttl", input).unwrap_err();
            assert!(
                err.to_string().contains("ttl"),
                "error should name the field: {err}"
            );
        }
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse_duration("f", "99999999999999999999h").is_err());
        assert!(parse_duration("f", "18446744073709551615h").is_err());
    }

    #[test]
    fn positive_rejects_zero() {
        assert!(parse_positive_duration("ttl", "0s").is_err());
        assert!(parse_positive_duration("ttl", "1ms").is_ok());
    }

    #[test]
    fn format_picks_largest_exact_unit() {
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn never_panics(s in "\\PC*") {
                let _ = parse_duration("f", &s);
            }

            #[test]
            fn format_then_parse_is_identity(millis in 0u64..10_000_000_000) {
                let d = Duration::from_millis(millis);
                prop_assert_eq!(parse_duration("f", &format_duration(d)).unwrap(), d);
            }
        }
    }
}
