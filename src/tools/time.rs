use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};

/// Parse `UTC`/`Z`/`GMT` or a fixed offset such as `+05:30`, `-0800`, `+02`.
pub fn parse_zone(zone: &str) -> Result<FixedOffset, String> {
    let zone = zone.trim();
    let upper = zone.to_ascii_uppercase();
    if upper.is_empty() || upper == "UTC" || upper == "Z" || upper == "GMT" {
        return FixedOffset::east_opt(0).ok_or_else(|| "invalid offset".to_string());
    }

    let raw = upper
        .strip_prefix("UTC")
        .or_else(|| upper.strip_prefix("GMT"))
        .unwrap_or(&upper);
    let (sign, digits) = match raw.chars().next() {
        Some('+') => (1, &raw[1..]),
        Some('-') => (-1, &raw[1..]),
        _ => return Err(format!("unsupported timezone '{zone}': use UTC or an offset like +05:30")),
    };

    let all_digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    let parse = |s: &str| s.parse::<i32>().map_err(|_| format!("invalid offset '{zone}'"));
    let (hours, minutes) = if let Some((h, m)) = digits.split_once(':') {
        // With a separator the offset must be exactly HH:MM.
        if h.len() != 2 || m.len() != 2 || !all_digits(h) || !all_digits(m) {
            return Err(format!("invalid offset '{zone}': expected HH:MM"));
        }
        (parse(h)?, parse(m)?)
    } else {
        if digits.len() > 4 || !all_digits(digits) {
            return Err(format!("invalid offset '{zone}'"));
        }
        if digits.len() <= 2 {
            (parse(digits)?, 0)
        } else {
            let split = digits.len() - 2;
            (parse(&digits[..split])?, parse(&digits[split..])?)
        }
    };
    if hours > 14 || minutes > 59 {
        return Err(format!("offset '{zone}' out of range"));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("offset '{zone}' out of range"))
}

/// Describe `now` in the requested zone.
pub fn describe(now: DateTime<Utc>, zone: Option<&str>) -> Result<String, String> {
    let offset = parse_zone(zone.unwrap_or("UTC"))?;
    let local = now.with_timezone(&offset);
    Ok(format!(
        "{} ({}, UTC{})",
        local.to_rfc3339_opts(SecondsFormat::Secs, false),
        local.format("%A"),
        offset,
    ))
}
