//! Human-friendly data sizes and durations used in configuration files.

use std::time::Duration;

/// Parse sizes like "10B", "512kB", "1MB", "2.5GB". Units are powers of 1024.
pub fn parse_data_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (num, unit) = s.split_at(split);
    let value: f64 = num.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "B" => 1,
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        "TB" => 1 << 40,
        "PB" => 1 << 50,
        _ => return None,
    };
    let bytes = value * multiplier as f64;
    if bytes > u64::MAX as f64 {
        return None;
    }
    Some(bytes.round() as u64)
}

/// Render bytes with the largest unit that keeps the value >= 1.
pub fn format_data_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}

/// Parse durations like "500ms", "2s", "1m", "1h30m", "1d".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.trim().chars().peekable();
    let mut has_unit = false;

    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
            continue;
        }
        let n: u64 = num_buf.parse().ok()?;
        num_buf.clear();
        let unit_ms = match ch {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            's' => 1_000,
            'm' => 60_000,
            'h' => 3_600_000,
            'd' => 86_400_000,
            _ => return None,
        };
        total_ms = total_ms.checked_add(n.checked_mul(unit_ms)?)?;
        has_unit = true;
    }

    if !num_buf.is_empty() || !has_unit {
        // Trailing digits with no unit
        return None;
    }
    Some(Duration::from_millis(total_ms))
}

/// Parse a percentage like "50%" into a fraction in `[0, 1]`.
pub fn parse_percentage(s: &str) -> Option<f64> {
    let value: f64 = s.trim().strip_suffix('%')?.trim().parse().ok()?;
    if (0.0..=100.0).contains(&value) {
        Some(value / 100.0)
    } else {
        None
    }
}
