//! Human-readable renderings of sizes, emissions and their equivalents.
//!
//! All functions are pure. Negative or non-finite input is treated as zero.

use serde_json::Value;

/// Kilometres driven per gram of CO2e.
pub const KM_PER_GRAM: f64 = 0.005;
/// Grams of CO2e one tree absorbs per year.
pub const GRAMS_PER_TREE: f64 = 5900.0;

const BYTE_UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
const FILE_SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// `1024`-based size with trailing zeros trimmed, e.g. `1500 -> "1.46 KB"`.
pub fn format_bytes(bytes: f64, decimals: usize) -> String {
    let bytes = sanitize(bytes);
    if bytes == 0.0 {
        return "0 B".to_string();
    }

    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{} {}", trimmed(value, decimals), BYTE_UNITS[unit])
}

/// Like [`format_bytes`] but only moves to the next unit above 1024,
/// so exactly `1024` stays `"1024 B"`.
pub fn format_file_size(bytes: f64, precision: usize) -> String {
    let mut value = sanitize(bytes);
    let mut unit = 0;
    while value > 1024.0 && unit < FILE_SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{} {}", trimmed(value, precision), FILE_SIZE_UNITS[unit])
}

/// Grams up to and including 1000, kilograms above.
pub fn format_emissions(grams: f64) -> String {
    let grams = sanitize(grams);
    if grams > 1000.0 {
        format!("{:.2} kg", round_half_up(grams / 1000.0, 2))
    } else {
        format!("{:.2} gr", round_half_up(grams, 2))
    }
}

pub fn calculate_driving_distance(grams: f64, decimals: usize) -> f64 {
    round_half_up(sanitize(grams) * KM_PER_GRAM, decimals)
}

pub fn format_driving_distance(grams: f64, decimals: usize) -> String {
    format!("{}km", calculate_driving_distance(grams, decimals))
}

/// Trees needed to absorb `grams` in a year, rounded up.
pub fn calculate_trees_needed(grams: f64) -> u64 {
    (sanitize(grams) / GRAMS_PER_TREE).ceil() as u64
}

pub fn format_trees_needed(grams: f64) -> String {
    format!("{} trees", calculate_trees_needed(grams))
}

/// Read a gram figure from loosely typed input. Anything but a JSON
/// number yields `0.0`.
pub fn grams_from_json(value: &Value) -> f64 {
    value.as_f64().map(sanitize).unwrap_or(0.0)
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

fn round_half_up(value: f64, decimals: usize) -> f64 {
    let factor = 10f64.powi(decimals.min(15) as i32);
    (value * factor).round() / factor
}

fn trimmed(value: f64, decimals: usize) -> String {
    let rendered = format!("{:.*}", decimals, round_half_up(value, decimals));
    if rendered.contains('.') {
        rendered
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    } else {
        rendered
    }
}
