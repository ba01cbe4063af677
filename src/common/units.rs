const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Scales a byte count into the largest unit that keeps the value >= 1.
pub fn human_size(bytes: f64) -> (f64, &'static str) {
    let mut value = bytes;
    let mut unit = 0;

    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    (value, UNITS[unit])
}

/// `human_size` formatted the way status lines print it.
pub fn human_size_str(bytes: u64) -> String {
    let (value, suffix) = human_size(bytes as f64);
    format!("{:.2}{}", value, suffix)
}

/// Bytes-per-second with the unit suffix.
pub fn human_rate_str(rate: f64) -> String {
    let (value, suffix) = human_size(rate);
    format!("{:.2}{}/s", value, suffix)
}
