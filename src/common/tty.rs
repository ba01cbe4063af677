/// Terminal width used to size the chunk bar and `--auto-size` math.
///
/// Window-size queries are platform territory we stay out of; honoring
/// `COLUMNS` covers interactive shells, and the fallback keeps layout
/// deterministic everywhere else.
pub fn width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&w| w > 0)
        .unwrap_or(80)
}
