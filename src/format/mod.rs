const MIB: f64 = 1024.0 * 1024.0;

pub fn mebibytes(bytes: u64) -> f64 {
    bytes as f64 / MIB
}

/// Percentage shrink from `original` to `optimized`, clamped at zero
/// when the "optimized" file came out larger.
pub fn percent_reduction(original: u64, optimized: u64) -> f64 {
    if original == 0 || optimized >= original {
        return 0.0;
    }
    (original - optimized) as f64 / original as f64 * 100.0
}
