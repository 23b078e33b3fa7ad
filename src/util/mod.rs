pub mod env;
pub mod telemetry;

/// Compares two byte strings without short-circuiting on the first mismatch.
pub fn constant_time_cmp(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (l, r) in a.iter().zip(b.iter()) {
        diff |= std::hint::black_box(*l) ^ std::hint::black_box(*r);
    }

    std::hint::black_box(diff) == 0
}
