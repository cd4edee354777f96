//! Small integer helpers used by partitioning and launch sizing

/// Round `n` up to a multiple of `m`. `m == 0` leaves `n` unchanged.
pub const fn alignup(n: usize, m: usize) -> usize {
    if m == 0 {
        n
    } else {
        n.div_ceil(m) * m
    }
}

/// Smallest power of two not below `x`; `nextpow2(0) == 1`.
pub const fn nextpow2(x: usize) -> usize {
    x.next_power_of_two()
}
