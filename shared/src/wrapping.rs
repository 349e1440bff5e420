//! Ordering for `u16` tick numbers that wrap around

/// Returns whether `s1` comes after `s2`, treating the space as circular.
///
/// `sequence_greater_than(2, 1)` is true, `sequence_greater_than(0, 65535)` is
/// true, `sequence_greater_than(1, 1)` is false.
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// `s1 <= s2` in wrapping order.
pub fn sequence_at_or_before(s1: u16, s2: u16) -> bool {
    s1 == s2 || sequence_less_than(s1, s2)
}
