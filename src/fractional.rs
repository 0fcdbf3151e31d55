//! Fractional index keys for ordered reference lists.
//!
//! A sort key is a base-36 digit string. Inserting between two existing
//! keys produces a key strictly between them without renumbering any
//! sibling, so concurrent inserts at different positions never collide.
//!
//! Invariants:
//! - keys are compared as plain byte strings
//! - a generated key never ends in the zero digit (`'0'`), which keeps
//!   every key extensible on the low side

const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a key strictly between `lo` and `hi`.
///
/// `None` stands for the open end: `key_between(None, None)` yields a
/// midpoint key for an empty list, `key_between(Some(k), None)` a key
/// after `k`, and `key_between(None, Some(k))` a key before `k`.
///
/// # Panics
///
/// Panics if `lo >= hi`, or if either neighbor is empty or ends in the
/// zero digit. Neighbors are always keys previously produced by this
/// function, so hitting this is a caller bug.
pub fn key_between(lo: Option<&str>, hi: Option<&str>) -> String {
    let a = lo.unwrap_or("");
    let b = hi.unwrap_or("");
    if !a.is_empty() {
        assert!(!a.ends_with('0'), "sort key {a:?} ends in zero digit");
    }
    if !b.is_empty() {
        assert!(!b.ends_with('0'), "sort key {b:?} ends in zero digit");
        assert!(a < b, "sort key order violated: {a:?} >= {b:?}");
    }
    midpoint(a, b)
}

/// Midpoint of two digit strings; `""` means -inf for `a` and +inf for `b`.
fn midpoint(a: &str, b: &str) -> String {
    let ab = a.as_bytes();
    let bb = b.as_bytes();

    if !b.is_empty() {
        // Shared prefix stays, the midpoint is taken on the remainder.
        let mut n = 0;
        while n < bb.len() && ab.get(n).copied() == Some(bb[n]) {
            n += 1;
        }
        if n > 0 {
            let rest_a = if n <= a.len() { &a[n..] } else { "" };
            return format!("{}{}", &b[..n], midpoint(rest_a, &b[n..]));
        }
    }

    let digit_a = if ab.is_empty() { 0 } else { digit_index(ab[0]) };
    let digit_b = if bb.is_empty() {
        DIGITS.len()
    } else {
        digit_index(bb[0])
    };

    if digit_b - digit_a > 1 {
        let mid = (digit_a + digit_b) / 2;
        (DIGITS[mid] as char).to_string()
    } else if a.len() > 1 {
        // Consecutive first digits: extend below a's remainder.
        format!("{}{}", &a[..1], midpoint(&a[1..], ""))
    } else {
        let rest_b = if bb.is_empty() { "" } else { &b[1..] };
        format!("{}{}", DIGITS[digit_a] as char, midpoint("", rest_b))
    }
}

fn digit_index(d: u8) -> usize {
    DIGITS
        .iter()
        .position(|&c| c == d)
        .unwrap_or_else(|| panic!("invalid sort key digit {:?}", d as char))
}
