use std::cmp::Ordering;

use regex::Regex;

/// Every first capture group of `pattern` in `html`, deduplicated in order of
/// first appearance.
pub fn extract_captures(html: &str, pattern: &Regex) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for cap in pattern.captures_iter(html) {
        if let Some(m) = cap.get(1) {
            let value = m.as_str().to_string();
            if !found.contains(&value) {
                found.push(value);
            }
        }
    }
    found
}

/// Numeric-aware version ordering: digit runs compare as numbers, everything
/// else compares as text. `v3.9 < v3.21`, `15.6 < 16.0`, `9 < 10`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = chunks(a);
    let mut right = chunks(b);

    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = compare_chunk(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

fn compare_chunk(l: &str, r: &str) -> Ordering {
    let l_numeric = l.bytes().all(|b| b.is_ascii_digit());
    let r_numeric = r.bytes().all(|b| b.is_ascii_digit());

    if l_numeric && r_numeric {
        let l = l.trim_start_matches('0');
        let r = r.trim_start_matches('0');
        l.len().cmp(&r.len()).then_with(|| l.cmp(r))
    } else {
        l.cmp(r)
    }
}

/// Split into alternating runs of digits and non-digits.
fn chunks(s: &str) -> impl Iterator<Item = &str> {
    let mut rest = s;
    std::iter::from_fn(move || {
        let first = rest.chars().next()?;
        let digit = first.is_ascii_digit();
        let end = rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() != digit)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (head, tail) = rest.split_at(end);
        rest = tail;
        Some(head)
    })
}

/// Highest version among `candidates`.
pub fn latest<'a>(candidates: &'a [String]) -> Option<&'a String> {
    candidates.iter().max_by(|a, b| compare_versions(a, b))
}
