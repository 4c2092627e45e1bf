//! Ordering of version tags.
//!
//! Tags are opaque strings; which one is "newer" is decided by a
//! [`VersionOrder`] supplied by the caller. Raw string comparison is never
//! used because it misorders tags such as `v2` and `v10`.

use std::cmp::Ordering;

use crate::manifest::MasterManifest;

/// Fallback version used when an install carries no version marker.
pub const FALLBACK_VERSION: &str = "v0.0.0";

/// Total order over version tags.
pub trait VersionOrder: Send + Sync {
    fn compare(&self, a: &str, b: &str) -> Ordering;

    fn is_newer(&self, candidate: &str, current: &str) -> bool {
        self.compare(candidate, current) == Ordering::Greater
    }
}

/// Semantic-version ordering that tolerates a leading `v`.
///
/// Tags that do not parse as semver on both sides are compared with
/// [`NaturalOrder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SemverOrder;

impl SemverOrder {
    fn parse(tag: &str) -> Option<semver::Version> {
        let trimmed = tag.strip_prefix(['v', 'V']).unwrap_or(tag);
        semver::Version::parse(trimmed).ok()
    }
}

impl VersionOrder for SemverOrder {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        match (Self::parse(a), Self::parse(b)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => NaturalOrder.compare(a, b),
        }
    }
}

/// Digit-run aware comparison: `v2 < v10`, `1.9.0 < 1.10.0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl VersionOrder for NaturalOrder {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        let mut left = Runs::new(a);
        let mut right = Runs::new(b);
        loop {
            match (left.next(), right.next()) {
                (None, None) => return a.cmp(b),
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(l), Some(r)) => {
                    let ord = compare_runs(l, r);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
    }
}

fn compare_runs(l: &str, r: &str) -> Ordering {
    let l_digit = l.as_bytes()[0].is_ascii_digit();
    let r_digit = r.as_bytes()[0].is_ascii_digit();
    match (l_digit, r_digit) {
        (true, true) => {
            let l = l.trim_start_matches('0');
            let r = r.trim_start_matches('0');
            l.len().cmp(&r.len()).then_with(|| l.cmp(r))
        }
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => l.cmp(r),
    }
}

/// Splits a tag into alternating digit / non-digit runs.
struct Runs<'a> {
    rest: &'a str,
}

impl<'a> Runs<'a> {
    fn new(s: &'a str) -> Self {
        Self { rest: s }
    }
}

impl<'a> Iterator for Runs<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let first = self.rest.chars().next()?;
        let digit = first.is_ascii_digit();
        let end = self
            .rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() != digit)
            .map(|(idx, _)| idx)
            .unwrap_or(self.rest.len());
        let (run, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(run)
    }
}

/// Newest version key in the manifest under `order`.
pub fn latest_version<'m>(manifest: &'m MasterManifest, order: &dyn VersionOrder) -> Option<&'m str> {
    manifest
        .versions
        .keys()
        .map(String::as_str)
        .max_by(|a, b| order.compare(a, b))
}
