//! IP blocklist
//!
//! One rule per line: a single address, an inclusive `start - end` range, or a
//! CIDR block. `#` starts a comment. Ranges are merged and sorted after loading
//! so lookups are a binary search.

use std::net::IpAddr;
use std::path::Path;

use crate::error::{Result, StreamError};

/// Set of blocked IPv4 and IPv6 ranges handed to the engine
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IpFilter {
    v4: Vec<(u32, u32)>,
    v6: Vec<(u128, u128)>,
}

impl IpFilter {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            StreamError::config("blocklist", format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut filter = Self::default();
        for (line_no, line) in text.lines().enumerate() {
            let rule = line.split('#').next().unwrap_or_default().trim();
            if rule.is_empty() {
                continue;
            }
            filter.add_rule(rule).map_err(|message| {
                StreamError::config("blocklist", format!("line {}: {}", line_no + 1, message))
            })?;
        }
        filter.v4 = merge(std::mem::take(&mut filter.v4));
        filter.v6 = merge(std::mem::take(&mut filter.v6));
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Number of disjoint ranges after merging
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_blocked(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(ip) => contains(&self.v4, u32::from(ip)),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(v4) => contains(&self.v4, u32::from(v4)),
                None => contains(&self.v6, u128::from(ip)),
            },
        }
    }

    pub fn v4_ranges(&self) -> &[(u32, u32)] {
        &self.v4
    }

    pub fn v6_ranges(&self) -> &[(u128, u128)] {
        &self.v6
    }

    fn add_rule(&mut self, rule: &str) -> std::result::Result<(), String> {
        let (start, end) = if let Some((start, end)) = rule.split_once('-') {
            (parse_ip(start)?, parse_ip(end)?)
        } else if let Some((base, prefix)) = rule.split_once('/') {
            let base = parse_ip(base)?;
            let prefix: u32 = prefix
                .trim()
                .parse()
                .map_err(|_| format!("bad prefix length {:?}", prefix.trim()))?;
            return self.add_cidr(base, prefix);
        } else {
            let ip = parse_ip(rule)?;
            (ip, ip)
        };

        match (start, end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => self.v4.push(ordered(u32::from(s), u32::from(e))),
            (IpAddr::V6(s), IpAddr::V6(e)) => {
                self.v6.push(ordered(u128::from(s), u128::from(e)))
            }
            _ => return Err("range mixes IPv4 and IPv6".to_string()),
        }
        Ok(())
    }

    fn add_cidr(&mut self, base: IpAddr, prefix: u32) -> std::result::Result<(), String> {
        match base {
            IpAddr::V4(ip) if prefix <= 32 => {
                let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
                let start = u32::from(ip) & mask;
                self.v4.push((start, start | !mask));
            }
            IpAddr::V6(ip) if prefix <= 128 => {
                let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
                let start = u128::from(ip) & mask;
                self.v6.push((start, start | !mask));
            }
            _ => return Err(format!("prefix /{} out of range", prefix)),
        }
        Ok(())
    }
}

fn parse_ip(text: &str) -> std::result::Result<IpAddr, String> {
    let text = text.trim();
    text.parse().map_err(|_| format!("bad address {:?}", text))
}

fn ordered<T: Ord>(a: T, b: T) -> (T, T) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Sort and coalesce overlapping or adjacent ranges
fn merge<T: Ord + Copy + Successor>(mut ranges: Vec<(T, T)>) -> Vec<(T, T)> {
    ranges.sort_unstable();
    let mut merged: Vec<(T, T)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1.successor() => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

fn contains<T: Ord + Copy>(ranges: &[(T, T)], value: T) -> bool {
    let idx = ranges.partition_point(|&(start, _)| start <= value);
    idx > 0 && value <= ranges[idx - 1].1
}

trait Successor {
    /// `self + 1`, saturating at the maximum
    fn successor(self) -> Self;
}

impl Successor for u32 {
    fn successor(self) -> Self {
        self.saturating_add(1)
    }
}

impl Successor for u128 {
    fn successor(self) -> Self {
        self.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_single_range_and_cidr() {
        let filter = IpFilter::parse(
            "10.0.0.1\n10.0.0.10 - 10.0.0.4\n192.168.1.0/24\n2001:db8::/32\n",
        )
        .unwrap();

        assert!(filter.is_blocked(v4(10, 0, 0, 1)));
        assert!(filter.is_blocked(v4(10, 0, 0, 7)));
        assert!(filter.is_blocked(v4(192, 168, 1, 200)));
        assert!(filter.is_blocked("2001:db8::1".parse().unwrap()));
        assert!(!filter.is_blocked(v4(10, 0, 0, 2)));
        assert!(!filter.is_blocked(v4(172, 16, 0, 1)));
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let filter = IpFilter::parse("# header\n\n  10.0.0.0/8 # private\n").unwrap();
        assert_eq!(filter.len(), 1);
        assert!(filter.is_blocked(v4(10, 200, 3, 4)));
    }

    #[test]
    fn test_merges_overlapping_ranges() {
        let filter =
            IpFilter::parse("1.0.0.0-1.0.0.10\n1.0.0.5-1.0.0.20\n1.0.0.21\n9.9.9.9").unwrap();
        assert_eq!(filter.v4_ranges().len(), 2);
        assert!(filter.is_blocked(v4(1, 0, 0, 21)));
    }

    #[test]
    fn test_zero_and_full_prefix() {
        let filter = IpFilter::parse("0.0.0.0/0").unwrap();
        assert!(filter.is_blocked(v4(255, 255, 255, 255)));

        let filter = IpFilter::parse("8.8.8.8/32").unwrap();
        assert!(filter.is_blocked(v4(8, 8, 8, 8)));
        assert!(!filter.is_blocked(v4(8, 8, 8, 9)));
    }

    #[test]
    fn test_mapped_v6_checks_v4_ranges() {
        let filter = IpFilter::parse("10.0.0.0/8").unwrap();
        assert!(filter.is_blocked("::ffff:10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn test_errors_name_the_line() {
        let err = IpFilter::parse("10.0.0.1\nnot-an-ip\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(IpFilter::parse("10.0.0.0/33").is_err());
        assert!(IpFilter::parse("10.0.0.1 - ::1").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklist.txt");
        std::fs::write(&path, "192.0.2.0/24\n").unwrap();
        let filter = IpFilter::from_file(&path).unwrap();
        assert!(filter.is_blocked(v4(192, 0, 2, 9)));
        assert!(IpFilter::from_file(&dir.path().join("missing")).is_err());
    }
}
