use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Inclusive range of ports engine processes may bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    first: u16,
    last: u16,
}

impl PortRange {
    pub fn new(first: u16, last: u16) -> Result<Self> {
        if first == 0 {
            bail!("port out of range: 0");
        }
        if first > last {
            bail!("invalid range {first}-{last} (start > end)");
        }
        Ok(Self { first, last })
    }

    pub fn first(&self) -> u16 {
        self.first
    }

    pub fn last(&self) -> u16 {
        self.last
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.first..=self.last).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            first: 9000,
            last: u16::MAX,
        }
    }
}

/// Parse a port range.
///
/// Supported forms:
/// - inclusive range: `9000-9100`
/// - single seed port: `9000` (open-ended up to 65535)
/// - surrounding whitespace is ignored
pub fn parse_port_range(s: &str) -> Result<PortRange> {
    let s = s.trim();
    if let Some((a, b)) = s.split_once('-') {
        let start = parse_port_str(a.trim())
            .with_context(|| format!("invalid start in range: {a}"))?;
        let end = parse_port_str(b.trim())
            .with_context(|| format!("invalid end in range: {b}"))?;
        return PortRange::new(start, end);
    }
    let seed = parse_port_str(s).with_context(|| format!("invalid port value: {s}"))?;
    PortRange::new(seed, u16::MAX)
}

impl FromStr for PortRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_port_range(s)
    }
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

/// Hands out engine ports, preferring ones returned by released clients.
///
/// Released ports are handed out lowest first; otherwise the next never-used
/// port of the range is returned.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    next: u32,
    released: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            next: u32::from(range.first),
            released: BTreeSet::new(),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Returns `None` once the range is exhausted and nothing was released.
    pub fn allocate(&mut self) -> Option<u16> {
        if let Some(port) = self.released.pop_first() {
            return Some(port);
        }
        if self.next > u32::from(self.range.last) {
            return None;
        }
        let port = self.next as u16;
        self.next += 1;
        Some(port)
    }

    /// Give a port back. Ports never handed out, or already returned, are ignored.
    pub fn release(&mut self, port: u16) -> bool {
        if !self.range.contains(port) || u32::from(port) >= self.next {
            return false;
        }
        self.released.insert(port)
    }

    pub fn released_count(&self) -> usize {
        self.released.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_range_and_seed() {
        assert_eq!(parse_port_range("9000-9010").unwrap(), PortRange::new(9000, 9010).unwrap());
        let seed = parse_port_range("  9500 ").unwrap();
        assert_eq!(seed.first(), 9500);
        assert_eq!(seed.last(), 65535);
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_port_range("70000").is_err());
        assert!(parse_port_range("0").is_err());
        assert!(parse_port_range("9010-9000").is_err());
        assert!(parse_port_range("abc").is_err());
    }

    #[test]
    fn counter_increments_without_releases() {
        let mut alloc = PortAllocator::new(PortRange::new(9000, 9100).unwrap());
        assert_eq!(alloc.allocate(), Some(9000));
        assert_eq!(alloc.allocate(), Some(9001));
        assert_eq!(alloc.allocate(), Some(9002));
    }

    #[test]
    fn released_port_comes_back_first() {
        let mut alloc = PortAllocator::new(PortRange::default());
        let a = alloc.allocate().unwrap();
        let _b = alloc.allocate().unwrap();
        assert!(alloc.release(a));
        assert_eq!(alloc.allocate(), Some(a));
        assert_eq!(alloc.allocate(), Some(9002));
    }

    #[test]
    fn release_ignores_unknown_and_duplicate_ports() {
        let mut alloc = PortAllocator::new(PortRange::default());
        let a = alloc.allocate().unwrap();
        assert!(!alloc.release(9500));
        assert!(!alloc.release(80));
        assert!(alloc.release(a));
        assert!(!alloc.release(a));
        assert_eq!(alloc.released_count(), 1);
    }

    #[test]
    fn exhausted_range_yields_none() {
        let mut alloc = PortAllocator::new(PortRange::new(9000, 9001).unwrap());
        assert!(alloc.allocate().is_some());
        assert!(alloc.allocate().is_some());
        assert_eq!(alloc.allocate(), None);
        alloc.release(9000);
        assert_eq!(alloc.allocate(), Some(9000));
    }
}
