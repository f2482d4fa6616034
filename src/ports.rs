//! Host port allocation for containers

use rand::Rng;
use std::collections::HashSet;
use std::ops::RangeInclusive;

/// Hands out host ports from a fixed range, never the same port twice
/// while it is held.
///
/// Allocation first tries random draws from the range and falls back to a
/// linear scan, so it fails only when every port is actually taken.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    used: HashSet<u16>,
    attempts: u32,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>, attempts: u32) -> Self {
        Self {
            range,
            used: HashSet::new(),
            attempts,
        }
    }

    /// Reserve a free port, or `None` if the range is exhausted
    pub fn allocate(&mut self) -> Option<u16> {
        if self.range.is_empty() {
            return None;
        }

        let mut rng = rand::thread_rng();
        for _ in 0..self.attempts {
            let port = rng.gen_range(self.range.clone());
            if self.used.insert(port) {
                return Some(port);
            }
        }

        let port = self.range.clone().find(|p| !self.used.contains(p))?;
        self.used.insert(port);
        Some(port)
    }

    /// Return a port to the pool. Releasing an unheld port is a no-op.
    pub fn release(&mut self, port: u16) {
        self.used.remove(&port);
    }

    pub fn is_used(&self, port: u16) -> bool {
        self.used.contains(&port)
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }
}
