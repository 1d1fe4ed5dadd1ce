//! Arena statistics and region dumps.

use std::fmt;

use crate::util::size::format_bytes;

/// Snapshot of one arena's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Instance identifier.
    pub instance: u64,

    /// Sum of every region's capacity.
    pub total_capacity: usize,

    /// Block bytes currently handed out (always equal to the sum over regions).
    pub total_used: usize,

    /// Peak of `total_used` (high water mark).
    pub peak_used: usize,

    /// Regions currently held.
    pub region_count: usize,

    /// Successful allocations.
    pub allocation_count: u64,

    /// Releases.
    pub release_count: u64,

    /// Successful resizes.
    pub resize_count: u64,

    /// Requests that returned no memory.
    pub failed_count: u64,

    /// Regions mapped over the arena's lifetime.
    pub regions_mapped: u64,

    /// Regions unmapped by the shrink policy.
    pub regions_released: u64,
}

impl ArenaStats {
    /// Capacity not currently handed out. Not necessarily contiguous.
    pub fn headroom(&self) -> usize {
        self.total_capacity.saturating_sub(self.total_used)
    }

    /// Live allocations.
    pub fn active_allocations(&self) -> u64 {
        self.allocation_count.saturating_sub(self.release_count)
    }
}

impl fmt::Display for ArenaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Arena {} Statistics:", self.instance)?;
        writeln!(f, "  Capacity:        {}", format_bytes(self.total_capacity))?;
        writeln!(f, "  Used:            {}", format_bytes(self.total_used))?;
        writeln!(f, "  Peak used:       {}", format_bytes(self.peak_used))?;
        writeln!(f, "  Regions:         {}", self.region_count)?;
        writeln!(f, "  Allocations:     {}", self.allocation_count)?;
        writeln!(f, "  Releases:        {}", self.release_count)?;
        writeln!(f, "  Resizes:         {}", self.resize_count)?;
        writeln!(f, "  Failed:          {}", self.failed_count)?;
        writeln!(
            f,
            "  Regions mapped:  {} ({} released)",
            self.regions_mapped, self.regions_released
        )?;
        Ok(())
    }
}

/// One row of [`Arena::region_dump`](crate::Arena::region_dump).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSummary {
    /// Region identifier, unique across all instances.
    pub id: u64,
    /// First address of the region.
    pub start: usize,
    /// One past the last address of the region.
    pub end: usize,
    /// Largest payload the region holds when empty.
    pub capacity: usize,
    /// Block bytes currently handed out from this region.
    pub used: usize,
    /// Embedded in the instance control mapping; never unmapped by shrinking.
    pub pinned: bool,
}

impl RegionSummary {
    /// Whether `addr` lies in `[start, end)`.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

impl fmt::Display for RegionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "region {:>4} [{:#014x}, {:#014x}) used {} of {}{}",
            self.id,
            self.start,
            self.end,
            format_bytes(self.used),
            format_bytes(self.capacity),
            if self.pinned { " (pinned)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headroom_and_active() {
        let stats = ArenaStats {
            total_capacity: 1000,
            total_used: 400,
            allocation_count: 10,
            release_count: 4,
            ..Default::default()
        };
        assert_eq!(stats.headroom(), 600);
        assert_eq!(stats.active_allocations(), 6);
        assert!(stats.to_string().contains("Allocations:     10"));
    }

    #[test]
    fn test_summary_contains_is_half_open() {
        let row = RegionSummary {
            id: 1,
            start: 0x1000,
            end: 0x2000,
            capacity: 0xF00,
            used: 0,
            pinned: false,
        };
        assert!(row.contains(0x1000));
        assert!(row.contains(0x1FFF));
        assert!(!row.contains(0x2000));
        assert!(row.to_string().starts_with("region    1"));
    }
}
