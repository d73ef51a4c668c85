//! Acceptance filter computation
//!
//! The logical filter is a (code, mask) pair in identifier space where set mask
//! bits are "don't care". Protocol modules pack it for their hardware.

use canlink_core::{is_accept_all, MAX_EXTENDED_ID, MAX_STANDARD_ID};

/// Code/mask pair; a set mask bit means the identifier bit is ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptanceFilter {
    pub code: u32,
    pub mask: u32,
    pub extended: bool,
}

impl AcceptanceFilter {
    /// Filter that lets every identifier through
    pub fn accept_all(extended: bool) -> Self {
        Self {
            code: 0,
            mask: id_width(extended),
            extended,
        }
    }

    /// Smallest single code/mask window covering every id in `ids`
    pub fn compute(ids: &[u32], extended: bool) -> Self {
        if is_accept_all(ids) {
            return Self::accept_all(extended);
        }
        let width = id_width(extended);
        let all_ones = ids.iter().fold(width, |acc, id| acc & id);
        let any_ones = ids.iter().fold(0, |acc, id| acc | id);
        Self {
            code: all_ones & width,
            mask: (any_ones ^ all_ones) & width,
            extended,
        }
    }

    pub fn is_accept_all(&self) -> bool {
        self.mask & id_width(self.extended) == id_width(self.extended)
    }

    /// Whether `id` passes this window
    pub fn matches(&self, id: u32) -> bool {
        (id & !self.mask) == (self.code & !self.mask)
    }

    /// Mask with the inverse convention: set bits must match
    pub fn must_match_mask(&self) -> u32 {
        !self.mask & id_width(self.extended)
    }
}

fn id_width(extended: bool) -> u32 {
    if extended {
        MAX_EXTENDED_ID
    } else {
        MAX_STANDARD_ID
    }
}

/// 11-bit acceptance filter for `ids`
pub fn compute_filter(ids: &[u32]) -> AcceptanceFilter {
    AcceptanceFilter::compute(ids, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_all_inputs() {
        let all = AcceptanceFilter::accept_all(false);
        assert_eq!(compute_filter(&[]), all);
        assert_eq!(compute_filter(&[0]), all);
        assert!(all.is_accept_all());
        assert!(all.matches(0x123));
    }

    #[test]
    fn test_mask_is_differing_bits() {
        let filter = compute_filter(&[0x100, 0x200]);
        assert_eq!(filter.mask, 0x100 ^ 0x200);
        assert_eq!(filter.code, 0);
        assert!(filter.matches(0x100));
        assert!(filter.matches(0x200));
        assert!(!filter.matches(0x101));
    }

    #[test]
    fn test_single_id_exact() {
        let filter = compute_filter(&[0x7E8]);
        assert_eq!(filter.code, 0x7E8);
        assert_eq!(filter.mask, 0);
        assert_eq!(filter.must_match_mask(), 0x7FF);
    }

    #[test]
    fn test_extended_width() {
        let filter = AcceptanceFilter::compute(&[0x18DA_F110, 0x18DA_F111], true);
        assert_eq!(filter.code, 0x18DA_F110);
        assert_eq!(filter.mask, 0x1);
        assert_eq!(AcceptanceFilter::accept_all(true).mask, MAX_EXTENDED_ID);
    }
}
