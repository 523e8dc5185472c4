//! Offset distributions.
//!
//! A distribution converts between the physical offsets a server stores and
//! the absolute logical offsets clients speak. Both directions are needed by
//! the lock manager: extents arrive physical, while progress boundaries
//! (`final_offset`, `wait_offset`) are absolute logical.

use std::fmt::Debug;

/// Mapping between per-server physical offsets and absolute logical offsets.
pub trait Distribution: Debug + Send + Sync {
    /// Absolute logical offset of physical offset `phys` on this server.
    fn physical_to_logical(&self, phys: i64) -> i64;

    /// Physical offset on this server holding logical offset `logical`, or
    /// the next physical offset after it when `logical` lands on another
    /// server.
    fn logical_to_physical(&self, logical: i64) -> i64;
}

/// Whole file on one server; physical and logical offsets coincide.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteContiguous;

impl Distribution for ByteContiguous {
    fn physical_to_logical(&self, phys: i64) -> i64 {
        phys
    }

    fn logical_to_physical(&self, logical: i64) -> i64 {
        logical
    }
}

/// Round-robin striping across `server_count` servers in units of
/// `stripe_size` bytes; this server holds stripe `server_nr` of each round.
#[derive(Debug, Clone, Copy)]
pub struct SimpleStripe {
    /// Bytes per stripe unit.
    pub stripe_size: i64,
    /// Number of servers in the distribution.
    pub server_count: i64,
    /// Index of this server within the round.
    pub server_nr: i64,
}

impl SimpleStripe {
    /// Stripe distribution; `stripe_size` and `server_count` must be
    /// positive and `server_nr` in range.
    pub fn new(stripe_size: i64, server_count: i64, server_nr: i64) -> SimpleStripe {
        debug_assert!(stripe_size > 0 && server_count > 0);
        debug_assert!((0..server_count).contains(&server_nr));
        SimpleStripe {
            stripe_size,
            server_count,
            server_nr,
        }
    }
}

impl Distribution for SimpleStripe {
    fn physical_to_logical(&self, phys: i64) -> i64 {
        let round = phys / self.stripe_size;
        let within = phys % self.stripe_size;
        (round * self.server_count + self.server_nr) * self.stripe_size + within
    }

    fn logical_to_physical(&self, logical: i64) -> i64 {
        let global_stripe = logical / self.stripe_size;
        let within = logical % self.stripe_size;
        let round = global_stripe / self.server_count;
        let holder = global_stripe % self.server_count;
        if holder == self.server_nr {
            round * self.stripe_size + within
        } else if holder < self.server_nr {
            // our stripe in this round starts after the probe
            round * self.stripe_size
        } else {
            (round + 1) * self.stripe_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_is_identity() {
        let d = ByteContiguous;
        assert_eq!(d.physical_to_logical(1234), 1234);
        assert_eq!(d.logical_to_physical(1234), 1234);
    }

    #[test]
    fn stripe_round_trips_own_offsets() {
        let d = SimpleStripe::new(64 * 1024, 4, 2);
        for phys in [0, 1, 65535, 65536, 1 << 20] {
            let logical = d.physical_to_logical(phys);
            assert_eq!(d.logical_to_physical(logical), phys);
        }
    }

    #[test]
    fn stripe_maps_foreign_offsets_forward() {
        // stripe 100, 2 servers, we are server 0: we hold [0,100), [200,300)...
        let d = SimpleStripe::new(100, 2, 0);
        assert_eq!(d.physical_to_logical(0), 0);
        assert_eq!(d.physical_to_logical(100), 200);
        // logical 150 lives on server 1; our next physical offset is 100
        assert_eq!(d.logical_to_physical(150), 100);
    }
}
