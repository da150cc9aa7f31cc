//! Loopback decision: resample a level from the previous level's output or
//! from the original full-resolution volume.
//!
//! This is a pure function of its inputs so two runs over the same volume and
//! schedule produce byte-identical pyramids. Resampling from the original
//! gives the best numerical fidelity (each loopback hop accumulates box-filter
//! rounding), so loopback is only chosen when re-reading the original would be
//! disproportionately expensive.

/// Loopback wins once the original would supply this many times more voxels
/// than the previous level for the same output block.
pub const LOOPBACK_FACTOR_RATIO: u64 = 8;

/// A lazily-decoded source may page in at most this fraction of the memory
/// ceiling per output block before loopback takes over.
pub const LAZY_WORKING_SET_DIVISOR: u64 = 4;

/// Decide whether level `level_index` should resample from the previous
/// level's output instead of the original volume.
///
/// `lazy_plane_size_bytes` is `Some(bytes of one decoded z-plane)` for
/// lazily-decoded sources and `None` for fully resident ones.
pub fn use_loopback(
    level_index: usize,
    factors_to_original: [u32; 3],
    factors_to_previous: [u32; 3],
    chunk_shape: [usize; 3],
    lazy_plane_size_bytes: Option<u64>,
    memory_ceiling_bytes: u64,
) -> bool {
    // Level 0 has no previous level to loop back to.
    if level_index == 0 {
        return false;
    }

    let to_original = element_count(factors_to_original);
    let to_previous = element_count(factors_to_previous).max(1);
    if to_original / to_previous >= LOOPBACK_FACTOR_RATIO {
        return true;
    }

    // A lazy source pages in whole planes; estimate the original-resolution
    // bytes needed to produce one output block along the slowest axis.
    if let Some(plane_bytes) = lazy_plane_size_bytes {
        let working_set =
            plane_bytes * factors_to_original[2] as u64 * chunk_shape[2] as u64;
        if working_set > memory_ceiling_bytes / LAZY_WORKING_SET_DIVISOR {
            return true;
        }
    }

    false
}

fn element_count(factors: [u32; 3]) -> u64 {
    factors.iter().map(|&f| f as u64).product()
}
