//! CPU and memory negotiation against host bounds and persisted state.
//!
//! A VM restarted without explicit sizing reproduces its last validated
//! dimensions, while still respecting a host that has since shrunk.

/// Default vCPU count for a new VM.
pub const DEFAULT_CPUS: u32 = 1;

/// Default guest memory for a new VM (1 GiB).
pub const DEFAULT_MEMORY: u64 = 1 << 30;

/// Default root disk size for a new VM (4 GiB).
pub const DEFAULT_DISK_SIZE: u64 = 1 << 32;

/// Inclusive `[min, max]` range reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds<T> {
    pub min: T,
    pub max: T,
}

impl<T: Ord + Copy> Bounds<T> {
    pub fn new(min: T, max: T) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, value: T) -> T {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else {
            value
        }
    }
}

/// Outcome of a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated<T> {
    pub value: T,
    /// The value differs from what is on disk (or nothing is on disk).
    pub persist: bool,
}

/// Reconcile a requested value with host bounds and persisted state.
///
/// `requested` of zero means unset. A `persisted` value of zero is treated as
/// absent.
pub fn negotiate<T>(requested: T, persisted: Option<T>, default: T, bounds: Bounds<T>) -> Negotiated<T>
where
    T: Ord + Copy + Default,
{
    let unset = T::default();
    let candidate = if requested != unset {
        requested
    } else {
        match persisted.filter(|v| *v != unset) {
            Some(v) => v,
            None => {
                return Negotiated {
                    value: bounds.clamp(default),
                    persist: true,
                };
            }
        }
    };

    let clamped = bounds.clamp(candidate);
    Negotiated {
        value: clamped,
        persist: clamped != candidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPU: Bounds<u32> = Bounds { min: 1, max: 8 };
    const MEM: Bounds<u64> = Bounds {
        min: 256 << 20,
        max: 8 << 30,
    };

    #[test]
    fn clamp_respects_both_edges() {
        assert_eq!(CPU.clamp(0), 1);
        assert_eq!(CPU.clamp(4), 4);
        assert_eq!(CPU.clamp(64), 8);
        assert_eq!(CPU.clamp(1), 1);
        assert_eq!(CPU.clamp(8), 8);
    }

    #[test]
    fn result_always_within_bounds() {
        for min in 1u32..5 {
            for max in min..10 {
                let bounds = Bounds::new(min, max);
                for requested in 0..16 {
                    for persisted in [None, Some(0), Some(3), Some(20)] {
                        let n = negotiate(requested, persisted, DEFAULT_CPUS, bounds);
                        assert!(
                            (min..=max).contains(&n.value),
                            "negotiate({requested}, {persisted:?}) in [{min},{max}] gave {}",
                            n.value
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn explicit_value_inside_bounds_is_not_persisted() {
        let n = negotiate(4, Some(2), DEFAULT_CPUS, CPU);
        assert_eq!(n, Negotiated { value: 4, persist: false });
    }

    #[test]
    fn explicit_value_clamped_is_persisted() {
        let n = negotiate(32, None, DEFAULT_CPUS, CPU);
        assert_eq!(n, Negotiated { value: 8, persist: true });
    }

    #[test]
    fn unset_reuses_persisted_value() {
        let n = negotiate(0, Some(3), DEFAULT_CPUS, CPU);
        assert_eq!(n, Negotiated { value: 3, persist: false });
    }

    #[test]
    fn persisted_value_clamped_to_smaller_host() {
        let n = negotiate(0, Some(12), DEFAULT_CPUS, CPU);
        assert_eq!(n, Negotiated { value: 8, persist: true });
    }

    #[test]
    fn unset_without_history_persists_default_even_if_unchanged() {
        let n = negotiate(0, None, DEFAULT_MEMORY, MEM);
        assert_eq!(n, Negotiated { value: DEFAULT_MEMORY, persist: true });
    }

    #[test]
    fn default_is_clamped_up_to_host_minimum() {
        let n = negotiate(0, Some(0), DEFAULT_CPUS, Bounds::new(2, 8));
        assert_eq!(n, Negotiated { value: 2, persist: true });
    }
}
