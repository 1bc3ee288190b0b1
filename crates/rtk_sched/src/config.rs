use rtk_params::{BRINGUP_SPIN_LIMIT, MAX_CPUS};

/// Runtime configuration of a [`Kernel`](crate::Kernel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of cores taking part in scheduling.
    pub num_cpus: usize,
    /// Ticks a thread runs before yielding to an equal-priority peer.
    ///
    /// `0` disables time slicing.
    pub time_slice_ticks: u32,
    /// Iterations the primary core polls a starting core's `alive` flag.
    pub bringup_spin_limit: u64,
    /// Re-check other cores after a reschedule pass displaced a thread.
    pub ipi_cascade: bool,
    /// Enable the reschedule channel of a core as part of its bring-up.
    pub arm_ipi_on_bringup: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

impl KernelConfig {
    /// # Panics
    ///
    /// Panics if `num_cpus` is zero or exceeds [`MAX_CPUS`].
    #[must_use]
    pub const fn new(num_cpus: usize) -> Self {
        assert!(num_cpus > 0 && num_cpus <= MAX_CPUS);
        Self {
            num_cpus,
            time_slice_ticks: 0,
            bringup_spin_limit: BRINGUP_SPIN_LIMIT,
            ipi_cascade: true,
            arm_ipi_on_bringup: true,
        }
    }

    #[must_use]
    pub const fn with_time_slice(mut self, ticks: u32) -> Self {
        self.time_slice_ticks = ticks;
        self
    }

    #[must_use]
    pub const fn with_bringup_spin_limit(mut self, limit: u64) -> Self {
        self.bringup_spin_limit = limit;
        self
    }

    #[must_use]
    pub const fn with_ipi_cascade(mut self, enabled: bool) -> Self {
        self.ipi_cascade = enabled;
        self
    }

    #[must_use]
    pub const fn with_arm_ipi_on_bringup(mut self, enabled: bool) -> Self {
        self.arm_ipi_on_bringup = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        const CONFIG: KernelConfig = KernelConfig::new(4)
            .with_time_slice(5)
            .with_ipi_cascade(false)
            .with_bringup_spin_limit(10);
        assert_eq!(CONFIG.num_cpus, 4);
        assert_eq!(CONFIG.time_slice_ticks, 5);
        assert!(!CONFIG.ipi_cascade);
        assert!(CONFIG.arm_ipi_on_bringup);
        assert_eq!(CONFIG.bringup_spin_limit, 10);
    }

    #[test]
    #[should_panic]
    fn zero_cpus_is_rejected() {
        let _ = KernelConfig::new(0);
    }
}
