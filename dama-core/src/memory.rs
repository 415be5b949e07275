//! Memory budget used to size chunks

use sysinfo::System;
use tracing::debug;

/// Bytes a single chunk of every group may occupy together
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryBudget {
    /// Bytes considered available
    available_bytes: usize,

    /// Fraction of the available bytes that may be used, in `(0, 1]`
    memory_allowed: f64,
}

impl MemoryBudget {
    /// Measure available memory from the operating system
    pub fn from_system(memory_allowed: f64) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let available = usize::try_from(system.available_memory()).unwrap_or(usize::MAX);
        debug!(available, memory_allowed, "Measured available memory");
        Self::fixed(available, memory_allowed)
    }

    /// Use a fixed number of available bytes
    pub fn fixed(available_bytes: usize, memory_allowed: f64) -> Self {
        Self {
            available_bytes,
            memory_allowed: memory_allowed.clamp(f64::MIN_POSITIVE, 1.0),
        }
    }

    /// Bytes considered available
    pub fn available_bytes(&self) -> usize {
        self.available_bytes
    }

    /// Fraction of available memory that may be used
    pub fn memory_allowed(&self) -> f64 {
        self.memory_allowed
    }

    /// Usable bytes
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn allowed_bytes(&self) -> usize {
        (self.available_bytes as f64 * self.memory_allowed) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_bytes_scales() {
        let budget = MemoryBudget::fixed(1000, 0.9);
        assert_eq!(budget.allowed_bytes(), 900);
        assert_eq!(MemoryBudget::fixed(1000, 7.0).allowed_bytes(), 1000);
    }

    #[test]
    fn test_system_budget_is_positive() {
        assert!(MemoryBudget::from_system(0.5).available_bytes() > 0);
    }
}
