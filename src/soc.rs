//! Aggregate state of charge over several ESS.

use crate::domain::ManagedEss;

/// Builder accumulating SoC readings.
///
/// If every device that reports a SoC also reports a capacity, the result is
/// the capacity-weighted mean. Otherwise it is the plain mean over all
/// reported SoC values. `None` means unknown, never 0 %.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalculateSoc {
    weighted_sum: f64,
    capacity_sum: f64,
    soc_sum: f64,
    soc_count: u32,
    missing_capacity: bool,
}

impl CalculateSoc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<'a, E>(self, devices: impl IntoIterator<Item = &'a E>) -> Self
    where
        E: ManagedEss + ?Sized + 'a,
    {
        devices
            .into_iter()
            .fold(self, |acc, ess| acc.add_reading(ess.soc(), ess.capacity()))
    }

    pub fn add_reading(mut self, soc: Option<i32>, capacity: Option<i32>) -> Self {
        let Some(soc) = soc else {
            return self;
        };
        self.soc_sum += soc as f64;
        self.soc_count += 1;
        match capacity {
            Some(capacity) if capacity > 0 => {
                self.weighted_sum += soc as f64 * capacity as f64;
                self.capacity_sum += capacity as f64;
            }
            _ => self.missing_capacity = true,
        }
        self
    }

    pub fn calculate(&self) -> Option<i32> {
        if self.soc_count == 0 {
            return None;
        }
        let soc = if self.missing_capacity || self.capacity_sum <= 0.0 {
            self.soc_sum / self.soc_count as f64
        } else {
            self.weighted_sum / self.capacity_sum
        };
        Some(soc.round() as i32)
    }
}
