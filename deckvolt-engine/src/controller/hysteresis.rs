//! Input hysteresis for the control loop

/// Suppresses re-targeting until the input moves by at least `band`
///
/// The comparison is against the input at the last *applied* change, not the
/// previous sample, so slow drift still triggers once it accumulates.
#[derive(Debug, Clone)]
pub struct HysteresisGate {
    band: f64,
    last_applied_input: Option<f64>,
}

impl HysteresisGate {
    pub fn new(band: f64) -> Self {
        Self {
            band: band.max(0.0),
            last_applied_input: None,
        }
    }

    /// Whether `input` moved far enough to re-target; records it if so
    pub fn should_apply(&mut self, input: f64) -> bool {
        match self.last_applied_input {
            Some(last) if (input - last).abs() < self.band => false,
            _ => {
                self.last_applied_input = Some(input);
                true
            }
        }
    }

    pub fn last_applied_input(&self) -> Option<f64> {
        self.last_applied_input
    }

    /// Next input applies unconditionally
    pub fn reset(&mut self) {
        self.last_applied_input = None;
    }

    pub fn set_band(&mut self, band: f64) {
        self.band = band.max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_input_always_applies() {
        let mut gate = HysteresisGate::new(5.0);
        assert!(gate.should_apply(42.0));
        assert_eq!(gate.last_applied_input(), Some(42.0));
    }

    #[test]
    fn test_small_moves_suppressed_until_band_reached() {
        let mut gate = HysteresisGate::new(5.0);
        gate.should_apply(50.0);
        assert!(!gate.should_apply(52.0));
        assert!(!gate.should_apply(54.9));
        assert!(!gate.should_apply(46.0));
        assert!(gate.should_apply(55.0));
        assert!(!gate.should_apply(51.0));
        assert!(gate.should_apply(49.0));
    }

    #[test]
    fn test_reset_and_band_change() {
        let mut gate = HysteresisGate::new(100.0);
        gate.should_apply(1600.0);
        assert!(!gate.should_apply(1650.0));
        gate.set_band(10.0);
        assert!(gate.should_apply(1650.0));
        gate.reset();
        assert!(gate.should_apply(1651.0));
    }
}
