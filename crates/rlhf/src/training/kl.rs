//! KL coefficient controllers.

use crate::config::PpoConfig;

/// Owns the KL penalty coefficient and adjusts it after each round.
pub trait KlController: Send {
    /// Current coefficient
    fn value(&self) -> f64;

    /// Update from the round's mean KL and the number of samples it covered.
    fn update(&mut self, current_kl: f64, n_steps: usize);
}

/// Proportional controller steering the observed KL toward `target`.
///
/// `error = clip(kl / target - 1, -0.2, 0.2)`, then
/// `value *= 1 + error * n_steps / horizon`.
#[derive(Clone, Debug)]
pub struct AdaptiveKlController {
    value: f64,
    target: f64,
    horizon: f64,
    bounds: Option<(f64, f64)>,
}

impl AdaptiveKlController {
    /// Largest relative error the controller acts on
    pub const ERROR_CLIP: f64 = 0.2;

    pub fn new(init_kl_coef: f64, target: f64, horizon: f64) -> Self {
        Self {
            value: init_kl_coef,
            target,
            horizon,
            bounds: None,
        }
    }

    /// Keep the coefficient within `[min, max]` after every update.
    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.bounds = Some((min, max));
        self
    }

    pub fn target(&self) -> f64 {
        self.target
    }
}

impl KlController for AdaptiveKlController {
    fn value(&self) -> f64 {
        self.value
    }

    fn update(&mut self, current_kl: f64, n_steps: usize) {
        let error = (current_kl / self.target - 1.0).clamp(-Self::ERROR_CLIP, Self::ERROR_CLIP);
        let mult = 1.0 + error * n_steps as f64 / self.horizon;
        self.value *= mult;
        if let Some((min, max)) = self.bounds {
            self.value = self.value.clamp(min, max);
        }
        tracing::debug!(current_kl, error, kl_coef = self.value, "KL controller update");
    }
}

/// Constant coefficient; `update` is a no-op.
#[derive(Clone, Debug)]
pub struct FixedKlController {
    value: f64,
}

impl FixedKlController {
    pub fn new(kl_coef: f64) -> Self {
        Self { value: kl_coef }
    }
}

impl KlController for FixedKlController {
    fn value(&self) -> f64 {
        self.value
    }

    fn update(&mut self, _current_kl: f64, _n_steps: usize) {}
}

/// Controller selected by `adap_kl_ctrl`.
pub fn from_config(config: &PpoConfig) -> Box<dyn KlController> {
    if config.adap_kl_ctrl {
        let mut controller =
            AdaptiveKlController::new(config.init_kl_coef, config.target, config.horizon);
        if let Some((min, max)) = config.kl_coef_bounds {
            controller = controller.with_bounds(min, max);
        }
        Box::new(controller)
    } else {
        Box::new(FixedKlController::new(config.init_kl_coef))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_above_target_increases() {
        let mut ctrl = AdaptiveKlController::new(0.2, 6.0, 10000.0);
        ctrl.update(7.0, 256);
        assert!(ctrl.value() > 0.2);
    }

    #[test]
    fn test_below_target_decreases() {
        let mut ctrl = AdaptiveKlController::new(0.2, 6.0, 10000.0);
        ctrl.update(5.0, 256);
        assert!(ctrl.value() < 0.2);
    }

    #[test]
    fn test_at_target_unchanged() {
        let mut ctrl = AdaptiveKlController::new(0.2, 6.0, 10000.0);
        ctrl.update(6.0, 256);
        assert_eq!(ctrl.value(), 0.2);
    }

    #[test]
    fn test_error_is_clipped() {
        let mut far = AdaptiveKlController::new(0.2, 6.0, 10000.0);
        let mut near = AdaptiveKlController::new(0.2, 6.0, 10000.0);
        far.update(600.0, 256);
        near.update(6.0 * 1.2, 256);
        assert!((far.value() - near.value()).abs() < 1e-12);

        let expected = 0.2 * (1.0 + 0.2 * 256.0 / 10000.0);
        assert!((far.value() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_negative_kl_clips_low() {
        let mut ctrl = AdaptiveKlController::new(0.2, 6.0, 10000.0);
        ctrl.update(-3.0, 256);
        let expected = 0.2 * (1.0 - 0.2 * 256.0 / 10000.0);
        assert!((ctrl.value() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_bounds_clamp() {
        let mut ctrl = AdaptiveKlController::new(0.2, 6.0, 10.0).with_bounds(0.1, 0.25);
        for _ in 0..10 {
            ctrl.update(100.0, 256);
        }
        assert_eq!(ctrl.value(), 0.25);
        for _ in 0..50 {
            ctrl.update(0.0, 256);
        }
        assert_eq!(ctrl.value(), 0.1);
    }

    #[test]
    fn test_fixed_never_moves() {
        let mut ctrl = FixedKlController::new(0.3);
        ctrl.update(100.0, 256);
        assert_eq!(ctrl.value(), 0.3);
    }

    #[test]
    fn test_from_config() {
        let config = PpoConfig::default();
        assert_eq!(from_config(&config).value(), config.init_kl_coef);

        let fixed = PpoConfig {
            adap_kl_ctrl: false,
            ..PpoConfig::default()
        };
        let mut ctrl = from_config(&fixed);
        ctrl.update(100.0, 256);
        assert_eq!(ctrl.value(), fixed.init_kl_coef);
    }
}
