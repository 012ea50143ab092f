//! Confidence reporter.

use crate::profile::CustomerProfile;

/// Decimal places kept in presented confidences.
pub const PRECISION: i32 = 2;

/// Map one raw confidence into the presentation range `[0, 1]`, rounded to
/// `PRECISION` places. Non-finite values present as 0.
pub fn present_confidence(value: f32) -> f32 {
    if !value.is_finite() {
        return 0.0;
    }
    let scale = 10f32.powi(PRECISION);
    (value.clamp(0.0, 1.0) * scale).round() / scale
}

/// Same profile with every confidence presented; labels are untouched.
pub fn present(profile: CustomerProfile) -> CustomerProfile {
    profile.map_confidences(present_confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionConfig;
    use crate::fusion::FusionEngine;
    use crate::profile::Category;

    #[test]
    fn rounds_and_clamps() {
        assert_eq!(present_confidence(0.456), 0.46);
        assert_eq!(present_confidence(0.454), 0.45);
        assert_eq!(present_confidence(1.7), 1.0);
        assert_eq!(present_confidence(-0.2), 0.0);
        assert_eq!(present_confidence(f32::NAN), 0.0);
        assert_eq!(present_confidence(f32::INFINITY), 0.0);
    }

    #[test]
    fn labels_survive_presentation() {
        let raw = FusionEngine::new(&FusionConfig::default()).no_person();
        let shown = present(raw.clone());
        for c in Category::ALL {
            assert_eq!(shown.label(c), raw.label(c));
        }
        assert_eq!(shown.fallback_used, raw.fallback_used);
    }
}
