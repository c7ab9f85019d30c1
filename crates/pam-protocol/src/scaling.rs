//! Display-unit scaling for throttle readings
//!
//! Raw W/WA/WB values are millivolts under a voltage throttle and controller
//! counts under a current throttle. Displays show volts or a 4-20 mA loop.

use crate::{AinUnit, Function};

/// Lower bound of the current loop, in mA
pub const LOOP_MIN_MA: f64 = 4.0;
/// Upper bound of the current loop, in mA
pub const LOOP_MAX_MA: f64 = 20.0;

/// Convert a raw throttle reading into display units
///
/// Returns `None` when the throttle unit is unknown.
pub fn scale_value(raw: f64, unit: Option<AinUnit>, function: Function) -> Option<f64> {
    match unit? {
        AinUnit::V => Some(raw / 1000.0),
        AinUnit::C => match function {
            Function::Dual => Some(raw * 0.0016 + LOOP_MIN_MA),
            Function::Single => Some((raw * 0.0008 + 12.0).clamp(LOOP_MIN_MA, LOOP_MAX_MA)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_voltage_scaling() {
        let v = scale_value(2500.0, Some(AinUnit::V), Function::Dual).unwrap();
        assert!(approx(v, 2.5));
    }

    #[test]
    fn test_current_scaling_dual() {
        let v = scale_value(10_000.0, Some(AinUnit::C), Function::Dual).unwrap();
        assert!(approx(v, 20.0));
        let v = scale_value(0.0, Some(AinUnit::C), Function::Dual).unwrap();
        assert!(approx(v, 4.0));
    }

    #[test]
    fn test_current_scaling_single_is_clamped() {
        let mid = scale_value(0.0, Some(AinUnit::C), Function::Single).unwrap();
        assert!(approx(mid, 12.0));
        let high = scale_value(50_000.0, Some(AinUnit::C), Function::Single).unwrap();
        assert!(approx(high, 20.0));
        let low = scale_value(-50_000.0, Some(AinUnit::C), Function::Single).unwrap();
        assert!(approx(low, 4.0));
    }

    #[test]
    fn test_unknown_unit() {
        assert_eq!(scale_value(1.0, None, Function::Single), None);
    }
}
