//! Conversion of raw sensor readings into kilograms.
//!
//! Each axis is piecewise linear between its 0 kg, 17 kg and 34 kg
//! calibration points. Readings below the zero point count as empty.

use thiserror::Error;

use crate::calibration::{AxisPoints, CalibrationPoints};
use crate::protocol::SENSOR_COUNT;

/// Load, in kilograms, of the middle calibration point.
pub const HALF_LOAD: f64 = 17.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MassError {
    /// Two calibration points that must bound a segment do not.
    #[error("axis {axis}: calibration span {lower}..{upper} is empty or inverted")]
    DegenerateSpan { axis: usize, lower: u16, upper: u16 },
}

/// Mass carried by one axis.
pub fn axis_mass(axis: usize, point: u16, cal: AxisPoints) -> Result<f64, MassError> {
    let AxisPoints { zero, half, full } = cal;

    if point < zero {
        return Ok(0.0);
    }

    if point < half {
        // zero <= point < half, so the span is never empty here
        let span = f64::from(half - zero);
        return Ok(f64::from(point - zero) * HALF_LOAD / span);
    }

    if full <= half {
        return Err(MassError::DegenerateSpan {
            axis,
            lower: half,
            upper: full,
        });
    }

    let span = f64::from(full - half);
    Ok(f64::from(point - half) * HALF_LOAD / span + HALF_LOAD)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MassReading {
    pub axes: [f64; SENSOR_COUNT],
    pub total: f64,
    /// Axes whose calibration could not be applied; their mass is reported as zero.
    pub faults: [Option<MassError>; SENSOR_COUNT],
}

impl MassReading {
    pub fn compute(sensors: &[u16; SENSOR_COUNT], cal: &CalibrationPoints) -> Self {
        let mut axes = [0.0; SENSOR_COUNT];
        let mut faults = [None; SENSOR_COUNT];

        for (i, (&point, &points)) in sensors.iter().zip(cal.axes.iter()).enumerate() {
            match axis_mass(i, point, points) {
                Ok(mass) => axes[i] = mass,
                Err(e) => faults[i] = Some(e),
            }
        }

        Self {
            axes,
            total: axes.iter().fold(0.0, |sum, m| sum + m),
            faults,
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.faults.iter().any(Option::is_some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAL: AxisPoints = AxisPoints {
        zero: 100,
        half: 200,
        full: 300,
    };

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn below_zero_point_is_empty() {
        assert_eq!(axis_mass(0, 50, CAL), Ok(0.0));
        assert_eq!(axis_mass(0, 0, CAL), Ok(0.0));
    }

    #[test]
    fn lower_segment() {
        assert!(close(axis_mass(0, 150, CAL).unwrap(), 8.5));
    }

    #[test]
    fn upper_segment() {
        assert!(close(axis_mass(0, 250, CAL).unwrap(), 25.5));
        assert!(close(axis_mass(0, 300, CAL).unwrap(), 34.0));
        // extrapolates past the full point
        assert!(close(axis_mass(0, 400, CAL).unwrap(), 51.0));
    }

    #[test]
    fn continuous_at_calibration_points() {
        assert!(close(axis_mass(0, 100, CAL).unwrap(), 0.0));
        assert!(close(axis_mass(0, 200, CAL).unwrap(), 17.0));
        let just_below_half = axis_mass(0, 199, CAL).unwrap();
        assert!(just_below_half < 17.0 && just_below_half > 16.8);
    }

    #[test]
    fn monotonic_over_the_whole_range() {
        let cal = AxisPoints {
            zero: 1_000,
            half: 2_500,
            full: 6_000,
        };
        let mut last = 0.0;
        for point in (0..=u16::MAX).step_by(7) {
            let mass = axis_mass(0, point, cal).unwrap();
            assert!(mass >= last, "mass dropped at {point}");
            last = mass;
        }
    }

    #[test]
    fn equal_half_and_full_is_degenerate() {
        let cal = AxisPoints {
            zero: 100,
            half: 200,
            full: 200,
        };
        assert_eq!(
            axis_mass(2, 250, cal),
            Err(MassError::DegenerateSpan {
                axis: 2,
                lower: 200,
                upper: 200
            })
        );
        // the lower segment is still usable
        assert!(close(axis_mass(2, 150, cal).unwrap(), 8.5));
    }

    #[test]
    fn equal_zero_and_half_skips_lower_segment() {
        let cal = AxisPoints {
            zero: 100,
            half: 100,
            full: 200,
        };
        assert!(close(axis_mass(0, 100, cal).unwrap(), 17.0));
        assert!(close(axis_mass(0, 150, cal).unwrap(), 25.5));
    }

    #[test]
    fn four_equal_axes_sum() {
        let cal = CalibrationPoints { axes: [CAL; 4] };
        let reading = MassReading::compute(&[150; 4], &cal);
        assert_eq!(reading.axes, [8.5; 4]);
        assert!(close(reading.total, 34.0));
        assert!(!reading.is_faulted());
    }

    #[test]
    fn faulted_axis_counts_as_zero() {
        let broken = AxisPoints {
            zero: 100,
            half: 200,
            full: 150,
        };
        let cal = CalibrationPoints {
            axes: [CAL, broken, CAL, CAL],
        };
        let reading = MassReading::compute(&[250; 4], &cal);

        assert!(reading.is_faulted());
        assert_eq!(reading.axes[1], 0.0);
        assert!(reading.faults[1].is_some());
        assert!(close(reading.total, 3.0 * 25.5));
    }
}
