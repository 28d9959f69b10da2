//! The motion model.
//!
//! Tracks position/unit/relative-mode bookkeeping and computes how long a
//! move should take; the actual "blocking while the move executes" part is
//! driven by [`crate::device`]'s move-queue worker, which sleeps for the
//! duration this module computes in slices so shutdown can be observed.

use crate::config::Speeds;

#[derive(Debug, Clone, Copy, Default)]
pub struct Axes {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub e: Option<f64>,
}

pub struct MotionState {
    pub last: Axes,
    pub relative: bool,
    /// 1.0 for mm, 1/2.54 for inches.
    pub unit_modifier: f64,
    pub speeds: Speeds,
}

impl MotionState {
    pub fn new(speeds: Speeds) -> Self {
        Self {
            last: Axes::default(),
            relative: false,
            unit_modifier: 1.0,
            speeds,
        }
    }

    /// Converts all known last-position values between mm and inches,
    /// preserving their *physical* position across a `G20`/`G21` unit
    /// toggle. The stored position is scaled by the inverse of the unit
    /// modifier change, so a later toggle back restores the original value.
    pub fn set_unit_modifier(&mut self, unit_modifier: f64) {
        let factor = unit_modifier / self.unit_modifier;
        self.last.x = self.last.x.map(|v| v * self.unit_modifier_position_factor(factor));
        self.last.y = self.last.y.map(|v| v * self.unit_modifier_position_factor(factor));
        self.last.z = self.last.z.map(|v| v * self.unit_modifier_position_factor(factor));
        self.last.e = self.last.e.map(|v| v * self.unit_modifier_position_factor(factor));
        self.unit_modifier = unit_modifier;
    }

    // Position scales with the inverse of the unit_modifier change: G20
    // (mm->inch display) multiplies the stored position by 2.54, G21
    // divides it.
    fn unit_modifier_position_factor(&self, unit_modifier_change: f64) -> f64 {
        1.0 / unit_modifier_change
    }

    /// Computes the duration (seconds) a `G0`/`G1`/`G2`/`G3` move with the
    /// given axis values should take, and updates `last` for axes that were
    /// mentioned. The duration is the max across mentioned axes.
    pub fn apply_move(&mut self, mentioned: Axes) -> f64 {
        let mut duration = 0.0_f64;
        duration = duration.max(self.axis_duration(mentioned.x, self.last.x, self.speeds.x));
        duration = duration.max(self.axis_duration(mentioned.y, self.last.y, self.speeds.y));
        duration = duration.max(self.axis_duration(mentioned.z, self.last.z, self.speeds.z));
        duration = duration.max(self.axis_duration(mentioned.e, self.last.e, self.speeds.e));

        if let Some(v) = mentioned.x {
            self.last.x = Some(v);
        }
        if let Some(v) = mentioned.y {
            self.last.y = Some(v);
        }
        if let Some(v) = mentioned.z {
            self.last.z = Some(v);
        }
        if let Some(v) = mentioned.e {
            self.last.e = Some(v);
        }

        duration
    }

    fn axis_duration(&self, value: Option<f64>, last: Option<f64>, speed: f64) -> f64 {
        let Some(value) = value else {
            return 0.0;
        };
        let delta = if self.relative || last.is_none() {
            value
        } else {
            value - last.unwrap()
        };
        delta * self.unit_modifier / speed * 60.0
    }

    /// `G92`: sets position directly. An empty axis set resets every axis
    /// to zero (the origin).
    pub fn set_position(&mut self, mentioned: Axes) {
        if mentioned.x.is_none()
            && mentioned.y.is_none()
            && mentioned.z.is_none()
            && mentioned.e.is_none()
        {
            self.last = Axes {
                x: Some(0.0),
                y: Some(0.0),
                z: Some(0.0),
                e: Some(0.0),
            };
            return;
        }
        if let Some(v) = mentioned.x {
            self.last.x = Some(v);
        }
        if let Some(v) = mentioned.y {
            self.last.y = Some(v);
        }
        if let Some(v) = mentioned.z {
            self.last.z = Some(v);
        }
        if let Some(v) = mentioned.e {
            self.last.e = Some(v);
        }
    }

    /// Renders the `M114` position report body.
    pub fn report(&self) -> String {
        format!(
            "C: X:{} Y:{} Z:{} E:{}",
            fmt_axis(self.last.x),
            fmt_axis(self.last.y),
            fmt_axis(self.last.z),
            fmt_axis(self.last.e)
        )
    }
}

fn fmt_axis(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{:.2}", v),
        None => "None".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_first_sighting_uses_raw_value() {
        let mut m = MotionState::new(Speeds::default());
        let duration = m.apply_move(Axes {
            x: Some(10.0),
            ..Default::default()
        });
        // 10mm at 6000mm/min -> 0.1 min -> 6s
        assert!((duration - 0.1 * 60.0).abs() < 1e-9);
        assert_eq!(m.last.x, Some(10.0));
    }

    #[test]
    fn absolute_mode_uses_delta_from_last() {
        let mut m = MotionState::new(Speeds::default());
        m.apply_move(Axes {
            x: Some(10.0),
            ..Default::default()
        });
        let duration = m.apply_move(Axes {
            x: Some(15.0),
            ..Default::default()
        });
        assert!((duration - (5.0 / 6000.0 * 60.0)).abs() < 1e-9);
    }

    #[test]
    fn unit_toggle_round_trips_position() {
        let mut m = MotionState::new(Speeds::default());
        m.apply_move(Axes {
            x: Some(25.4),
            ..Default::default()
        });
        let before = m.last.x.unwrap();
        m.set_unit_modifier(1.0 / 2.54);
        m.set_unit_modifier(1.0);
        assert!((m.last.x.unwrap() - before).abs() < 1e-9);
    }

    #[test]
    fn g92_with_no_axes_resets_to_origin() {
        let mut m = MotionState::new(Speeds::default());
        m.apply_move(Axes {
            x: Some(10.0),
            y: Some(5.0),
            ..Default::default()
        });
        m.set_position(Axes::default());
        assert_eq!(m.last.x, Some(0.0));
        assert_eq!(m.last.y, Some(0.0));
    }
}
