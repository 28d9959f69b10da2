//! The thermal simulator.
//!
//! Ticked once per reader-loop iteration and, during a blocking heat-up,
//! once per second from [`crate::device::Device`]'s M109/M190 handling.

use std::time::Instant;

/// Per-heater extruder temperatures plus the shared heated bed.
pub struct ThermalState {
    pub extruder_temp: Vec<f32>,
    pub extruder_target: Vec<f32>,
    pub bed_temp: f32,
    pub bed_target: f32,
    last_tick_at: Instant,
}

/// Tolerance within which a heater is considered "at temperature". Used by
/// both ticking and the blocking heat-up wait.
const DELTA: f32 = 1.0;

impl ThermalState {
    pub fn new(extruders: usize) -> Self {
        Self {
            extruder_temp: vec![0.0; extruders],
            extruder_target: vec![0.0; extruders],
            bed_temp: 1.0,
            bed_target: 1.0,
            last_tick_at: Instant::now(),
        }
    }

    /// Advances every heater one tick toward its target. Called from the
    /// reader loop on every iteration and from the blocking heat-up waiter.
    pub fn tick(&mut self) {
        let now = Instant::now();
        let time_diff = now.duration_since(self.last_tick_at).as_secs_f32();
        self.last_tick_at = now;

        for i in 0..self.extruder_temp.len() {
            Self::step(&mut self.extruder_temp[i], self.extruder_target[i], time_diff);
        }
        Self::step(&mut self.bed_temp, self.bed_target, time_diff);
    }

    fn step(temp: &mut f32, target: f32, time_diff: f32) {
        if (*temp - target).abs() <= DELTA {
            return;
        }
        let old = *temp;
        *temp += (time_diff.abs() * 10.0).copysign(target - *temp);
        if (target - old).signum() != (target - *temp).signum() {
            *temp = target;
        }
        if *temp < 0.0 {
            *temp = 0.0;
        }
    }

    pub fn extruder_at_target(&self, tool: usize) -> bool {
        self.extruder_temp
            .get(tool)
            .zip(self.extruder_target.get(tool))
            .map(|(t, target)| (t - target).abs() <= DELTA)
            .unwrap_or(true)
    }

    pub fn bed_at_target(&self) -> bool {
        (self.bed_temp - self.bed_target).abs() <= DELTA
    }

    /// Renders the `M105` temperature report body (without the leading `ok
    /// `/trailing newline, which the dispatcher adds per ok-before/after
    /// mode).
    pub fn report(&self) -> String {
        if self.extruder_temp.len() <= 1 {
            format!(
                "T:{:.2} /{:.2} B:{:.2} /{:.2} @:64",
                self.extruder_temp[0], self.extruder_target[0], self.bed_temp, self.bed_target
            )
        } else {
            let mut out = format!("B:{:.2} /{:.2}", self.bed_temp, self.bed_target);
            for i in 0..self.extruder_temp.len() {
                out.push_str(&format!(
                    " T{}:{:.2} /{:.2}",
                    i, self.extruder_temp[i], self.extruder_target[i]
                ));
            }
            out.push_str(" @:64");
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn ticks_monotonically_toward_target_without_overshoot() {
        let mut thermal = ThermalState::new(1);
        thermal.extruder_temp[0] = 25.0;
        thermal.extruder_target[0] = 60.0;

        let mut last = thermal.extruder_temp[0];
        for _ in 0..20 {
            thread::sleep(Duration::from_millis(5));
            thermal.tick();
            assert!(thermal.extruder_temp[0] >= last - f32::EPSILON);
            assert!(thermal.extruder_temp[0] <= 60.0);
            last = thermal.extruder_temp[0];
        }
        assert!(last > 25.0, "temperature never advanced toward target: {}", last);
    }

    #[test]
    fn single_extruder_report_format() {
        let mut thermal = ThermalState::new(1);
        thermal.extruder_temp[0] = 25.0;
        thermal.extruder_target[0] = 60.0;
        thermal.bed_temp = 20.0;
        thermal.bed_target = 60.0;
        assert_eq!(thermal.report(), "T:25.00 /60.00 B:20.00 /60.00 @:64");
    }

    #[test]
    fn multi_extruder_report_format() {
        let mut thermal = ThermalState::new(2);
        thermal.bed_temp = 20.0;
        thermal.bed_target = 60.0;
        assert!(thermal.report().starts_with("B:20.00 /60.00 T0:"));
        assert!(thermal.report().contains("T1:"));
    }
}
