//! Constant-velocity Kalman filter over bounding boxes.
use nalgebra::{SMatrix, SVector};

type State = SVector<f64, 8>;
type StateCov = SMatrix<f64, 8, 8>;
type Measurement = SVector<f64, 4>;
type MeasurementCov = SMatrix<f64, 4, 4>;
type Observation = SMatrix<f64, 4, 8>;

const PROCESS_NOISE: f64 = 1e-2;
const MEASUREMENT_NOISE: f64 = 1e-1;

/// Tracks one box as `[cx, cy, w, h]` plus velocities. Measurements are
/// boxes in `[x, y, w, h]` (top-left anchored) pixel coordinates.
#[derive(Clone, Debug)]
pub struct KalmanBoxFilter {
    state: State,
    covariance: StateCov,
}

fn to_center(bbox: [f32; 4]) -> Measurement {
    let [x, y, w, h] = bbox.map(f64::from);
    Measurement::new(x + w / 2.0, y + h / 2.0, w, h)
}

fn to_corner(center: Measurement) -> [f32; 4] {
    let (cx, cy, w, h) = (center[0], center[1], center[2], center[3]);
    [
        (cx - w / 2.0) as f32,
        (cy - h / 2.0) as f32,
        w.max(0.0) as f32,
        h.max(0.0) as f32,
    ]
}

impl KalmanBoxFilter {
    /// Initialises the filter on a first measurement with zero velocity
    /// and an inflated velocity covariance.
    pub fn new(bbox: [f32; 4]) -> Self {
        let center = to_center(bbox);
        let mut state = State::zeros();
        state.fixed_rows_mut::<4>(0).copy_from(&center);

        let mut covariance = StateCov::identity();
        for i in 4..8 {
            covariance[(i, i)] = 1e3;
        }

        Self { state, covariance }
    }

    fn transition(dt: f64) -> StateCov {
        let mut f = StateCov::identity();
        for i in 0..4 {
            f[(i, i + 4)] = dt;
        }
        f
    }

    fn observation() -> Observation {
        let mut h = Observation::zeros();
        for i in 0..4 {
            h[(i, i)] = 1.0;
        }
        h
    }

    /// Advances the state one step of `dt` frame periods.
    pub fn predict(&mut self, dt: f64) {
        let f = Self::transition(dt);
        self.state = f * self.state;
        self.covariance =
            f * self.covariance * f.transpose() + StateCov::identity() * PROCESS_NOISE;
    }

    /// Folds a measured box into the state.
    pub fn update(&mut self, bbox: [f32; 4]) {
        let z = to_center(bbox);
        let h = Self::observation();

        let innovation = z - h * self.state;
        let s: MeasurementCov =
            h * self.covariance * h.transpose() + MeasurementCov::identity() * MEASUREMENT_NOISE;
        let Some(s_inv) = s.try_inverse() else {
            // Degenerate covariance; fall back to trusting the measurement.
            self.state.fixed_rows_mut::<4>(0).copy_from(&z);
            return;
        };
        let gain = self.covariance * h.transpose() * s_inv;

        self.state += gain * innovation;
        self.covariance = (StateCov::identity() - gain * h) * self.covariance;
    }

    /// The current state as an `[x, y, w, h]` box.
    pub fn bbox(&self) -> [f32; 4] {
        to_corner(self.state.fixed_rows::<4>(0).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn initial_state_reproduces_the_measurement() {
        let filter = KalmanBoxFilter::new([10.0, 20.0, 30.0, 40.0]);
        let bbox = filter.bbox();
        assert_approx_eq!(bbox[0], 10.0, 1e-3);
        assert_approx_eq!(bbox[1], 20.0, 1e-3);
        assert_approx_eq!(bbox[2], 30.0, 1e-3);
        assert_approx_eq!(bbox[3], 40.0, 1e-3);
    }

    #[test]
    fn constant_velocity_is_learned_and_extrapolated() {
        let mut filter = KalmanBoxFilter::new([0.0, 0.0, 10.0, 10.0]);
        // Box moving +5 px/frame in x.
        for step in 1..=20 {
            filter.predict(1.0);
            filter.update([(5 * step) as f32, 0.0, 10.0, 10.0]);
        }

        // Predict-only steps keep the motion going.
        filter.predict(1.0);
        let bbox = filter.bbox();
        assert_approx_eq!(bbox[0], 105.0, 1.5);
        assert_approx_eq!(bbox[1], 0.0, 0.5);
    }

    #[test]
    fn update_pulls_the_state_toward_the_measurement() {
        let mut filter = KalmanBoxFilter::new([0.0, 0.0, 10.0, 10.0]);
        filter.predict(1.0);
        filter.update([8.0, 0.0, 10.0, 10.0]);
        let bbox = filter.bbox();
        assert!(bbox[0] > 0.0 && bbox[0] <= 8.0, "bbox.x = {}", bbox[0]);
    }

    #[test]
    fn width_and_height_never_go_negative() {
        let mut filter = KalmanBoxFilter::new([0.0, 0.0, 2.0, 2.0]);
        for _ in 0..5 {
            filter.predict(1.0);
            filter.update([0.0, 0.0, 0.1, 0.1]);
        }
        for _ in 0..50 {
            filter.predict(1.0);
        }
        let bbox = filter.bbox();
        assert!(bbox[2] >= 0.0);
        assert!(bbox[3] >= 0.0);
    }
}
