//! User-frame to machine-frame mapping: an axis-skew correction followed by
//! bed-surface compensation derived from probed sample points.
//!
//! The bed model is picked by how many probe points have been recorded:
//! none (identity), three (a plane), four (a bilinear patch on the probed
//! rectangle) or five (a fan of four triangles around a centre point).

use crate::config::{X_AXIS, Y_AXIS, Z_AXIS};

/// Maximum number of bed probe points.
pub const PROBE_POINTS: usize = 5;

/// Barely below zero, so boundary points still land in a triangle.
const TRIANGLE_0: f64 = -0.001;

const X_SET: u8 = 1;
const Y_SET: u8 = 2;
const Z_SET: u8 = 4;

#[derive(Debug, Clone)]
pub struct Transform {
    tan_xy: f64,
    tan_yz: f64,
    tan_xz: f64,

    x_probe: [f64; PROBE_POINTS],
    y_probe: [f64; PROBE_POINTS],
    z_probe: [f64; PROBE_POINTS],
    point_set: [u8; PROBE_POINTS],

    // Plane coefficients: z offset = a_x*x + a_y*y + a_c
    a_x: f64,
    a_y: f64,
    a_c: f64,
    // Reciprocal spans of the probed rectangle, for the bilinear patch.
    x_rectangle: f64,
    y_rectangle: f64,
    identity_bed_transform: bool,
}

impl Transform {
    /// Axis lengths seed the default probe layout and rectangle scale.
    pub fn new(x_length: f64, y_length: f64) -> Self {
        let mut x_probe = [0.0; PROBE_POINTS];
        let mut y_probe = [0.0; PROBE_POINTS];
        for point in 0..PROBE_POINTS {
            x_probe[point] = (0.3 + 0.6 * (point % 2) as f64) * x_length;
            y_probe[point] = 0.9 * (point / 2) as f64 * y_length;
        }
        Self {
            tan_xy: 0.0,
            tan_yz: 0.0,
            tan_xz: 0.0,
            x_probe,
            y_probe,
            z_probe: [0.0; PROBE_POINTS],
            point_set: [0; PROBE_POINTS],
            a_x: 0.0,
            a_y: 0.0,
            a_c: 0.0,
            x_rectangle: 1.0 / (0.8 * x_length),
            y_rectangle: 1.0 / (0.8 * x_length),
            identity_bed_transform: true,
        }
    }

    pub fn set_axis_compensation(&mut self, axis: usize, tangent: f64) {
        match axis {
            X_AXIS => self.tan_xy = tangent,
            Y_AXIS => self.tan_yz = tangent,
            Z_AXIS => self.tan_xz = tangent,
            _ => tracing::warn!("Axis compensation set for unknown axis {}", axis),
        }
    }

    /// Cancel bed compensation. The probe points stay recorded, so the
    /// model can be refitted without reprobing.
    pub fn set_identity(&mut self) {
        self.identity_bed_transform = true;
    }

    /// User frame to machine frame: axis skew, then bed compensation.
    pub fn apply(&self, xyz: &mut [f64]) {
        self.axis_transform(xyz);
        self.bed_transform(xyz);
    }

    /// Machine frame back to user frame.
    pub fn invert(&self, xyz: &mut [f64]) {
        self.inverse_bed_transform(xyz);
        self.inverse_axis_transform(xyz);
    }

    fn axis_transform(&self, xyz: &mut [f64]) {
        xyz[X_AXIS] += self.tan_xy * xyz[Y_AXIS] + self.tan_xz * xyz[Z_AXIS];
        xyz[Y_AXIS] += self.tan_yz * xyz[Z_AXIS];
    }

    fn inverse_axis_transform(&self, xyz: &mut [f64]) {
        xyz[Y_AXIS] -= self.tan_yz * xyz[Z_AXIS];
        xyz[X_AXIS] -= self.tan_xy * xyz[Y_AXIS] + self.tan_xz * xyz[Z_AXIS];
    }

    fn bed_transform(&self, xyz: &mut [f64]) {
        if let Some(offset) = self.bed_offset(xyz[X_AXIS], xyz[Y_AXIS]) {
            xyz[Z_AXIS] += offset;
        }
    }

    fn inverse_bed_transform(&self, xyz: &mut [f64]) {
        if let Some(offset) = self.bed_offset(xyz[X_AXIS], xyz[Y_AXIS]) {
            xyz[Z_AXIS] -= offset;
        }
    }

    fn bed_offset(&self, x: f64, y: f64) -> Option<f64> {
        if self.identity_bed_transform {
            return None;
        }
        match self.probe_point_count() {
            0 => None,
            3 => Some(self.a_x * x + self.a_y * y + self.a_c),
            4 => Some(self.second_degree_z(x, y)),
            5 => Some(self.triangle_z(x, y)),
            n => {
                tracing::warn!("Bed transform: wrong number of sample points ({})", n);
                None
            }
        }
    }

    /// Bilinear interpolation over the probed rectangle. Corners are
    /// indexed counterclockwise from the origin corner:
    ///
    /// ```text
    ///   ^  [1]      [2]
    ///   Y
    ///   |  [0]      [3]
    ///      -----X---->
    /// ```
    fn second_degree_z(&self, x: f64, y: f64) -> f64 {
        let x = (x - self.x_probe[0]) * self.x_rectangle;
        let y = (y - self.y_probe[0]) * self.y_rectangle;
        (1.0 - x) * (1.0 - y) * self.z_probe[0]
            + x * (1.0 - y) * self.z_probe[3]
            + (1.0 - x) * y * self.z_probe[1]
            + x * y * self.z_probe[2]
    }

    fn barycentric(&self, p1: usize, p2: usize, p3: usize, x: f64, y: f64) -> (f64, f64, f64) {
        let y23 = self.y_probe[p2] - self.y_probe[p3];
        let x3 = x - self.x_probe[p3];
        let x32 = self.x_probe[p3] - self.x_probe[p2];
        let y3 = y - self.y_probe[p3];
        let x13 = self.x_probe[p1] - self.x_probe[p3];
        let y13 = self.y_probe[p1] - self.y_probe[p3];
        let i_det = 1.0 / (y23 * x13 + x32 * y13);
        let l1 = (y23 * x3 + x32 * y3) * i_det;
        let l2 = (-y13 * x3 + x13 * y3) * i_det;
        (l1, l2, 1.0 - l1 - l2)
    }

    /// Interpolate over the four triangles formed by consecutive corner
    /// points and the centre point (index 4).
    fn triangle_z(&self, x: f64, y: f64) -> f64 {
        for i in 0..4 {
            let j = (i + 1) % 4;
            let (l1, l2, l3) = self.barycentric(i, j, 4, x, y);
            if l1 > TRIANGLE_0 && l2 > TRIANGLE_0 && l3 > TRIANGLE_0 {
                return l1 * self.z_probe[i] + l2 * self.z_probe[j] + l3 * self.z_probe[4];
            }
        }
        tracing::warn!("Triangle interpolation: point ({:.1}, {:.1}) outside all triangles", x, y);
        0.0
    }

    pub fn set_x_bed_probe_point(&mut self, index: usize, x: f64) {
        if index >= PROBE_POINTS {
            tracing::warn!("Z probe point X index {} out of range", index);
            return;
        }
        self.x_probe[index] = x;
        self.point_set[index] |= X_SET;
    }

    pub fn set_y_bed_probe_point(&mut self, index: usize, y: f64) {
        if index >= PROBE_POINTS {
            tracing::warn!("Z probe point Y index {} out of range", index);
            return;
        }
        self.y_probe[index] = y;
        self.point_set[index] |= Y_SET;
    }

    pub fn set_z_bed_probe_point(&mut self, index: usize, z: f64) {
        if index >= PROBE_POINTS {
            tracing::warn!("Z probe point Z index {} out of range", index);
            return;
        }
        self.z_probe[index] = z;
        self.point_set[index] |= Z_SET;
    }

    pub fn x_bed_probe_point(&self, index: usize) -> f64 {
        self.x_probe[index]
    }

    pub fn y_bed_probe_point(&self, index: usize) -> f64 {
        self.y_probe[index]
    }

    pub fn z_bed_probe_point(&self, index: usize) -> f64 {
        self.z_probe[index]
    }

    pub fn all_probe_coordinates_set(&self, index: usize) -> bool {
        self.point_set[index] == X_SET | Y_SET | Z_SET
    }

    /// 0, 3, 4 or 5 depending on how many leading points are fully set.
    pub fn probe_point_count(&self) -> usize {
        if !(0..3).all(|i| self.all_probe_coordinates_set(i)) {
            return 0;
        }
        if !self.all_probe_coordinates_set(3) {
            return 3;
        }
        if !self.all_probe_coordinates_set(4) {
            return 4;
        }
        5
    }

    /// Fit the bed model to the recorded probe points.
    pub fn set_probed_bed_equation(&mut self) {
        match self.probe_point_count() {
            3 => {
                // Implicit plane through the three samples.
                let x10 = self.x_probe[1] - self.x_probe[0];
                let y10 = self.y_probe[1] - self.y_probe[0];
                let z10 = self.z_probe[1] - self.z_probe[0];
                let x20 = self.x_probe[2] - self.x_probe[0];
                let y20 = self.y_probe[2] - self.y_probe[0];
                let z20 = self.z_probe[2] - self.z_probe[0];
                let a = y10 * z20 - z10 * y20;
                let b = z10 * x20 - x10 * z20;
                let c = x10 * y20 - y10 * x20;
                let d = -(self.x_probe[1] * a + self.y_probe[1] * b + self.z_probe[1] * c);
                self.a_x = -a / c;
                self.a_y = -b / c;
                self.a_c = -d / c;
                self.identity_bed_transform = false;
            }
            4 => {
                self.x_rectangle = 1.0 / (self.x_probe[3] - self.x_probe[0]);
                self.y_rectangle = 1.0 / (self.y_probe[1] - self.y_probe[0]);
                self.identity_bed_transform = false;
            }
            5 => {
                // Reflect the corners out to twice their distance from the
                // centre so the fan covers the whole bed.
                for i in 0..4 {
                    let x10 = self.x_probe[i] - self.x_probe[4];
                    let y10 = self.y_probe[i] - self.y_probe[4];
                    let z10 = self.z_probe[i] - self.z_probe[4];
                    self.x_probe[i] = self.x_probe[4] + 2.0 * x10;
                    self.y_probe[i] = self.y_probe[4] + 2.0 * y10;
                    self.z_probe[i] = self.z_probe[4] + 2.0 * z10;
                }
                self.identity_bed_transform = false;
            }
            n => {
                tracing::warn!(
                    "Bed compensation requested before all probe points were recorded ({} set)",
                    n
                );
                self.identity_bed_transform = true;
                return;
            }
        }
        for point in 0..self.probe_point_count() {
            tracing::info!(
                "Bed equation fits [{:.1}, {:.1}, {:.3}]",
                self.x_probe[point],
                self.y_probe[point],
                self.z_probe[point]
            );
        }
    }
}
