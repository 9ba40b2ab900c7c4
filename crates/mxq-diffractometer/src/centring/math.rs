//! Sample-centring geometry.
//!
//! All lengths are millimetres, angles are degrees at the API boundary and
//! radians internally.
//!
//! # Model
//!
//! The alignment table (`phiy`, `phiz`) translates the sample image on the
//! camera. The centring table (`sampx`, `sampy`) rotates with phi, so a
//! sample sitting at offset `p` from the rotation axis appears displaced
//! perpendicular to the axis by `p·(sin φ, cos φ)`. The rotation axis is
//! tilted on screen by the chi angle:
//!
//! ```text
//! S(φ) = T + R(chi)·(0, p·(sin φ, cos φ))
//! ```
//!
//! Observing the sample at several angles and fitting
//! `z = r·sin(φ + a) + offset` to the axis-perpendicular coordinate recovers
//! `p` (from `r`, `a`) and the axis position (from `offset` and the mean
//! along-axis coordinate).

use mxq_core::config::DiffractometerSettings;
use mxq_core::types::ScreenPoint;
use serde::{Deserialize, Serialize};

use crate::error::CentringError;

/// Solver iteration bound.
const MAX_ITERATIONS: usize = 200;

/// Smallest accepted determinant of the sin/cos normal block, relative to
/// its squared mean diagonal.
const MIN_ANGULAR_RANK: f64 = 1e-12;

/// Camera calibration and beam position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenGeometry {
    /// Pixels per millimetre, horizontal and vertical.
    pub pixels_per_mm: [f64; 2],
    /// Beam position on the image, pixels.
    pub beam_position: [f64; 2],
    /// Tilt of the rotation axis on screen, degrees.
    pub chi_angle: f64,
}

impl ScreenGeometry {
    /// Geometry from the diffractometer settings.
    pub fn from_settings(settings: &DiffractometerSettings) -> Self {
        Self {
            pixels_per_mm: [settings.pixels_per_mm_x, settings.pixels_per_mm_y],
            beam_position: settings.beam_position,
            chi_angle: settings.chi_angle,
        }
    }

    /// Beam position in millimetres.
    pub fn beam_mm(&self) -> [f64; 2] {
        [
            self.beam_position[0] / self.pixels_per_mm[0],
            self.beam_position[1] / self.pixels_per_mm[1],
        ]
    }

    /// Screen point in millimetres.
    pub fn to_mm(&self, point: ScreenPoint) -> [f64; 2] {
        [point.x / self.pixels_per_mm[0], point.y / self.pixels_per_mm[1]]
    }

    /// Millimetres to a screen point.
    pub fn to_pixels(&self, mm: [f64; 2]) -> ScreenPoint {
        ScreenPoint::new(mm[0] * self.pixels_per_mm[0], mm[1] * self.pixels_per_mm[1])
    }

    fn chi(&self) -> f64 {
        self.chi_angle.to_radians()
    }
}

/// One centring observation: where the sample was seen at which angle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Screen position, pixels.
    pub point: ScreenPoint,
    /// Phi, degrees.
    pub phi: f64,
}

impl Observation {
    /// Observation at `phi` degrees.
    pub fn new(point: ScreenPoint, phi: f64) -> Self {
        Self { point, phi }
    }
}

/// Result of the sinusoid fit `z = r·sin(phi + a) + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinusoidFit {
    /// Amplitude, mm.
    pub r: f64,
    /// Phase, radians.
    pub a: f64,
    /// Offset, mm.
    pub offset: f64,
}

impl SinusoidFit {
    /// Sample offset component `r·cos a`, mm.
    pub fn dx(&self) -> f64 {
        self.r * self.a.cos()
    }

    /// Sample offset component `r·sin a`, mm.
    pub fn dy(&self) -> f64 {
        self.r * self.a.sin()
    }
}

/// Motor corrections, in millimetres, that bring the sample to the beam.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CentringDeltas {
    /// Alignment table, horizontal.
    pub phiy: f64,
    /// Alignment table, vertical.
    pub phiz: f64,
    /// Centring table, first axis.
    pub sampx: f64,
    /// Centring table, second axis.
    pub sampy: f64,
}

/// Rotate `v` counter-clockwise by `angle` radians.
pub(crate) fn rotate(angle: f64, v: [f64; 2]) -> [f64; 2] {
    let (s, c) = angle.sin_cos();
    [v[0] * c - v[1] * s, v[0] * s + v[1] * c]
}

/// Fit `z = r·sin(phi + a) + offset` by Levenberg-Marquardt.
///
/// `phi` in radians. Observations are used in the order given. The solver
/// works on the equivalent linear form `z = A·sin φ + B·cos φ + offset`
/// (`A = r·cos a`, `B = r·sin a`) starting from `r = 1, a = 0, offset = 0`.
pub fn fit_sinusoid(z: &[f64], phi: &[f64]) -> Result<SinusoidFit, CentringError> {
    let n = z.len().min(phi.len());
    if n < 2 {
        return Err(CentringError::InsufficientData { got: n, needed: 2 });
    }
    if z.len() != phi.len() {
        return Err(CentringError::FitFailed(format!(
            "{} displacements for {} angles",
            z.len(),
            phi.len()
        )));
    }
    if z.iter().chain(phi).any(|v| !v.is_finite()) {
        return Err(CentringError::FitFailed("non-finite observation".into()));
    }
    let rows: Vec<[f64; 3]> = phi.iter().map(|p| [p.sin(), p.cos(), 1.0]).collect();
    let model = |theta: &[f64; 3], row: &[f64; 3]| {
        theta[0] * row[0] + theta[1] * row[1] + theta[2] * row[2]
    };
    let cost = |theta: &[f64; 3]| -> f64 {
        rows.iter()
            .zip(z)
            .map(|(row, zi)| (zi - model(theta, row)).powi(2))
            .sum()
    };

    // J^T J is constant for a linear model
    let mut jtj = [[0.0; 3]; 3];
    for row in &rows {
        for i in 0..3 {
            for j in 0..3 {
                jtj[i][j] += row[i] * row[j];
            }
        }
    }
    // Amplitude and phase are only determined when the sin and cos columns
    // are independent: angles all equal, or all 180° apart, are not enough
    let block_det = jtj[0][0] * jtj[1][1] - jtj[0][1] * jtj[1][0];
    let block_scale = ((jtj[0][0] + jtj[1][1]) / 2.0).powi(2);
    if block_det <= MIN_ANGULAR_RANK * block_scale {
        return Err(CentringError::DegenerateObservations);
    }
    let scale = (jtj[0][0] + jtj[1][1] + jtj[2][2]) / 3.0;
    let tiny_cost = 1e-30 * (1.0 + z.iter().map(|v| v * v).sum::<f64>());

    let mut theta = [1.0, 0.0, 0.0];
    let mut current = cost(&theta);
    let mut lambda = 1e-3;
    let mut converged = false;

    for _ in 0..MAX_ITERATIONS {
        if current <= tiny_cost {
            converged = true;
            break;
        }

        let mut gradient = [0.0; 3];
        for (row, zi) in rows.iter().zip(z) {
            let residual = zi - model(&theta, row);
            for i in 0..3 {
                gradient[i] += row[i] * residual;
            }
        }

        let mut damped = jtj;
        for (i, row) in damped.iter_mut().enumerate() {
            row[i] += lambda * scale;
        }
        let Some(step) = solve3(damped, gradient) else {
            lambda *= 10.0;
            continue;
        };

        let candidate = [theta[0] + step[0], theta[1] + step[1], theta[2] + step[2]];
        let candidate_cost = cost(&candidate);
        if candidate_cost.is_finite() && candidate_cost < current {
            let step_norm = norm(&step);
            theta = candidate;
            current = candidate_cost;
            lambda = (lambda / 10.0).max(1e-12);
            if step_norm <= 1e-14 * (norm(&theta) + 1e-14) {
                converged = true;
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e16 {
                // No descent direction left: this is the minimum
                converged = true;
                break;
            }
        }
    }

    if !converged {
        return Err(CentringError::FitFailed(format!(
            "no convergence after {} iterations",
            MAX_ITERATIONS
        )));
    }
    if theta.iter().any(|v| !v.is_finite()) {
        return Err(CentringError::FitFailed("non-finite solution".into()));
    }

    let r = theta[0].hypot(theta[1]);
    let a = if r > 0.0 { theta[1].atan2(theta[0]) } else { 0.0 };
    Ok(SinusoidFit {
        r,
        a,
        offset: theta[2],
    })
}

fn norm(v: &[f64; 3]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Solve a 3x3 system by Gaussian elimination with partial pivoting.
fn solve3(mut m: [[f64; 3]; 3], mut b: [f64; 3]) -> Option<[f64; 3]> {
    for col in 0..3 {
        let pivot = (col..3).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        if m[pivot][col].abs() < f64::MIN_POSITIVE {
            return None;
        }
        m.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..3 {
            let factor = m[row][col] / m[col][col];
            for k in col..3 {
                m[row][k] -= factor * m[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = [0.0; 3];
    for row in (0..3).rev() {
        let tail: f64 = (row + 1..3).map(|k| m[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / m[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Centring solution from a set of observations.
///
/// `current_phi` (degrees) is the rotation angle the deltas are applied at.
pub fn centre_from_observations(
    observations: &[Observation],
    geometry: &ScreenGeometry,
    current_phi: f64,
) -> Result<(SinusoidFit, CentringDeltas), CentringError> {
    if observations.len() < 2 {
        return Err(CentringError::InsufficientData {
            got: observations.len(),
            needed: 2,
        });
    }
    let chi = geometry.chi();

    // Into the rotation-axis frame: u along the axis, w perpendicular
    let axis_frame: Vec<[f64; 2]> = observations
        .iter()
        .map(|o| rotate(-chi, geometry.to_mm(o.point)))
        .collect();
    let along: f64 =
        axis_frame.iter().map(|v| v[0]).sum::<f64>() / axis_frame.len() as f64;
    let z: Vec<f64> = axis_frame.iter().map(|v| v[1]).collect();
    let phi: Vec<f64> = observations
        .iter()
        .map(|o| (o.phi - current_phi).to_radians())
        .collect();

    let fit = fit_sinusoid(&z, &phi)?;

    let axis = rotate(chi, [along, fit.offset]);
    let beam = geometry.beam_mm();
    let d_horizontal = axis[0] - beam[0];
    let d_vertical = axis[1] - beam[1];

    // (dx, dy) is the offset seen at the current angle; back into the
    // frame that rotates with phi
    let sample = rotate(-current_phi.to_radians(), [fit.dx(), fit.dy()]);

    Ok((
        fit,
        CentringDeltas {
            phiy: -d_horizontal,
            phiz: -d_vertical,
            sampx: -sample[0],
            sampy: -sample[1],
        },
    ))
}

/// Motor corrections that bring the point clicked at `click` onto the beam,
/// with phi at `phi` degrees.
pub fn deltas_from_click(geometry: &ScreenGeometry, click: ScreenPoint, phi: f64) -> CentringDeltas {
    let chi = geometry.chi();
    let mm = geometry.to_mm(click);
    let beam = geometry.beam_mm();
    let [along, across] = rotate(-chi, [mm[0] - beam[0], mm[1] - beam[1]]);

    let (sin_phi, cos_phi) = phi.to_radians().sin_cos();
    let table = rotate(chi, [along, 0.0]);
    CentringDeltas {
        phiy: -table[0],
        phiz: -table[1],
        sampx: -across * sin_phi,
        sampy: -across * cos_phi,
    }
}

/// Where the point that `deltas` would bring onto the beam currently
/// appears on screen, with phi at `phi` degrees.
///
/// Exact inverse of [`deltas_from_click`].
pub fn screen_from_deltas(geometry: &ScreenGeometry, deltas: &CentringDeltas, phi: f64) -> ScreenPoint {
    let chi = geometry.chi();
    let (sin_phi, cos_phi) = phi.to_radians().sin_cos();
    let across = -(deltas.sampx * sin_phi + deltas.sampy * cos_phi);
    let rotating = rotate(chi, [0.0, across]);
    let beam = geometry.beam_mm();
    geometry.to_pixels([
        beam[0] - deltas.phiy + rotating[0],
        beam[1] - deltas.phiz + rotating[1],
    ])
}
