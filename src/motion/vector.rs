//! Small vector kit used by the move ingest path. Everything works on
//! slices so the same helpers serve the full drive vector and xyz-only
//! points.

pub fn magnitude(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

pub fn scale(v: &mut [f64], factor: f64) {
    for x in v.iter_mut() {
        *x *= factor;
    }
}

/// Fold a vector into the positive hyperquadrant.
pub fn absolute(v: &mut [f64]) {
    for x in v.iter_mut() {
        *x = x.abs();
    }
}

/// Normalise in place, returning the prior magnitude, or `None` for a
/// zero-length vector.
pub fn normalise(v: &mut [f64]) -> Option<f64> {
    let m = magnitude(v);
    if m <= 0.0 {
        return None;
    }
    scale(v, 1.0 / m);
    Some(m)
}

/// Scale factor that stretches a unit positive-hyperquadrant vector until
/// it touches a face of the axis-aligned box `bounds`. Components at zero
/// place no constraint.
pub fn box_intersection(v: &[f64], bounds: &[f64]) -> f64 {
    // Seed with a length guaranteed to clear the box diagonal, then shrink.
    let bigger_than_diagonal = 2.0 * magnitude(bounds);
    let mut factor = bigger_than_diagonal;
    for (x, bound) in v.iter().zip(bounds) {
        if bigger_than_diagonal * x > *bound {
            let a = bound / x;
            if a < factor {
                factor = a;
            }
        }
    }
    factor
}
