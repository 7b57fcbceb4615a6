//! Bilinear interpolation on a regular latitude/longitude grid.

use super::grib2::LatLonGrid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Interpolated {
    Value(f64),
    /// A surrounding grid point is masked by the bitmap
    Masked,
    /// The location lies outside the grid
    Outside,
}

impl Interpolated {
    #[must_use]
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Fractional grid coordinates of a point, or `None` outside the grid.
#[must_use]
pub fn grid_position(grid: &LatLonGrid, latitude: f64, longitude: f64) -> Option<(f64, f64)> {
    if grid.di <= 0.0 || grid.dj <= 0.0 {
        return None;
    }
    let x = (longitude - grid.lo1).rem_euclid(360.0) / grid.di;
    let y = if grid.south_to_north() {
        (latitude - grid.la1) / grid.dj
    } else {
        (grid.la1 - latitude) / grid.dj
    };

    // tolerate rounding at the far edges
    let eps = 1e-9;
    let max_x = (grid.ni - 1) as f64;
    let max_y = (grid.nj - 1) as f64;
    if !(-eps..=max_x + eps).contains(&x) || !(-eps..=max_y + eps).contains(&y) {
        return None;
    }
    Some((x.clamp(0.0, max_x), y.clamp(0.0, max_y)))
}

/// Interpolates `values` (laid out in grid scan order) at a point.
#[must_use]
pub fn bilinear(grid: &LatLonGrid, values: &[Option<f64>], latitude: f64, longitude: f64) -> Interpolated {
    let Some((x, y)) = grid_position(grid, latitude, longitude) else {
        return Interpolated::Outside;
    };
    if values.len() != grid.len() {
        return Interpolated::Outside;
    }

    let i0 = (x.floor() as usize).min(grid.ni - 2);
    let j0 = (y.floor() as usize).min(grid.nj - 2);
    let fx = x - i0 as f64;
    let fy = y - j0 as f64;

    let at = |i: usize, j: usize| values[j * grid.ni + i];
    let (Some(v00), Some(v10), Some(v01), Some(v11)) =
        (at(i0, j0), at(i0 + 1, j0), at(i0, j0 + 1), at(i0 + 1, j0 + 1))
    else {
        return Interpolated::Masked;
    };

    let top = v00 * (1.0 - fx) + v10 * fx;
    let bottom = v01 * (1.0 - fx) + v11 * fx;
    Interpolated::Value(top * (1.0 - fy) + bottom * fy)
}

/// Interpolates a direction field (degrees) through its unit vector so the
/// 0/360 seam does not average to 180.
#[must_use]
pub fn bilinear_direction(grid: &LatLonGrid, degrees: &[Option<f64>], latitude: f64, longitude: f64) -> Interpolated {
    let sin: Vec<_> = degrees.iter().map(|d| d.map(|d| d.to_radians().sin())).collect();
    let cos: Vec<_> = degrees.iter().map(|d| d.map(|d| d.to_radians().cos())).collect();
    match (
        bilinear(grid, &sin, latitude, longitude),
        bilinear(grid, &cos, latitude, longitude),
    ) {
        (Interpolated::Value(s), Interpolated::Value(c)) => {
            Interpolated::Value(s.atan2(c).to_degrees().rem_euclid(360.0))
        }
        (Interpolated::Outside, _) | (_, Interpolated::Outside) => Interpolated::Outside,
        _ => Interpolated::Masked,
    }
}

/// Meteorological wind (speed, direction the wind blows from) from
/// eastward `u` and northward `v` components.
#[must_use]
pub fn wind_from_components(u: f64, v: f64) -> (f64, f64) {
    let speed = u.hypot(v);
    let direction = (-u).atan2(-v).to_degrees().rem_euclid(360.0);
    (speed, direction)
}
