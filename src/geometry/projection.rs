//! Coordinate transformations between EPSG-coded reference systems
//!
//! Pure Rust via proj4rs, with PROJ strings looked up in the
//! crs-definitions database (thousands of codes: UTM zones, national
//! grids, the usual geographic systems). The sampling pipeline builds one
//! [`CoordTransformer`] when the vector layer and the raster disagree and
//! reuses it for every feature.

use proj4rs::proj::Proj;
use proj4rs::transform::transform;

/// Project a single point from one CRS to another.
///
/// # Arguments
/// * `source_epsg` - Source CRS EPSG code
/// * `target_epsg` - Target CRS EPSG code
/// * `x` - X coordinate in source CRS
/// * `y` - Y coordinate in source CRS
///
/// # Returns
/// Tuple of (x, y) in the target CRS, or an error if either EPSG code is
/// not supported.
#[inline]
pub fn project_point(
    source_epsg: i32,
    target_epsg: i32,
    x: f64,
    y: f64,
) -> Result<(f64, f64), String> {
    if source_epsg == target_epsg {
        return Ok((x, y));
    }

    CoordTransformer::between(source_epsg, target_epsg)?.transform(x, y)
}

/// Get the PROJ4 string for an EPSG code from the crs-definitions database.
#[inline]
pub fn get_proj_string(epsg: i32) -> Option<&'static str> {
    u16::try_from(epsg)
        .ok()
        .and_then(crs_definitions::from_code)
        .map(|def| def.proj4)
}

/// Check if an EPSG code represents a geographic (lon/lat) CRS.
#[inline]
pub fn is_geographic_crs(epsg: i32) -> bool {
    if let Some(proj_str) = get_proj_string(epsg) {
        proj_str.contains("+proj=longlat")
    } else {
        // Fallback: assume 4326 and similar are geographic
        epsg == 4326 || (epsg >= 4000 && epsg < 5000)
    }
}

/// Reusable coordinate transformer between two EPSG-coded systems.
///
/// Construction resolves and parses both projections once; `transform` is
/// then cheap enough to call per feature. proj4rs works in radians for
/// geographic systems, so degree conversion happens on whichever ends are
/// geographic.
pub struct CoordTransformer {
    source_proj: Proj,
    target_proj: Proj,
    source_is_geographic: bool,
    target_is_geographic: bool,
}

impl CoordTransformer {
    /// Build a transformer from `source_epsg` to `target_epsg`.
    pub fn between(source_epsg: i32, target_epsg: i32) -> Result<Self, String> {
        let source_str = get_proj_string(source_epsg)
            .ok_or_else(|| format!("EPSG:{source_epsg} is not in the crs-definitions database"))?;
        let target_str = get_proj_string(target_epsg)
            .ok_or_else(|| format!("EPSG:{target_epsg} is not in the crs-definitions database"))?;

        let source_proj = Proj::from_proj_string(source_str)
            .map_err(|e| format!("Invalid source projection EPSG:{source_epsg}: {e:?}"))?;
        let target_proj = Proj::from_proj_string(target_str)
            .map_err(|e| format!("Invalid target projection EPSG:{target_epsg}: {e:?}"))?;

        Ok(Self {
            source_proj,
            target_proj,
            source_is_geographic: is_geographic_crs(source_epsg),
            target_is_geographic: is_geographic_crs(target_epsg),
        })
    }

    /// Transform coordinates from the source CRS to the target CRS.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64), String> {
        let (x_in, y_in) = if self.source_is_geographic {
            (x.to_radians(), y.to_radians())
        } else {
            (x, y)
        };

        let mut point = (x_in, y_in, 0.0);
        transform(&self.source_proj, &self.target_proj, &mut point)
            .map_err(|e| format!("Coordinate transform failed: {e:?}"))?;

        let (out_x, out_y) = if self.target_is_geographic {
            (point.0.to_degrees(), point.1.to_degrees())
        } else {
            (point.0, point.1)
        };

        Ok((out_x, out_y))
    }
}
