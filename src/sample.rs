//! The sampling pipeline
//!
//! One linear pass per run: validate the band, create the attribute column
//! (typed by the raster's pixel type), reconcile spatial reference systems,
//! invert the geotransform, collect every feature id, then revisit each id,
//! map its point through the inverse affine, read one pixel, and write the
//! attribute. Updates are grouped into transactions of a configurable size.
//!
//! The two-pass structure exists because the update pass mutates the layer;
//! collecting ids first keeps the scan cursor away from the writes.

use tracing::{debug, warn};

use crate::geometry::projection::CoordTransformer;
use crate::geotiff::GeoTransform;
use crate::gpkg::{AttributeType, GpkgDataset, PointLayer};
use crate::raster::RasterSource;
use crate::AnyResult;

/// Progress callback, invoked with the completed fraction after each feature.
pub type ProgressFn = Box<dyn FnMut(f64)>;

/// Options for a sampling run
pub struct SampleOptions {
    /// 1-based raster band to sample
    pub band: usize,
    /// Feature updates per committed transaction
    pub transaction_size: usize,
    /// Optional progress reporting; observational only
    pub progress: Option<ProgressFn>,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            band: 1,
            transaction_size: 1,
            progress: None,
        }
    }
}

/// Outcome of a sampling run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SampleReport {
    /// Features whose attribute was set to a sampled value
    pub sampled: u64,
    /// Features written as NULL because the point could not be sampled
    pub failed: u64,
}

impl SampleReport {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.sampled + self.failed
    }
}

/// Sample `raster` at every point feature of `layer_name` and store the
/// values in a new `attribute` column.
pub fn sample_raster_to_attribute(
    raster: &dyn RasterSource,
    dataset: &GpkgDataset,
    layer_name: &str,
    attribute: &str,
    mut options: SampleOptions,
) -> AnyResult<SampleReport> {
    let layer = dataset.layer(layer_name)?;

    if options.band == 0 || options.band > raster.bands() {
        return Err(format!(
            "Band {} out of range (raster has {} band{})",
            options.band,
            raster.bands(),
            if raster.bands() == 1 { "" } else { "s" }
        )
        .into());
    }
    let band = options.band - 1;

    let forward = raster
        .geo_transform()
        .ok_or("Raster has no geotransform; cannot map coordinates to pixels")?;
    let inverse = forward
        .invert()
        .ok_or("Raster geotransform is not invertible")?;

    // Field type follows the raster's pixel type; created exactly once,
    // before any feature is touched
    let is_float = raster.pixel_type().is_float();
    let attribute_type = if is_float {
        AttributeType::Real
    } else {
        AttributeType::Integer
    };
    layer.add_column(attribute, attribute_type)?;

    let transformer = reconcile_srs(&layer, raster)?;

    let declared = layer.feature_count()?;
    let ids = layer.feature_ids()?;
    debug!(
        declared,
        collected = ids.len(),
        band = options.band,
        float = is_float,
        "starting update pass"
    );

    let total = ids.len();
    if let Some(progress) = options.progress.as_mut() {
        progress(0.0);
    }

    let batch_size = options.transaction_size.max(1);
    let mut report = SampleReport::default();
    let mut tx = Some(dataset.begin()?);
    let mut in_batch = 0usize;

    for (index, &fid) in ids.iter().enumerate() {
        let outcome = sample_feature(
            raster,
            &layer,
            &inverse,
            transformer.as_ref(),
            band,
            is_float,
            attribute,
            fid,
        );

        match outcome {
            Ok(()) => report.sampled += 1,
            Err(e) => {
                warn!(fid, error = %e, "feature not sampled; writing NULL");
                layer.set_null(fid, attribute)?;
                report.failed += 1;
            }
        }

        in_batch += 1;
        if in_batch >= batch_size {
            if let Some(tx) = tx.take() {
                tx.commit()?;
            }
            tx = Some(dataset.begin()?);
            in_batch = 0;
        }

        if let Some(progress) = options.progress.as_mut() {
            progress((index + 1) as f64 / total.max(1) as f64);
        }
    }

    // Flush the remainder batch
    if let Some(tx) = tx.take() {
        tx.commit()?;
    }

    if total == 0 {
        if let Some(progress) = options.progress.as_mut() {
            progress(1.0);
        }
    }

    debug!(sampled = report.sampled, failed = report.failed, "run complete");
    Ok(report)
}

/// Compare the layer and raster reference systems; build one transformer to
/// reuse for every feature when they differ.
fn reconcile_srs(
    layer: &PointLayer<'_>,
    raster: &dyn RasterSource,
) -> AnyResult<Option<CoordTransformer>> {
    match (layer.srs_epsg, raster.crs_code()) {
        (Some(vector_epsg), Some(raster_epsg)) if vector_epsg != raster_epsg => {
            debug!(vector_epsg, raster_epsg, "reprojecting features");
            Ok(Some(CoordTransformer::between(vector_epsg, raster_epsg)?))
        }
        (Some(_), Some(_)) => Ok(None),
        (vector_epsg, raster_epsg) => {
            warn!(
                vector_epsg = ?vector_epsg,
                raster_epsg = ?raster_epsg,
                "spatial reference unknown on one side; sampling with raw coordinates"
            );
            Ok(None)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn sample_feature(
    raster: &dyn RasterSource,
    layer: &PointLayer<'_>,
    inverse: &GeoTransform,
    transformer: Option<&CoordTransformer>,
    band: usize,
    is_float: bool,
    attribute: &str,
    fid: i64,
) -> AnyResult<()> {
    let point = layer.point(fid)?;

    let (x, y) = match transformer {
        Some(t) => t.transform(point.x, point.y)?,
        None => point.to_tuple(),
    };

    // The inverse affine floor map; no bounds check here, an out-of-extent
    // index is reported by the read itself
    let (px, py) = inverse.apply(x, y);
    let (pixel, line) = (px.floor() as i64, py.floor() as i64);

    if pixel < 0 || line < 0 {
        return Err(format!("Point maps outside the raster (pixel {pixel}, line {line})").into());
    }
    let (pixel, line) = (pixel as usize, line as usize);

    if is_float {
        let value = raster
            .sample_f64(band, pixel, line)?
            .ok_or_else(|| format!("No pixel at ({pixel}, {line})"))?;
        layer.set_f64(fid, attribute, value)?;
    } else {
        let value = raster
            .sample_i32(band, pixel, line)?
            .ok_or_else(|| format!("No pixel at ({pixel}, {line})"))?;
        layer.set_i32(fid, attribute, value)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geotiff::GeoTiffReader;
    use crate::geometry::projection::project_point;
    use crate::test_support::{create_point_gpkg, write_geotiff_file, FixtureRaster};
    use rusqlite::Connection;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    /// 4x4 raster, origin (0, 40), 10 unit pixels: pixel (x, y) covers
    /// world x in [10x, 10x+10) and world y in (40-10y-10, 40-10y].
    fn float_fixture(dir: &TempDir) -> String {
        let values: Vec<f32> = (0..16).map(|i| i as f32 * 0.5).collect();
        let path = dir.path().join("raster.tif");
        let fixture = FixtureRaster::float32(4, 4, &values)
            .origin(0.0, 40.0)
            .resolution(10.0, 10.0)
            .epsg(32633);
        write_geotiff_file(&fixture, &path).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn query_f64(path: &std::path::Path, sql: &str) -> Vec<Option<f64>> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn.prepare(sql).unwrap();
        let rows = stmt.query_map([], |row| row.get::<_, Option<f64>>(0)).unwrap();
        rows.map(Result::unwrap).collect()
    }

    #[test]
    fn test_float_pipeline_end_to_end() {
        let dir = TempDir::new().unwrap();
        let raster_path = float_fixture(&dir);
        let gpkg_path = dir.path().join("points.gpkg");

        // Pixel centers of (0,0), (2,1), (3,3)
        let points = [(5.0, 35.0), (25.0, 25.0), (35.0, 5.0)];
        create_point_gpkg(&gpkg_path, "sites", 32633, &points).unwrap();

        let raster = GeoTiffReader::open(&raster_path).unwrap();
        let dataset = GpkgDataset::open(&gpkg_path).unwrap();

        let report = sample_raster_to_attribute(
            &raster,
            &dataset,
            "sites",
            "elev",
            SampleOptions::default(),
        )
        .unwrap();

        assert_eq!(report.sampled, 3);
        assert_eq!(report.failed, 0);

        let values = query_f64(&gpkg_path, "SELECT elev FROM sites ORDER BY fid");
        // Row-major values: index 0, 6, 15 scaled by 0.5
        assert_eq!(values, vec![Some(0.0), Some(3.0), Some(7.5)]);
    }

    #[test]
    fn test_integer_pipeline_exact_values() {
        let dir = TempDir::new().unwrap();
        let values: Vec<i16> = vec![100, -200, 300, 32767];
        let raster_path = dir.path().join("int.tif");
        let fixture = FixtureRaster::int16(2, 2, &values)
            .origin(0.0, 20.0)
            .resolution(10.0, 10.0)
            .epsg(32633);
        write_geotiff_file(&fixture, &raster_path).unwrap();

        let gpkg_path = dir.path().join("points.gpkg");
        let points = [(5.0, 15.0), (15.0, 15.0), (5.0, 5.0), (15.0, 5.0)];
        create_point_gpkg(&gpkg_path, "sites", 32633, &points).unwrap();

        let raster = GeoTiffReader::open(raster_path.to_str().unwrap()).unwrap();
        let dataset = GpkgDataset::open(&gpkg_path).unwrap();
        let report = sample_raster_to_attribute(
            &raster,
            &dataset,
            "sites",
            "class",
            SampleOptions::default(),
        )
        .unwrap();
        assert_eq!(report.sampled, 4);

        let conn = Connection::open(&gpkg_path).unwrap();
        let mut stmt = conn.prepare("SELECT class FROM sites ORDER BY fid").unwrap();
        let got: Vec<i32> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(got, vec![100, -200, 300, 32767]);

        // The created column is an integer type
        let declared: String = conn
            .query_row(
                "SELECT type FROM pragma_table_info('sites') WHERE name = 'class'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(declared.to_ascii_uppercase().contains("INT"), "{declared}");
    }

    #[test]
    fn test_out_of_extent_point_written_null() {
        let dir = TempDir::new().unwrap();
        let raster_path = float_fixture(&dir);
        let gpkg_path = dir.path().join("points.gpkg");

        // Second point lies far outside the 40x40 extent
        let points = [(5.0, 35.0), (1000.0, 1000.0)];
        create_point_gpkg(&gpkg_path, "sites", 32633, &points).unwrap();

        let raster = GeoTiffReader::open(&raster_path).unwrap();
        let dataset = GpkgDataset::open(&gpkg_path).unwrap();
        let report = sample_raster_to_attribute(
            &raster,
            &dataset,
            "sites",
            "elev",
            SampleOptions::default(),
        )
        .unwrap();

        assert_eq!(report.sampled, 1);
        assert_eq!(report.failed, 1);

        let values = query_f64(&gpkg_path, "SELECT elev FROM sites ORDER BY fid");
        assert_eq!(values, vec![Some(0.0), None]);
    }

    #[test]
    fn test_reprojected_coordinates_drive_sampling() {
        let dir = TempDir::new().unwrap();
        let raster_path = float_fixture(&dir); // EPSG:32633, extent x 0..40, y 0..40
        let gpkg_path = dir.path().join("points.gpkg");

        // Store the point in lon/lat; its UTM image is the center of pixel (2, 1)
        let (lon, lat) = project_point(32633, 4326, 25.0, 25.0).unwrap();
        create_point_gpkg(&gpkg_path, "sites", 4326, &[(lon, lat)]).unwrap();

        let raster = GeoTiffReader::open(&raster_path).unwrap();
        let dataset = GpkgDataset::open(&gpkg_path).unwrap();
        let report = sample_raster_to_attribute(
            &raster,
            &dataset,
            "sites",
            "elev",
            SampleOptions::default(),
        )
        .unwrap();

        assert_eq!(report.sampled, 1);
        let values = query_f64(&gpkg_path, "SELECT elev FROM sites");
        assert_eq!(values, vec![Some(3.0)]);
    }

    #[test]
    fn test_transaction_batching_flushes_remainder() {
        let dir = TempDir::new().unwrap();
        let raster_path = float_fixture(&dir);
        let gpkg_path = dir.path().join("points.gpkg");

        // 7 features, batch size 3: two full commits plus the remainder
        let points: Vec<(f64, f64)> = (0..7).map(|i| (5.0 + 10.0 * (i % 4) as f64, 35.0)).collect();
        create_point_gpkg(&gpkg_path, "sites", 32633, &points).unwrap();

        let raster = GeoTiffReader::open(&raster_path).unwrap();
        let dataset = GpkgDataset::open(&gpkg_path).unwrap();
        let report = sample_raster_to_attribute(
            &raster,
            &dataset,
            "sites",
            "elev",
            SampleOptions {
                transaction_size: 3,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(report.sampled, 7);
        let values = query_f64(&gpkg_path, "SELECT elev FROM sites ORDER BY fid");
        assert_eq!(values.len(), 7);
        // The 7th update lives in the remainder batch; it must be committed
        assert!(values[6].is_some());
    }

    #[test]
    fn test_duplicate_attribute_fails_second_run() {
        let dir = TempDir::new().unwrap();
        let raster_path = float_fixture(&dir);
        let gpkg_path = dir.path().join("points.gpkg");
        create_point_gpkg(&gpkg_path, "sites", 32633, &[(5.0, 35.0)]).unwrap();

        let raster = GeoTiffReader::open(&raster_path).unwrap();
        let dataset = GpkgDataset::open(&gpkg_path).unwrap();

        sample_raster_to_attribute(&raster, &dataset, "sites", "elev", SampleOptions::default())
            .unwrap();
        let second =
            sample_raster_to_attribute(&raster, &dataset, "sites", "elev", SampleOptions::default());
        assert!(second.is_err());
    }

    #[test]
    fn test_band_out_of_range_is_fatal() {
        let dir = TempDir::new().unwrap();
        let raster_path = float_fixture(&dir);
        let gpkg_path = dir.path().join("points.gpkg");
        create_point_gpkg(&gpkg_path, "sites", 32633, &[(5.0, 35.0)]).unwrap();

        let raster = GeoTiffReader::open(&raster_path).unwrap();
        let dataset = GpkgDataset::open(&gpkg_path).unwrap();
        let result = sample_raster_to_attribute(
            &raster,
            &dataset,
            "sites",
            "elev",
            SampleOptions {
                band: 2,
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_geotransform_is_fatal() {
        use crate::raster::ArrayRasterSource;
        use ndarray::Array3;
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let gpkg_path = dir.path().join("points.gpkg");
        create_point_gpkg(&gpkg_path, "sites", 4326, &[(0.0, 0.0)]).unwrap();

        let source = ArrayRasterSource::new(Arc::new(Array3::zeros((1, 2, 2))));
        let dataset = GpkgDataset::open(&gpkg_path).unwrap();
        let err = sample_raster_to_attribute(
            &source,
            &dataset,
            "sites",
            "v",
            SampleOptions::default(),
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("geotransform"), "{err}");
    }

    #[test]
    fn test_progress_fractions() {
        use crate::geotiff::GeoTransform;
        use crate::raster::ArrayRasterSource;
        use ndarray::Array3;
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let gpkg_path = dir.path().join("points.gpkg");
        let points = [(0.5, -0.5), (1.5, -0.5), (0.5, -1.5), (1.5, -1.5)];
        create_point_gpkg(&gpkg_path, "sites", 4326, &points).unwrap();

        // Identity-ish transform: pixel == world x, line == -world y
        let gt = GeoTransform([0.0, 1.0, 0.0, 0.0, 0.0, -1.0]);
        let source = ArrayRasterSource::new(Arc::new(Array3::from_elem((1, 2, 2), 5.0)))
            .with_geo_transform(gt)
            .with_crs_code(4326);

        let fractions = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&fractions);

        let dataset = GpkgDataset::open(&gpkg_path).unwrap();
        let report = sample_raster_to_attribute(
            &source,
            &dataset,
            "sites",
            "v",
            SampleOptions {
                progress: Some(Box::new(move |f| sink.borrow_mut().push(f))),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(report.sampled, 4);

        let fractions = fractions.borrow();
        assert_eq!(fractions.len(), 5); // initial 0.0 plus one per feature
        assert_eq!(fractions[0], 0.0);
        assert_eq!(*fractions.last().unwrap(), 1.0);
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    }
}
