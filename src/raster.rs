//! Raster source abstraction
//!
//! The sampling driver only needs metadata and typed single-pixel reads, so
//! it works against this trait rather than the GeoTIFF reader directly. The
//! ndarray-backed source stands in for a raster in driver tests.

use ndarray::Array3;
use std::sync::Arc;

use crate::geotiff::{GeoTiffReader, GeoTransform, PixelType};
use crate::AnyResult;

pub trait RasterSource: Send + Sync {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    fn bands(&self) -> usize;
    fn pixel_type(&self) -> PixelType;
    fn geo_transform(&self) -> Option<GeoTransform>;
    fn crs_code(&self) -> Option<i32>;
    fn nodata(&self) -> Option<f64>;

    /// Sample one pixel as f64 (float rasters). `None` when the pixel is
    /// outside the raster extent.
    fn sample_f64(&self, band: usize, x: usize, y: usize) -> AnyResult<Option<f64>>;

    /// Sample one pixel as i32 (integer rasters).
    fn sample_i32(&self, band: usize, x: usize, y: usize) -> AnyResult<Option<i32>>;
}

impl RasterSource for GeoTiffReader {
    fn width(&self) -> usize {
        self.metadata.width
    }

    fn height(&self) -> usize {
        self.metadata.height
    }

    fn bands(&self) -> usize {
        self.metadata.bands
    }

    fn pixel_type(&self) -> PixelType {
        self.metadata.pixel_type
    }

    fn geo_transform(&self) -> Option<GeoTransform> {
        self.metadata.geo_transform
    }

    fn crs_code(&self) -> Option<i32> {
        self.metadata.crs_code
    }

    fn nodata(&self) -> Option<f64> {
        self.metadata.nodata
    }

    fn sample_f64(&self, band: usize, x: usize, y: usize) -> AnyResult<Option<f64>> {
        GeoTiffReader::sample_f64(self, band, x, y)
    }

    fn sample_i32(&self, band: usize, x: usize, y: usize) -> AnyResult<Option<i32>> {
        GeoTiffReader::sample_i32(self, band, x, y)
    }
}

/// In-memory raster over an ndarray, dimensions (bands, height, width).
pub struct ArrayRasterSource {
    data: Arc<Array3<f64>>,
    pixel_type: PixelType,
    geo_transform: Option<GeoTransform>,
    crs_code: Option<i32>,
    nodata: Option<f64>,
}

impl ArrayRasterSource {
    #[must_use]
    pub fn new(data: Arc<Array3<f64>>) -> Self {
        Self {
            data,
            pixel_type: PixelType::Float64,
            geo_transform: None,
            crs_code: None,
            nodata: None,
        }
    }

    #[must_use]
    pub fn with_pixel_type(mut self, pixel_type: PixelType) -> Self {
        self.pixel_type = pixel_type;
        self
    }

    #[must_use]
    pub fn with_geo_transform(mut self, geo_transform: GeoTransform) -> Self {
        self.geo_transform = Some(geo_transform);
        self
    }

    #[must_use]
    pub fn with_crs_code(mut self, crs_code: i32) -> Self {
        self.crs_code = Some(crs_code);
        self
    }

    fn get(&self, band: usize, x: usize, y: usize) -> Option<f64> {
        let (bands, height, width) = self.data.dim();
        if band >= bands || x >= width || y >= height {
            return None;
        }
        Some(self.data[[band, y, x]])
    }
}

impl RasterSource for ArrayRasterSource {
    fn width(&self) -> usize {
        self.data.dim().2
    }

    fn height(&self) -> usize {
        self.data.dim().1
    }

    fn bands(&self) -> usize {
        self.data.dim().0
    }

    fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    fn geo_transform(&self) -> Option<GeoTransform> {
        self.geo_transform
    }

    fn crs_code(&self) -> Option<i32> {
        self.crs_code
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    fn sample_f64(&self, band: usize, x: usize, y: usize) -> AnyResult<Option<f64>> {
        Ok(self.get(band, x, y))
    }

    fn sample_i32(&self, band: usize, x: usize, y: usize) -> AnyResult<Option<i32>> {
        Ok(self.get(band, x, y).map(|v| v as i32))
    }
}
