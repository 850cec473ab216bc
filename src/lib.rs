//! # geosample - Raster point sampling into vector attributes
//!
//! Samples a GeoTIFF raster's pixel values at the point features of a
//! GeoPackage layer and writes each value into a new attribute column.
//!
//! ## Features
//!
//! - **Metadata-only raster opening**: reads header and IFD tags, never the
//!   full pixel payload
//! - **Range requests**: rasters open from local files or HTTP(S) URLs
//! - **Compression**: DEFLATE, LZW, ZSTD, and uncompressed GeoTIFFs,
//!   predictors 1/2/3
//! - **Native value types**: float rasters sample as `f64`, integer rasters
//!   as `i32`; stored values round-trip exactly into the attribute
//! - **Coordinate transforms**: pure Rust proj4rs when the layer and raster
//!   reference systems differ
//! - **Commit batching**: feature updates grouped into SQLite transactions
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use geosample::{sample_raster_to_attribute, GeoTiffReader, GpkgDataset, SampleOptions};
//!
//! let raster = GeoTiffReader::open("elevation.tif")?;
//! let dataset = GpkgDataset::open("sites.gpkg")?;
//!
//! let report = sample_raster_to_attribute(
//!     &raster,
//!     &dataset,
//!     "sites",
//!     "elev",
//!     SampleOptions::default(),
//! )?;
//! println!("sampled {} features, {} failed", report.sampled, report.failed);
//! ```
//!
//! ## Architecture
//!
//! - [`geotiff`]: GeoTIFF metadata parsing and typed single-pixel reads
//! - [`gpkg`]: GeoPackage layer access, attribute columns, transactions
//! - [`sample`]: the pipeline joining the two
//! - [`geometry`]: point type and CRS transformations
//! - [`range_reader`]: I/O abstraction for local/HTTP sources
//! - [`raster`]: pixel-source trait the pipeline samples through
//! - [`tile_cache`]: process-wide LRU for decoded raster chunks

pub mod geometry;
pub mod geotiff;
pub mod gpkg;
pub mod range_reader;
pub mod raster;
pub mod sample;
pub mod tile_cache;

#[cfg(test)]
pub(crate) mod test_support;

/// Result alias used throughout the crate.
pub type AnyResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

// ============================================================================
// Raster access
// ============================================================================

pub use geotiff::{Compression, GeoTiffReader, GeoTransform, PixelType, RasterMetadata};
pub use raster::{ArrayRasterSource, RasterSource};

// ============================================================================
// Vector access
// ============================================================================

pub use gpkg::{AttributeType, GpkgDataset, PointLayer};

// ============================================================================
// Sampling pipeline
// ============================================================================

pub use sample::{sample_raster_to_attribute, ProgressFn, SampleOptions, SampleReport};

// ============================================================================
// Geometry & projections
// ============================================================================

pub use geometry::projection::{project_point, CoordTransformer};
pub use geometry::Point;

// ============================================================================
// Range readers (I/O abstraction)
// ============================================================================

pub use range_reader::{
    create_range_reader, HttpRangeReader, LocalRangeReader, MemoryRangeReader, RangeReader,
};
