//! Test fixtures: synthetic GeoTIFF rasters and GeoPackage layers
//!
//! Compiled only for tests. The raster writer drives the tiff crate's
//! low-level directory encoder so fixtures can carry any sample format the
//! reader supports, plus the GeoTIFF tags (pixel scale, tiepoint, GeoKey
//! directory, nodata) the pipeline depends on.

use std::io::Cursor;
use std::path::Path;

use rusqlite::Connection;
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

use crate::AnyResult;

// GeoTIFF tag ids (not in the tiff crate's standard tag set)
const GEOTIFF_MODELPIXELSCALE: u16 = 33550;
const GEOTIFF_MODELTIEPOINT: u16 = 33922;
const GEOTIFF_GEOKEYDIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

// GeoKey ids and values
const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Sample payload of a fixture raster, one band, row-major
pub enum FixtureData {
    U8(Vec<u8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl FixtureData {
    fn bits_per_sample(&self) -> u16 {
        match self {
            FixtureData::U8(_) => 8,
            FixtureData::I16(_) => 16,
            FixtureData::I32(_) | FixtureData::F32(_) => 32,
            FixtureData::F64(_) => 64,
        }
    }

    fn sample_format(&self) -> u16 {
        match self {
            FixtureData::U8(_) => 1,
            FixtureData::I16(_) | FixtureData::I32(_) => 2,
            FixtureData::F32(_) | FixtureData::F64(_) => 3,
        }
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            FixtureData::U8(v) => v.clone(),
            FixtureData::I16(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
            FixtureData::I32(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
            FixtureData::F32(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
            FixtureData::F64(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
        }
    }
}

/// Builder for a single-band GeoTIFF fixture
pub struct FixtureRaster {
    pub width: usize,
    pub height: usize,
    data: FixtureData,
    origin: (f64, f64),
    resolution: (f64, f64),
    epsg: Option<u16>,
    nodata: Option<f64>,
    deflate: bool,
}

impl FixtureRaster {
    fn new(width: usize, height: usize, data: FixtureData) -> Self {
        Self {
            width,
            height,
            data,
            origin: (0.0, 0.0),
            resolution: (1.0, 1.0),
            epsg: None,
            nodata: None,
            deflate: false,
        }
    }

    pub fn uint8(width: usize, height: usize, values: &[u8]) -> Self {
        Self::new(width, height, FixtureData::U8(values.to_vec()))
    }

    pub fn int16(width: usize, height: usize, values: &[i16]) -> Self {
        Self::new(width, height, FixtureData::I16(values.to_vec()))
    }

    pub fn int32(width: usize, height: usize, values: &[i32]) -> Self {
        Self::new(width, height, FixtureData::I32(values.to_vec()))
    }

    pub fn float32(width: usize, height: usize, values: &[f32]) -> Self {
        Self::new(width, height, FixtureData::F32(values.to_vec()))
    }

    pub fn float64(width: usize, height: usize, values: &[f64]) -> Self {
        Self::new(width, height, FixtureData::F64(values.to_vec()))
    }

    /// World coordinate of the raster's top-left corner.
    pub fn origin(mut self, x: f64, y: f64) -> Self {
        self.origin = (x, y);
        self
    }

    /// Pixel size in world units (both positive; y decreases downward).
    pub fn resolution(mut self, x: f64, y: f64) -> Self {
        self.resolution = (x, y);
        self
    }

    pub fn epsg(mut self, code: u16) -> Self {
        self.epsg = Some(code);
        self
    }

    pub fn nodata(mut self, value: f64) -> Self {
        self.nodata = Some(value);
        self
    }

    pub fn deflate(mut self) -> Self {
        self.deflate = true;
        self
    }
}

/// Encode a fixture as GeoTIFF bytes (single band, one strip).
pub fn write_geotiff_bytes(fixture: &FixtureRaster) -> AnyResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    let mut encoder = TiffEncoder::new(&mut cursor)?;
    let mut dir = encoder.new_directory()?;

    dir.write_tag(Tag::ImageWidth, fixture.width as u32)?;
    dir.write_tag(Tag::ImageLength, fixture.height as u32)?;
    dir.write_tag(Tag::BitsPerSample, fixture.data.bits_per_sample())?;
    dir.write_tag(Tag::Compression, if fixture.deflate { 8u16 } else { 1u16 })?;
    dir.write_tag(Tag::PhotometricInterpretation, 1u16)?; // BlackIsZero
    dir.write_tag(Tag::SamplesPerPixel, 1u16)?;
    dir.write_tag(Tag::SampleFormat, fixture.data.sample_format())?;
    dir.write_tag(Tag::PlanarConfiguration, 1u16)?;
    dir.write_tag(Tag::RowsPerStrip, fixture.height as u32)?;

    // GeoTIFF georeferencing: ModelPixelScale + ModelTiepoint pin pixel
    // (0, 0) to the origin
    let pixel_scale = [fixture.resolution.0, fixture.resolution.1, 0.0];
    dir.write_tag(Tag::Unknown(GEOTIFF_MODELPIXELSCALE), pixel_scale.as_slice())?;
    let tiepoint = [0.0, 0.0, 0.0, fixture.origin.0, fixture.origin.1, 0.0];
    dir.write_tag(Tag::Unknown(GEOTIFF_MODELTIEPOINT), tiepoint.as_slice())?;

    if let Some(epsg) = fixture.epsg {
        let geokeys = build_geokey_directory(epsg);
        dir.write_tag(Tag::Unknown(GEOTIFF_GEOKEYDIRECTORY), geokeys.as_slice())?;
    }

    if let Some(nodata) = fixture.nodata {
        let ascii = format!("{nodata}\0");
        dir.write_tag(Tag::Unknown(GDAL_NODATA), ascii.as_bytes())?;
    }

    let raw = fixture.data.to_le_bytes();
    let strip_bytes = if fixture.deflate {
        use flate2::write::ZlibEncoder;
        use flate2::Compression as Flate2Compression;
        use std::io::Write;

        let mut zlib = ZlibEncoder::new(Vec::new(), Flate2Compression::default());
        zlib.write_all(&raw)?;
        zlib.finish()?
    } else {
        raw
    };

    let strip_offset = dir.write_data(strip_bytes.as_slice())?;
    dir.write_tag(Tag::StripOffsets, strip_offset)?;
    dir.write_tag(Tag::StripByteCounts, strip_bytes.len() as u32)?;
    dir.finish()?;

    Ok(cursor.into_inner())
}

/// Write a fixture raster to a file on disk.
pub fn write_geotiff_file(fixture: &FixtureRaster, path: impl AsRef<Path>) -> AnyResult<()> {
    let bytes = write_geotiff_bytes(fixture)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

fn build_geokey_directory(epsg: u16) -> Vec<u16> {
    let is_geographic = crate::geometry::projection::is_geographic_crs(i32::from(epsg));

    let mut keys = vec![
        1, // KeyDirectoryVersion
        1, // KeyRevision
        0, // MinorRevision
        3, // NumberOfKeys
    ];

    keys.extend_from_slice(&[
        GT_MODEL_TYPE_GEO_KEY,
        0,
        1,
        if is_geographic {
            MODEL_TYPE_GEOGRAPHIC
        } else {
            MODEL_TYPE_PROJECTED
        },
    ]);
    keys.extend_from_slice(&[GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA]);

    if is_geographic {
        keys.extend_from_slice(&[GEOGRAPHIC_TYPE_GEO_KEY, 0, 1, epsg]);
    } else {
        keys.extend_from_slice(&[PROJECTED_CS_TYPE_GEO_KEY, 0, 1, epsg]);
    }

    keys
}

// ============================================================================
// GeoPackage fixtures
// ============================================================================

/// Encode a 2D point as a GeoPackage geometry blob (standard encoding,
/// little endian, no envelope).
pub fn encode_gpb_point(srs_id: i32, x: f64, y: f64) -> Vec<u8> {
    let mut blob = Vec::with_capacity(8 + 21);
    blob.extend_from_slice(b"GP");
    blob.push(0); // version
    blob.push(0b0000_0001); // flags: little endian, no envelope
    blob.extend_from_slice(&srs_id.to_le_bytes());
    // WKB point
    blob.push(1); // little endian
    blob.extend_from_slice(&1u32.to_le_bytes()); // wkbPoint
    blob.extend_from_slice(&x.to_le_bytes());
    blob.extend_from_slice(&y.to_le_bytes());
    blob
}

/// Create a GeoPackage file containing one point layer.
///
/// The layer's srs_id equals the EPSG code, registered in
/// `gpkg_spatial_ref_sys` alongside the mandatory default entries.
pub fn create_point_gpkg(
    path: impl AsRef<Path>,
    table: &str,
    epsg: i32,
    points: &[(f64, f64)],
) -> AnyResult<()> {
    let conn = Connection::open(path.as_ref())?;

    conn.execute_batch(
        "PRAGMA application_id = 0x47504B47;
         CREATE TABLE gpkg_spatial_ref_sys (
             srs_name TEXT NOT NULL,
             srs_id INTEGER PRIMARY KEY,
             organization TEXT NOT NULL,
             organization_coordsys_id INTEGER NOT NULL,
             definition TEXT NOT NULL,
             description TEXT
         );
         INSERT INTO gpkg_spatial_ref_sys VALUES
             ('Undefined cartesian SRS', -1, 'NONE', -1, 'undefined', NULL),
             ('Undefined geographic SRS', 0, 'NONE', 0, 'undefined', NULL);
         CREATE TABLE gpkg_contents (
             table_name TEXT NOT NULL PRIMARY KEY,
             data_type TEXT NOT NULL,
             identifier TEXT UNIQUE,
             description TEXT DEFAULT '',
             last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
             min_x DOUBLE, min_y DOUBLE, max_x DOUBLE, max_y DOUBLE,
             srs_id INTEGER
         );
         CREATE TABLE gpkg_geometry_columns (
             table_name TEXT NOT NULL PRIMARY KEY,
             column_name TEXT NOT NULL,
             geometry_type_name TEXT NOT NULL,
             srs_id INTEGER NOT NULL,
             z TINYINT NOT NULL,
             m TINYINT NOT NULL
         );",
    )?;

    conn.execute(
        "INSERT INTO gpkg_spatial_ref_sys VALUES (?1, ?2, 'EPSG', ?2, 'undefined', NULL)",
        rusqlite::params![format!("EPSG:{epsg}"), epsg],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE \"{table}\" (fid INTEGER PRIMARY KEY AUTOINCREMENT, geom BLOB)"
        ),
        [],
    )?;
    conn.execute(
        "INSERT INTO gpkg_contents (table_name, data_type, identifier, srs_id) \
         VALUES (?1, 'features', ?1, ?2)",
        rusqlite::params![table, epsg],
    )?;
    conn.execute(
        "INSERT INTO gpkg_geometry_columns VALUES (?1, 'geom', 'POINT', ?2, 0, 0)",
        rusqlite::params![table, epsg],
    )?;

    for &(x, y) in points {
        conn.execute(
            &format!("INSERT INTO \"{table}\" (geom) VALUES (?1)"),
            [encode_gpb_point(epsg, x, y)],
        )?;
    }

    Ok(())
}
