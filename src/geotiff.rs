//! GeoTIFF reader for single-pixel sampling
//!
//! Reads only what sampling needs: the header and IFD metadata up front
//! (typically a few KB), then one tile or strip per pixel read, fetched
//! through range requests and decoded on demand. Decoded chunks go through
//! the process-wide LRU cache so clustered points do not re-decompress the
//! same chunk.
//!
//! Values are extracted at their native type. A 16-bit integer raster is
//! sampled as `i32` and a 64-bit float raster as `f64`, with no lossy
//! intermediate conversion, so sampled attributes match the stored raster
//! values exactly.

use std::collections::HashMap;
use std::sync::Arc;

use crate::range_reader::{create_range_reader, RangeReader};
use crate::tile_cache;
use crate::AnyResult;

// TIFF tag constants
const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_PREDICTOR: u16 = 317;
const TAG_TILE_WIDTH: u16 = 322;
const TAG_TILE_LENGTH: u16 = 323;
const TAG_TILE_OFFSETS: u16 = 324;
const TAG_TILE_BYTE_COUNTS: u16 = 325;
const TAG_SAMPLE_FORMAT: u16 = 339;
const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_MODEL_TRANSFORMATION: u16 = 34264;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;

// GeoKey constants
const GEO_KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const GEO_KEY_PROJECTED_CRS: u16 = 3072;

// Compression constants
const COMPRESSION_NONE: u16 = 1;
const COMPRESSION_LZW: u16 = 5;
const COMPRESSION_DEFLATE: u16 = 8;
const COMPRESSION_ZSTD: u16 = 50000;

// Sample format constants
const SAMPLE_FORMAT_UINT: u16 = 1;
const SAMPLE_FORMAT_INT: u16 = 2;
const SAMPLE_FORMAT_FLOAT: u16 = 3;

/// Pixel data type detected from the BitsPerSample and SampleFormat tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl PixelType {
    #[must_use]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            PixelType::UInt8 | PixelType::Int8 => 1,
            PixelType::UInt16 | PixelType::Int16 => 2,
            PixelType::UInt32 | PixelType::Int32 | PixelType::Float32 => 4,
            PixelType::UInt64 | PixelType::Int64 | PixelType::Float64 => 8,
        }
    }

    /// Floating-point rasters get a floating-point attribute and f64 reads;
    /// everything else gets an integer attribute and i32 reads.
    #[must_use]
    pub fn is_float(&self) -> bool {
        matches!(self, PixelType::Float32 | PixelType::Float64)
    }

    /// Detect the pixel type from TIFF tags
    #[must_use]
    pub fn from_tags(bits_per_sample: u16, sample_format: u16) -> Option<Self> {
        match (sample_format, bits_per_sample) {
            (SAMPLE_FORMAT_UINT, 8) => Some(PixelType::UInt8),
            (SAMPLE_FORMAT_UINT, 16) => Some(PixelType::UInt16),
            (SAMPLE_FORMAT_UINT, 32) => Some(PixelType::UInt32),
            (SAMPLE_FORMAT_UINT, 64) => Some(PixelType::UInt64),
            (SAMPLE_FORMAT_INT, 8) => Some(PixelType::Int8),
            (SAMPLE_FORMAT_INT, 16) => Some(PixelType::Int16),
            (SAMPLE_FORMAT_INT, 32) => Some(PixelType::Int32),
            (SAMPLE_FORMAT_INT, 64) => Some(PixelType::Int64),
            (SAMPLE_FORMAT_FLOAT, 32) => Some(PixelType::Float32),
            (SAMPLE_FORMAT_FLOAT, 64) => Some(PixelType::Float64),
            // Default to unsigned if sample format not specified
            (_, 8) => Some(PixelType::UInt8),
            (_, 16) => Some(PixelType::UInt16),
            (_, 32) => Some(PixelType::UInt32),
            _ => None,
        }
    }
}

/// Compression method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lzw,
    Deflate,
    Zstd,
}

impl Compression {
    #[must_use]
    pub fn from_tag(value: u16) -> Option<Self> {
        match value {
            COMPRESSION_NONE => Some(Compression::None),
            COMPRESSION_LZW => Some(Compression::Lzw),
            COMPRESSION_DEFLATE | 32946 => Some(Compression::Deflate), // 32946 is old deflate
            COMPRESSION_ZSTD => Some(Compression::Zstd),
            _ => None,
        }
    }
}

/// Affine transform between pixel/line indices and world coordinates.
///
/// Coefficients follow the common raster convention:
/// `x = c0 + pixel * c1 + line * c2`, `y = c3 + pixel * c4 + line * c5`.
/// The forward direction maps pixel space to world space; [`invert`] yields
/// the world-to-pixel direction the sampler actually applies.
///
/// [`invert`]: GeoTransform::invert
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    /// Build the forward transform from the ModelPixelScale and
    /// ModelTiepoint tags (axis-aligned rasters, north-up with a negative
    /// y scale).
    #[must_use]
    pub fn from_scale_and_tiepoint(scale: [f64; 3], tiepoint: [f64; 6]) -> Self {
        let [i, j, _, x, y, _] = tiepoint;
        GeoTransform([
            x - i * scale[0],
            scale[0],
            0.0,
            y + j * scale[1],
            0.0,
            -scale[1],
        ])
    }

    /// Build the forward transform from a ModelTransformation tag
    /// (16-element row-major 4x4 matrix, used by rotated rasters).
    #[must_use]
    pub fn from_model_transformation(m: &[f64; 16]) -> Self {
        GeoTransform([m[3], m[0], m[1], m[7], m[4], m[5]])
    }

    /// Apply the transform to a coordinate pair.
    #[inline]
    #[must_use]
    pub fn apply(&self, u: f64, v: f64) -> (f64, f64) {
        let c = &self.0;
        (c[0] + u * c[1] + v * c[2], c[3] + u * c[4] + v * c[5])
    }

    /// Invert the transform. Returns `None` when the linear part is
    /// singular, which means the raster cannot be georeferenced.
    #[must_use]
    pub fn invert(&self) -> Option<GeoTransform> {
        let [c0, c1, c2, c3, c4, c5] = self.0;
        let det = c1 * c5 - c2 * c4;
        if det.abs() < 1e-15 {
            return None;
        }
        Some(GeoTransform([
            (c2 * c3 - c5 * c0) / det,
            c5 / det,
            -c2 / det,
            (c4 * c0 - c1 * c3) / det,
            -c4 / det,
            c1 / det,
        ]))
    }
}

/// Raster metadata read from the first IFD, without touching pixel data
#[derive(Debug, Clone)]
pub struct RasterMetadata {
    /// Image dimensions
    pub width: usize,
    pub height: usize,

    /// Chunk dimensions: tile size for tiled files, or full width by
    /// rows-per-strip for stripped files
    pub chunk_width: usize,
    pub chunk_height: usize,

    /// Number of bands/samples per pixel
    pub bands: usize,

    /// Pixel data type
    pub pixel_type: PixelType,

    /// Compression method
    pub compression: Compression,

    /// Predictor (1=none, 2=horizontal differencing, 3=floating point)
    pub predictor: u16,

    /// Byte order
    pub little_endian: bool,

    /// Chunk byte offsets in the file
    pub chunk_offsets: Vec<u64>,

    /// Chunk byte counts (compressed sizes)
    pub chunk_byte_counts: Vec<u64>,

    /// Number of chunks across (1 for stripped files)
    pub chunks_across: usize,

    /// Forward pixel-to-world transform, if the file is georeferenced
    pub geo_transform: Option<GeoTransform>,

    /// Detected CRS (EPSG code) from the GeoKey directory
    pub crs_code: Option<i32>,

    /// NoData value from the GDAL_NODATA tag
    pub nodata: Option<f64>,
}

impl RasterMetadata {
    /// Chunk index containing a pixel coordinate, or `None` if the pixel is
    /// outside the raster extent.
    #[must_use]
    pub fn chunk_index_for_pixel(&self, px: usize, py: usize) -> Option<usize> {
        if px >= self.width || py >= self.height {
            return None;
        }
        let chunk_col = px / self.chunk_width;
        let chunk_row = py / self.chunk_height;
        Some(chunk_row * self.chunks_across + chunk_col)
    }
}

/// GeoTIFF reader backed by a range reader
pub struct GeoTiffReader {
    reader: Arc<dyn RangeReader>,
    pub metadata: RasterMetadata,
}

impl GeoTiffReader {
    /// Open a GeoTIFF from a local path or HTTP(S) URL.
    pub fn open(source: &str) -> AnyResult<Self> {
        let reader = create_range_reader(source)?;
        Self::from_reader(reader)
    }

    /// Open from an existing range reader.
    pub fn from_reader(reader: Arc<dyn RangeReader>) -> AnyResult<Self> {
        let header_bytes = reader.read_range(0, 8)?;

        let little_endian = match &header_bytes[0..2] {
            b"II" => true,
            b"MM" => false,
            _ => return Err("Invalid TIFF signature".into()),
        };

        let version = read_u16(&header_bytes[2..4], little_endian);
        if version != 42 {
            return Err(format!("Invalid TIFF version: {version}").into());
        }

        let ifd_offset = u64::from(read_u32(&header_bytes[4..8], little_endian));
        let file_size = reader.size();

        // IFDs are small; read a bounded window and parse entries out of it.
        // Clamp to the file when the size is known (local files), otherwise
        // trust the range request.
        let ifd_size = if file_size > ifd_offset {
            4096.min((file_size - ifd_offset) as usize)
        } else {
            4096
        };
        let ifd_bytes = reader.read_range(ifd_offset, ifd_size)?;

        let metadata = parse_ifd(&ifd_bytes, &reader, little_endian)?;
        Ok(Self { reader, metadata })
    }

    /// Identifier of the underlying source.
    #[must_use]
    pub fn source(&self) -> &str {
        self.reader.identifier()
    }

    /// Read and decode one chunk (tile or strip), via the process cache.
    fn read_chunk(&self, index: usize) -> AnyResult<Arc<Vec<u8>>> {
        let source_id = self.reader.identifier();

        if let Some(cached) = tile_cache::get(source_id, index) {
            return Ok(cached);
        }

        let m = &self.metadata;
        if index >= m.chunk_offsets.len() {
            return Err(format!(
                "Chunk index {} out of range (max {})",
                index,
                m.chunk_offsets.len()
            )
            .into());
        }

        let offset = m.chunk_offsets[index];
        let byte_count = m.chunk_byte_counts[index] as usize;

        // Sparse files mark absent chunks with a zero byte count
        if byte_count == 0 {
            return Err(format!("Chunk {index} has no data (sparse file)").into());
        }

        let compressed = self.reader.read_range(offset, byte_count)?;

        let decompressed = decompress_chunk(
            &compressed,
            m.compression,
            m.chunk_width,
            m.chunk_height,
            m.bands,
            m.pixel_type.bytes_per_sample(),
        )?;

        let decoded = apply_predictor(
            &decompressed,
            m.predictor,
            m.chunk_width,
            m.bands,
            m.pixel_type.bytes_per_sample(),
        )?;

        let decoded = Arc::new(decoded);
        tile_cache::insert(source_id, index, Arc::clone(&decoded));
        Ok(decoded)
    }

    /// Raw bytes of one sample, or `None` if the pixel is outside the
    /// raster extent or inside a sparse region.
    fn sample_bytes(&self, band: usize, px: usize, py: usize) -> AnyResult<Option<Vec<u8>>> {
        let m = &self.metadata;
        if band >= m.bands {
            return Err(format!("Band {} out of range ({} bands)", band + 1, m.bands).into());
        }

        let Some(index) = m.chunk_index_for_pixel(px, py) else {
            return Ok(None);
        };

        let data = match self.read_chunk(index) {
            Ok(data) => data,
            // A sparse chunk is an absent value, not a read failure
            Err(_) if m.chunk_byte_counts.get(index) == Some(&0) => return Ok(None),
            Err(e) => return Err(e),
        };

        let chunk_col = index % m.chunks_across;
        let chunk_row = index / m.chunks_across;
        let local_x = px - chunk_col * m.chunk_width;
        let local_y = py - chunk_row * m.chunk_height;

        let bps = m.pixel_type.bytes_per_sample();
        let sample_index = (local_y * m.chunk_width + local_x) * m.bands + band;
        let offset = sample_index * bps;

        if offset + bps > data.len() {
            return Ok(None);
        }
        Ok(Some(data[offset..offset + bps].to_vec()))
    }

    /// Sample one pixel as a double-precision value (float rasters).
    pub fn sample_f64(&self, band: usize, px: usize, py: usize) -> AnyResult<Option<f64>> {
        let m = &self.metadata;
        Ok(self
            .sample_bytes(band, px, py)?
            .map(|bytes| convert_sample_f64(&bytes, m.pixel_type, m.little_endian)))
    }

    /// Sample one pixel as a 32-bit integer (integer rasters).
    pub fn sample_i32(&self, band: usize, px: usize, py: usize) -> AnyResult<Option<i32>> {
        let m = &self.metadata;
        Ok(self
            .sample_bytes(band, px, py)?
            .map(|bytes| convert_sample_i32(&bytes, m.pixel_type, m.little_endian)))
    }
}

// ============================================================================
// Byte helpers
// ============================================================================

#[inline]
fn read_u16(bytes: &[u8], little_endian: bool) -> u16 {
    if little_endian {
        u16::from_le_bytes([bytes[0], bytes[1]])
    } else {
        u16::from_be_bytes([bytes[0], bytes[1]])
    }
}

#[inline]
fn read_u32(bytes: &[u8], little_endian: bool) -> u32 {
    if little_endian {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    } else {
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

#[inline]
fn read_u64(bytes: &[u8], little_endian: bool) -> u64 {
    let b: [u8; 8] = bytes[..8].try_into().unwrap_or([0; 8]);
    if little_endian {
        u64::from_le_bytes(b)
    } else {
        u64::from_be_bytes(b)
    }
}

#[inline]
fn read_f64(bytes: &[u8], little_endian: bool) -> f64 {
    let b: [u8; 8] = bytes[..8].try_into().unwrap_or([0; 8]);
    if little_endian {
        f64::from_le_bytes(b)
    } else {
        f64::from_be_bytes(b)
    }
}

// ============================================================================
// IFD parsing
// ============================================================================

struct IfdEntry {
    field_type: u16,
    count: u32,
    value_offset: u32,
    raw_bytes: [u8; 4],
}

/// Parse the first IFD into raster metadata
fn parse_ifd(
    ifd_bytes: &[u8],
    reader: &Arc<dyn RangeReader>,
    little_endian: bool,
) -> AnyResult<RasterMetadata> {
    if ifd_bytes.len() < 2 {
        return Err("IFD truncated".into());
    }
    let entry_count = read_u16(&ifd_bytes[0..2], little_endian) as usize;

    let mut tags: HashMap<u16, IfdEntry> = HashMap::new();

    for i in 0..entry_count {
        let offset = 2 + i * 12;
        if offset + 12 > ifd_bytes.len() {
            break;
        }

        let tag = read_u16(&ifd_bytes[offset..offset + 2], little_endian);
        let field_type = read_u16(&ifd_bytes[offset + 2..offset + 4], little_endian);
        let count = read_u32(&ifd_bytes[offset + 4..offset + 8], little_endian);
        let value_offset = read_u32(&ifd_bytes[offset + 8..offset + 12], little_endian);

        tags.insert(
            tag,
            IfdEntry {
                field_type,
                count,
                value_offset,
                raw_bytes: [
                    ifd_bytes[offset + 8],
                    ifd_bytes[offset + 9],
                    ifd_bytes[offset + 10],
                    ifd_bytes[offset + 11],
                ],
            },
        );
    }

    let width = first_tag_value(&tags, TAG_IMAGE_WIDTH, reader, little_endian)?
        .ok_or("Missing ImageWidth tag")? as usize;
    let height = first_tag_value(&tags, TAG_IMAGE_LENGTH, reader, little_endian)?
        .ok_or("Missing ImageLength tag")? as usize;

    let bits_per_sample =
        first_tag_value(&tags, TAG_BITS_PER_SAMPLE, reader, little_endian)?.unwrap_or(8) as u16;
    let sample_format =
        first_tag_value(&tags, TAG_SAMPLE_FORMAT, reader, little_endian)?.unwrap_or(1) as u16;
    let bands =
        first_tag_value(&tags, TAG_SAMPLES_PER_PIXEL, reader, little_endian)?.unwrap_or(1) as usize;
    let compression_val =
        first_tag_value(&tags, TAG_COMPRESSION, reader, little_endian)?.unwrap_or(1) as u16;
    let predictor =
        first_tag_value(&tags, TAG_PREDICTOR, reader, little_endian)?.unwrap_or(1) as u16;

    let pixel_type = PixelType::from_tags(bits_per_sample, sample_format).ok_or_else(|| {
        format!("Unsupported pixel type: bits={bits_per_sample}, format={sample_format}")
    })?;

    let compression = Compression::from_tag(compression_val)
        .ok_or_else(|| format!("Unsupported compression: {compression_val}"))?;

    let has_tile_tags = tags.contains_key(&TAG_TILE_OFFSETS);
    let has_strip_tags = tags.contains_key(&TAG_STRIP_OFFSETS);

    let (chunk_width, chunk_height, chunks_across, chunk_offsets, chunk_byte_counts) =
        if has_tile_tags {
            let cw = first_tag_value(&tags, TAG_TILE_WIDTH, reader, little_endian)?
                .ok_or("Tiled file missing TileWidth tag")? as usize;
            let ch = first_tag_value(&tags, TAG_TILE_LENGTH, reader, little_endian)?
                .ok_or("Tiled file missing TileLength tag")? as usize;
            let across = width.div_ceil(cw);
            let down = height.div_ceil(ch);
            let total = across * down;

            let offsets =
                read_tag_array_u64(&tags, TAG_TILE_OFFSETS, reader, little_endian, total)?;
            let byte_counts =
                read_tag_array_u64(&tags, TAG_TILE_BYTE_COUNTS, reader, little_endian, total)?;

            (cw, ch, across, offsets, byte_counts)
        } else if has_strip_tags {
            // Stripped file: treat each strip as a full-width chunk
            let rows_per_strip = first_tag_value(&tags, TAG_ROWS_PER_STRIP, reader, little_endian)?
                .unwrap_or(height as u32) as usize;
            let total = height.div_ceil(rows_per_strip);

            let offsets =
                read_tag_array_u64(&tags, TAG_STRIP_OFFSETS, reader, little_endian, total)?;
            let byte_counts =
                read_tag_array_u64(&tags, TAG_STRIP_BYTE_COUNTS, reader, little_endian, total)?;

            (width, rows_per_strip, 1, offsets, byte_counts)
        } else {
            return Err("TIFF has neither tile nor strip tags".into());
        };

    let pixel_scale = read_tag_f64_array(&tags, TAG_MODEL_PIXEL_SCALE, reader, little_endian, 3)?;
    let tiepoint = read_tag_f64_array(&tags, TAG_MODEL_TIEPOINT, reader, little_endian, 6)?;
    let model_transformation =
        read_tag_f64_array(&tags, TAG_MODEL_TRANSFORMATION, reader, little_endian, 16)?;

    let geo_transform = match (pixel_scale, tiepoint, model_transformation) {
        (_, _, Some(m)) => {
            let matrix: [f64; 16] = m[..16].try_into()?;
            Some(GeoTransform::from_model_transformation(&matrix))
        }
        (Some(scale), Some(tie), None) => Some(GeoTransform::from_scale_and_tiepoint(
            [scale[0], scale[1], scale[2]],
            [tie[0], tie[1], tie[2], tie[3], tie[4], tie[5]],
        )),
        _ => None,
    };

    let crs_code = read_crs_from_geokeys(&tags, reader, little_endian)?;
    let nodata = read_gdal_nodata(&tags, reader, little_endian)?;

    Ok(RasterMetadata {
        width,
        height,
        chunk_width,
        chunk_height,
        bands,
        pixel_type,
        compression,
        predictor,
        little_endian,
        chunk_offsets,
        chunk_byte_counts,
        chunks_across,
        geo_transform,
        crs_code,
        nodata,
    })
}

/// Resolve the bytes an entry's values live in: inline for short values,
/// otherwise fetched from the entry's value offset.
fn entry_value_bytes(
    entry: &IfdEntry,
    type_size: usize,
    reader: &Arc<dyn RangeReader>,
) -> AnyResult<Vec<u8>> {
    let total_bytes = entry.count as usize * type_size;
    if total_bytes <= 4 {
        Ok(entry.raw_bytes[..total_bytes].to_vec())
    } else {
        reader.read_range(u64::from(entry.value_offset), total_bytes)
    }
}

/// First value of a numeric tag (BYTE/SHORT/LONG), whether inline or stored
/// at an offset. Multi-valued tags like per-band BitsPerSample resolve to
/// their first element.
fn first_tag_value(
    tags: &HashMap<u16, IfdEntry>,
    tag: u16,
    reader: &Arc<dyn RangeReader>,
    little_endian: bool,
) -> AnyResult<Option<u32>> {
    let Some(entry) = tags.get(&tag) else {
        return Ok(None);
    };

    let type_size = match entry.field_type {
        1 => 1, // BYTE
        3 => 2, // SHORT
        4 => 4, // LONG
        _ => return Ok(None),
    };

    if entry.count == 0 {
        return Ok(None);
    }

    let bytes = entry_value_bytes(entry, type_size, reader)?;
    let value = match entry.field_type {
        1 => u32::from(bytes[0]),
        3 => u32::from(read_u16(&bytes, little_endian)),
        4 => read_u32(&bytes, little_endian),
        _ => unreachable!(),
    };
    Ok(Some(value))
}

fn read_tag_array_u64(
    tags: &HashMap<u16, IfdEntry>,
    tag: u16,
    reader: &Arc<dyn RangeReader>,
    little_endian: bool,
    expected_count: usize,
) -> AnyResult<Vec<u64>> {
    let entry = tags.get(&tag).ok_or_else(|| format!("Missing tag {tag}"))?;

    let type_size = match entry.field_type {
        3 => 2,  // SHORT
        4 => 4,  // LONG
        16 => 8, // LONG8
        _ => {
            return Err(format!("Unsupported type {} for tag {}", entry.field_type, tag).into());
        }
    };

    let raw_bytes = entry_value_bytes(entry, type_size, reader)?;

    let mut values = Vec::with_capacity(entry.count as usize);
    for i in 0..entry.count as usize {
        let offset = i * type_size;
        let value = match entry.field_type {
            3 => u64::from(read_u16(&raw_bytes[offset..], little_endian)),
            4 => u64::from(read_u32(&raw_bytes[offset..], little_endian)),
            16 => read_u64(&raw_bytes[offset..], little_endian),
            _ => 0,
        };
        values.push(value);
    }

    // Pad with zeros if we got fewer than expected
    while values.len() < expected_count {
        values.push(0);
    }

    Ok(values)
}

fn read_tag_f64_array(
    tags: &HashMap<u16, IfdEntry>,
    tag: u16,
    reader: &Arc<dyn RangeReader>,
    little_endian: bool,
    min_count: usize,
) -> AnyResult<Option<Vec<f64>>> {
    let Some(entry) = tags.get(&tag) else {
        return Ok(None);
    };

    if entry.field_type != 12 {
        // DOUBLE
        return Ok(None);
    }

    if (entry.count as usize) < min_count {
        return Ok(None);
    }

    let total_bytes = entry.count as usize * 8;
    let raw_bytes = reader.read_range(u64::from(entry.value_offset), total_bytes)?;

    let mut values = Vec::with_capacity(entry.count as usize);
    for i in 0..entry.count as usize {
        values.push(read_f64(&raw_bytes[i * 8..], little_endian));
    }

    Ok(Some(values))
}

fn read_crs_from_geokeys(
    tags: &HashMap<u16, IfdEntry>,
    reader: &Arc<dyn RangeReader>,
    little_endian: bool,
) -> AnyResult<Option<i32>> {
    let Some(entry) = tags.get(&TAG_GEO_KEY_DIRECTORY) else {
        return Ok(None);
    };

    // GeoKey directory is an array of SHORT values
    if entry.field_type != 3 {
        return Ok(None);
    }

    let raw_bytes = entry_value_bytes(entry, 2, reader)?;

    // Directory header: KeyDirectoryVersion, KeyRevision, MinorRevision,
    // NumberOfKeys, then (KeyID, TIFFTagLocation, Count, Value) per key
    if raw_bytes.len() < 8 {
        return Ok(None);
    }

    let num_keys = read_u16(&raw_bytes[6..8], little_endian) as usize;

    for i in 0..num_keys {
        let offset = 8 + i * 8;
        if offset + 8 > raw_bytes.len() {
            break;
        }

        let key_id = read_u16(&raw_bytes[offset..], little_endian);
        let value = read_u16(&raw_bytes[offset + 6..], little_endian);

        if key_id == GEO_KEY_PROJECTED_CRS && value > 0 {
            return Ok(Some(i32::from(value)));
        }
        if key_id == GEO_KEY_GEOGRAPHIC_TYPE && value > 0 {
            return Ok(Some(i32::from(value)));
        }
    }

    Ok(None)
}

fn read_gdal_nodata(
    tags: &HashMap<u16, IfdEntry>,
    reader: &Arc<dyn RangeReader>,
    _little_endian: bool,
) -> AnyResult<Option<f64>> {
    let Some(entry) = tags.get(&TAG_GDAL_NODATA) else {
        return Ok(None);
    };

    let raw_bytes = entry_value_bytes(entry, 1, reader)?;

    let nodata_str = String::from_utf8_lossy(&raw_bytes);
    let nodata_str = nodata_str.trim_end_matches('\0').trim();

    Ok(nodata_str.parse().ok())
}

// ============================================================================
// Decompression and sample conversion
// ============================================================================

fn decompress_chunk(
    compressed: &[u8],
    compression: Compression,
    chunk_width: usize,
    chunk_height: usize,
    bands: usize,
    bytes_per_sample: usize,
) -> AnyResult<Vec<u8>> {
    let expected_size = chunk_width * chunk_height * bands * bytes_per_sample;

    match compression {
        Compression::None => {
            if compressed.len() >= expected_size {
                Ok(compressed[..expected_size].to_vec())
            } else {
                // Short final strip; pad to the declared chunk shape
                let mut result = compressed.to_vec();
                result.resize(expected_size, 0);
                Ok(result)
            }
        }
        Compression::Deflate => {
            use std::io::Read;
            let mut decoder = flate2::read::ZlibDecoder::new(compressed);
            let mut decompressed = Vec::with_capacity(expected_size);
            decoder.read_to_end(&mut decompressed)?;
            Ok(decompressed)
        }
        Compression::Lzw => {
            let mut decoder =
                weezl::decode::Decoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8);
            let decompressed = decoder.decode(compressed)?;
            Ok(decompressed)
        }
        Compression::Zstd => {
            let decompressed = zstd::stream::decode_all(compressed)?;
            Ok(decompressed)
        }
    }
}

/// Reverse TIFF predictor encoding to recover original sample values.
///
/// Predictor 2 (horizontal differencing) stores each sample as the
/// difference from the previous sample in the row; decoding accumulates
/// whole samples as integers so carries propagate across the bytes of
/// multi-byte samples. Predictor 3 (floating point) differences each byte
/// position independently. Rows never accumulate across boundaries.
fn apply_predictor(
    data: &[u8],
    predictor: u16,
    chunk_width: usize,
    bands: usize,
    bytes_per_sample: usize,
) -> AnyResult<Vec<u8>> {
    match predictor {
        1 => Ok(data.to_vec()),

        2 => {
            let mut result = data.to_vec();
            let row_bytes = chunk_width * bands * bytes_per_sample;
            let samples_per_row = chunk_width * bands;

            for row in result.chunks_mut(row_bytes) {
                match bytes_per_sample {
                    1 => {
                        for i in 1..row.len() {
                            row[i] = row[i].wrapping_add(row[i - 1]);
                        }
                    }
                    2 => {
                        for i in 1..samples_per_row {
                            let prev_offset = (i - 1) * 2;
                            let curr_offset = i * 2;
                            if curr_offset + 2 > row.len() {
                                break;
                            }
                            let prev = u16::from_le_bytes([row[prev_offset], row[prev_offset + 1]]);
                            let curr = u16::from_le_bytes([row[curr_offset], row[curr_offset + 1]]);
                            let sum = curr.wrapping_add(prev);
                            row[curr_offset..curr_offset + 2].copy_from_slice(&sum.to_le_bytes());
                        }
                    }
                    4 => {
                        for i in 1..samples_per_row {
                            let prev_offset = (i - 1) * 4;
                            let curr_offset = i * 4;
                            if curr_offset + 4 > row.len() {
                                break;
                            }
                            let prev = u32::from_le_bytes([
                                row[prev_offset],
                                row[prev_offset + 1],
                                row[prev_offset + 2],
                                row[prev_offset + 3],
                            ]);
                            let curr = u32::from_le_bytes([
                                row[curr_offset],
                                row[curr_offset + 1],
                                row[curr_offset + 2],
                                row[curr_offset + 3],
                            ]);
                            let sum = curr.wrapping_add(prev);
                            row[curr_offset..curr_offset + 4].copy_from_slice(&sum.to_le_bytes());
                        }
                    }
                    8 => {
                        for i in 1..samples_per_row {
                            let prev_offset = (i - 1) * 8;
                            let curr_offset = i * 8;
                            if curr_offset + 8 > row.len() {
                                break;
                            }
                            let prev = u64::from_le_bytes([
                                row[prev_offset],
                                row[prev_offset + 1],
                                row[prev_offset + 2],
                                row[prev_offset + 3],
                                row[prev_offset + 4],
                                row[prev_offset + 5],
                                row[prev_offset + 6],
                                row[prev_offset + 7],
                            ]);
                            let curr = u64::from_le_bytes([
                                row[curr_offset],
                                row[curr_offset + 1],
                                row[curr_offset + 2],
                                row[curr_offset + 3],
                                row[curr_offset + 4],
                                row[curr_offset + 5],
                                row[curr_offset + 6],
                                row[curr_offset + 7],
                            ]);
                            let sum = curr.wrapping_add(prev);
                            row[curr_offset..curr_offset + 8].copy_from_slice(&sum.to_le_bytes());
                        }
                    }
                    _ => {
                        for i in bytes_per_sample..row.len() {
                            row[i] = row[i].wrapping_add(row[i - bytes_per_sample]);
                        }
                    }
                }
            }

            Ok(result)
        }

        3 => {
            let mut result = data.to_vec();
            let row_bytes = chunk_width * bands * bytes_per_sample;

            for row in result.chunks_mut(row_bytes) {
                for byte_pos in 0..bytes_per_sample {
                    for i in 1..(row.len() / bytes_per_sample) {
                        let idx = i * bytes_per_sample + byte_pos;
                        let prev_idx = (i - 1) * bytes_per_sample + byte_pos;
                        row[idx] = row[idx].wrapping_add(row[prev_idx]);
                    }
                }
            }

            Ok(result)
        }

        _ => Err(format!("Unsupported predictor: {predictor}").into()),
    }
}

fn convert_sample_f64(bytes: &[u8], pixel_type: PixelType, little_endian: bool) -> f64 {
    match pixel_type {
        PixelType::UInt8 => f64::from(bytes[0]),
        PixelType::Int8 => f64::from(bytes[0] as i8),
        PixelType::UInt16 => f64::from(read_u16(bytes, little_endian)),
        PixelType::Int16 => f64::from(read_u16(bytes, little_endian) as i16),
        PixelType::UInt32 => f64::from(read_u32(bytes, little_endian)),
        PixelType::Int32 => f64::from(read_u32(bytes, little_endian) as i32),
        PixelType::UInt64 => read_u64(bytes, little_endian) as f64,
        PixelType::Int64 => (read_u64(bytes, little_endian) as i64) as f64,
        PixelType::Float32 => f64::from(f32::from_bits(read_u32(bytes, little_endian))),
        PixelType::Float64 => read_f64(bytes, little_endian),
    }
}

fn convert_sample_i32(bytes: &[u8], pixel_type: PixelType, little_endian: bool) -> i32 {
    match pixel_type {
        PixelType::UInt8 => i32::from(bytes[0]),
        PixelType::Int8 => i32::from(bytes[0] as i8),
        PixelType::UInt16 => i32::from(read_u16(bytes, little_endian)),
        PixelType::Int16 => i32::from(read_u16(bytes, little_endian) as i16),
        PixelType::Int32 => read_u32(bytes, little_endian) as i32,
        // Wider integer types saturate into the i32 attribute
        PixelType::UInt32 => {
            let v = read_u32(bytes, little_endian);
            v.min(i32::MAX as u32) as i32
        }
        PixelType::UInt64 => {
            let v = read_u64(bytes, little_endian);
            v.min(i32::MAX as u64) as i32
        }
        PixelType::Int64 => {
            let v = read_u64(bytes, little_endian) as i64;
            v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
        }
        PixelType::Float32 => f32::from_bits(read_u32(bytes, little_endian)) as i32,
        PixelType::Float64 => read_f64(bytes, little_endian) as i32,
    }
}
