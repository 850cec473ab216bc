//! GeoPackage point-layer access
//!
//! Read-write access to the one vector container the pipeline mutates.
//! Layers resolve through the GeoPackage core tables (`gpkg_contents`,
//! `gpkg_geometry_columns`, `gpkg_spatial_ref_sys`); features are addressed
//! by the table's integer primary key, which is the stable feature id the
//! two-pass update relies on. Commit batching rides on SQLite transactions.

use std::path::Path;

use rusqlite::{Connection, OpenFlags, Transaction};
use tracing::debug;

use crate::geometry::Point;
use crate::AnyResult;

/// Type of the attribute column created for sampled values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    /// Floating point (`DOUBLE`)
    Real,
    /// 32-bit integer (`MEDIUMINT` in GeoPackage terms)
    Integer,
}

impl AttributeType {
    #[must_use]
    pub fn sql_type(&self) -> &'static str {
        match self {
            AttributeType::Real => "DOUBLE",
            AttributeType::Integer => "MEDIUMINT",
        }
    }
}

/// An open GeoPackage file
#[derive(Debug)]
pub struct GpkgDataset {
    conn: Connection,
    path: String,
}

impl GpkgDataset {
    /// Open an existing GeoPackage read-write. Never creates a file.
    pub fn open(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;

        let core_tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('gpkg_contents', 'gpkg_geometry_columns')",
            [],
            |row| row.get(0),
        )?;
        if core_tables != 2 {
            return Err(format!(
                "{} is not a GeoPackage (core tables missing)",
                path.display()
            )
            .into());
        }

        Ok(Self {
            conn,
            path: path.display().to_string(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Resolve a named feature layer.
    pub fn layer(&self, name: &str) -> AnyResult<PointLayer<'_>> {
        let row = self.conn.query_row(
            "SELECT c.table_name, g.column_name, g.srs_id \
             FROM gpkg_contents c \
             JOIN gpkg_geometry_columns g ON g.table_name = c.table_name \
             WHERE c.table_name = ?1 AND c.data_type = 'features'",
            [name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        );

        let (table, geometry_column, srs_id) = match row {
            Ok(v) => v,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(format!("Layer '{name}' not found in {}", self.path).into());
            }
            Err(e) => return Err(e.into()),
        };

        let fid_column = self.integer_primary_key(&table)?.ok_or_else(|| {
            format!("Layer '{name}' has no integer primary key to use as a feature id")
        })?;

        let srs_epsg = self.epsg_for_srs(srs_id)?;
        debug!(
            layer = name,
            fid = %fid_column,
            srs_id,
            srs_epsg = ?srs_epsg,
            "resolved feature layer"
        );

        Ok(PointLayer {
            conn: &self.conn,
            table,
            geometry_column,
            fid_column,
            srs_epsg,
        })
    }

    /// Begin a transaction for a batch of feature updates.
    pub fn begin(&self) -> AnyResult<Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    /// Name of the table's INTEGER PRIMARY KEY column, if it has one.
    fn integer_primary_key(&self, table: &str) -> AnyResult<Option<String>> {
        let sql = format!("PRAGMA table_info({})", quote_identifier(table));
        let mut stmt = self.conn.prepare(&sql)?;
        let columns = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?, // name
                row.get::<_, String>(2)?, // declared type
                row.get::<_, i64>(5)?,    // pk ordinal
            ))
        })?;

        for column in columns {
            let (name, declared_type, pk) = column?;
            if pk == 1 && declared_type.to_ascii_uppercase().contains("INT") {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    /// Resolve a gpkg srs_id to an EPSG code. The reserved ids 0 and -1
    /// mean undefined; non-EPSG authorities resolve to `None`.
    fn epsg_for_srs(&self, srs_id: i64) -> AnyResult<Option<i32>> {
        if srs_id <= 0 {
            return Ok(None);
        }

        let row = self.conn.query_row(
            "SELECT organization, organization_coordsys_id \
             FROM gpkg_spatial_ref_sys WHERE srs_id = ?1",
            [srs_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        );

        match row {
            Ok((organization, code)) if organization.eq_ignore_ascii_case("epsg") => {
                Ok(Some(code as i32))
            }
            Ok(_) => Ok(None),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// A feature layer holding point geometries
#[derive(Debug)]
pub struct PointLayer<'a> {
    conn: &'a Connection,
    pub table: String,
    pub geometry_column: String,
    pub fid_column: String,
    /// EPSG code of the layer SRS, when resolvable
    pub srs_epsg: Option<i32>,
}

impl PointLayer<'_> {
    /// Declared feature count.
    pub fn feature_count(&self) -> AnyResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(&self.table));
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// One full scan collecting every feature id, sized to the declared
    /// count. The update pass revisits each id exactly once.
    pub fn feature_ids(&self) -> AnyResult<Vec<i64>> {
        let declared = self.feature_count()? as usize;
        let mut ids = Vec::with_capacity(declared);

        let sql = format!(
            "SELECT {} FROM {}",
            quote_identifier(&self.fid_column),
            quote_identifier(&self.table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    /// Re-fetch one feature by id and decode its point geometry.
    pub fn point(&self, fid: i64) -> AnyResult<Point> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            quote_identifier(&self.geometry_column),
            quote_identifier(&self.table),
            quote_identifier(&self.fid_column)
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let blob: Option<Vec<u8>> = stmt.query_row([fid], |row| row.get(0))?;
        let blob = blob.ok_or_else(|| format!("Feature {fid} has no geometry"))?;
        parse_gpkg_point(&blob)
    }

    /// Create the attribute column. A duplicate name surfaces as the
    /// ALTER TABLE error and fails the run.
    pub fn add_column(&self, name: &str, attribute_type: AttributeType) -> AnyResult<()> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_identifier(&self.table),
            quote_identifier(name),
            attribute_type.sql_type()
        );
        self.conn.execute(&sql, [])?;
        debug!(
            table = %self.table,
            column = name,
            sql_type = attribute_type.sql_type(),
            "created attribute column"
        );
        Ok(())
    }

    pub fn set_f64(&self, fid: i64, column: &str, value: f64) -> AnyResult<()> {
        let mut stmt = self.conn.prepare_cached(&self.update_sql(column))?;
        stmt.execute(rusqlite::params![value, fid])?;
        Ok(())
    }

    pub fn set_i32(&self, fid: i64, column: &str, value: i32) -> AnyResult<()> {
        let mut stmt = self.conn.prepare_cached(&self.update_sql(column))?;
        stmt.execute(rusqlite::params![value, fid])?;
        Ok(())
    }

    /// NULL out the attribute for features whose pixel read failed.
    pub fn set_null(&self, fid: i64, column: &str) -> AnyResult<()> {
        let mut stmt = self.conn.prepare_cached(&self.update_sql(column))?;
        stmt.execute(rusqlite::params![rusqlite::types::Null, fid])?;
        Ok(())
    }

    fn update_sql(&self, column: &str) -> String {
        format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
            quote_identifier(&self.table),
            quote_identifier(column),
            quote_identifier(&self.fid_column)
        )
    }
}

/// Quote an SQL identifier, doubling embedded quotes.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ============================================================================
// GeoPackage geometry blobs
// ============================================================================

/// Decode a GeoPackage geometry blob into a point.
///
/// Header layout: magic "GP", version, flags, srs_id, optional envelope,
/// then standard WKB. Only point geometries are accepted; everything else
/// is a per-feature error for the caller to surface.
pub fn parse_gpkg_point(blob: &[u8]) -> AnyResult<Point> {
    if blob.len() < 8 || &blob[0..2] != b"GP" {
        return Err("Not a GeoPackage geometry blob".into());
    }

    let flags = blob[3];
    if flags & 0b0010_0000 != 0 {
        return Err("Extended geometry encoding is not supported".into());
    }
    if flags & 0b0001_0000 != 0 {
        return Err("Feature has an empty geometry".into());
    }

    let envelope_size = match (flags >> 1) & 0b0111 {
        0 => 0,
        1 => 32,
        2 | 3 => 48,
        4 => 64,
        other => return Err(format!("Invalid envelope indicator: {other}").into()),
    };

    let wkb = blob
        .get(8 + envelope_size..)
        .ok_or("Geometry blob truncated before WKB")?;
    parse_wkb_point(wkb)
}

fn parse_wkb_point(wkb: &[u8]) -> AnyResult<Point> {
    if wkb.len() < 21 {
        return Err("WKB too short for a point".into());
    }

    let little_endian = match wkb[0] {
        0 => false,
        1 => true,
        other => return Err(format!("Invalid WKB byte order: {other}").into()),
    };

    let raw_type = if little_endian {
        u32::from_le_bytes([wkb[1], wkb[2], wkb[3], wkb[4]])
    } else {
        u32::from_be_bytes([wkb[1], wkb[2], wkb[3], wkb[4]])
    };

    // Accept plain points plus the ISO (1001/2001/3001) and flag-bit
    // (0x80000000/0x40000000) Z/M variants; coordinates start with x/y
    // either way
    let base_type = (raw_type & 0x0FFF_FFFF) % 1000;
    if base_type != 1 {
        return Err(format!("Geometry type {raw_type} is not a point").into());
    }

    let coord = |range: std::ops::Range<usize>| -> f64 {
        let b: [u8; 8] = wkb[range].try_into().unwrap_or([0; 8]);
        if little_endian {
            f64::from_le_bytes(b)
        } else {
            f64::from_be_bytes(b)
        }
    };

    Ok(Point::new(coord(5..13), coord(13..21)))
}
