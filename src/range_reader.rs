//! Byte-range access to raster sources
//!
//! Single-pixel sampling only ever touches the header, the tag data, and the
//! one tile or strip containing the requested pixel, so all raster I/O goes
//! through a range interface instead of whole-file reads. The same reader
//! code then works against local files and plain HTTP servers that honor
//! Range headers.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::AnyResult;

/// Trait for reading byte ranges from a raster source.
pub trait RangeReader: Send + Sync {
    /// Read `length` bytes starting at `offset`.
    fn read_range(&self, offset: u64, length: usize) -> AnyResult<Vec<u8>>;

    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Human-readable identifier for this source (logging, errors, cache keys).
    fn identifier(&self) -> &str;
}

/// Range reader over a local file.
///
/// The file handle is kept open for the lifetime of the reader; each read
/// seeks to the requested offset. Access is serialized behind a mutex so the
/// reader stays `Sync` even though the underlying cursor is stateful.
pub struct LocalRangeReader {
    file: Mutex<File>,
    identifier: String,
    size: u64,
}

impl LocalRangeReader {
    pub fn new(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            identifier: path.to_string_lossy().into_owned(),
            size,
        })
    }
}

impl RangeReader for LocalRangeReader {
    fn read_range(&self, offset: u64, length: usize) -> AnyResult<Vec<u8>> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; length];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// Range reader over HTTP(S) using Range requests.
pub struct HttpRangeReader {
    url: String,
    size: u64,
    client: reqwest::blocking::Client,
}

impl HttpRangeReader {
    pub fn new(url: &str) -> AnyResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        // File size from a HEAD request; servers without content-length
        // report 0 and the IFD size clamp handles the rest.
        let response = client.head(url).send()?;
        let size = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            url: url.to_string(),
            size,
            client,
        })
    }
}

impl RangeReader for HttpRangeReader {
    fn read_range(&self, offset: u64, length: usize) -> AnyResult<Vec<u8>> {
        let range = format!("bytes={}-{}", offset, offset + length as u64 - 1);
        let response = self.client.get(&self.url).header("Range", range).send()?;

        if !response.status().is_success() {
            return Err(format!("HTTP range request failed: {}", response.status()).into());
        }

        Ok(response.bytes()?.to_vec())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.url
    }
}

/// In-memory range reader, used by tests that assemble raster bytes directly.
pub struct MemoryRangeReader {
    data: Arc<Vec<u8>>,
    identifier: String,
}

impl MemoryRangeReader {
    #[must_use]
    pub fn new(data: Vec<u8>, identifier: impl Into<String>) -> Self {
        Self {
            data: Arc::new(data),
            identifier: identifier.into(),
        }
    }
}

impl RangeReader for MemoryRangeReader {
    fn read_range(&self, offset: u64, length: usize) -> AnyResult<Vec<u8>> {
        let start = offset as usize;
        let end = start
            .checked_add(length)
            .ok_or("Range overflows source size")?;
        if end > self.data.len() {
            return Err(format!(
                "Range {}..{} out of bounds for {} byte source",
                start,
                end,
                self.data.len()
            )
            .into());
        }
        Ok(self.data[start..end].to_vec())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// Create a range reader from a path or URL.
pub fn create_range_reader(source: &str) -> AnyResult<Arc<dyn RangeReader>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        Ok(Arc::new(HttpRangeReader::new(source)?))
    } else {
        Ok(Arc::new(LocalRangeReader::new(source)?))
    }
}
