//! Module image sources.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::ImageSourceError;

/// Where the supervisor reads the module image from before each run.
pub trait ImageSource: Send {
    /// Read the whole image into memory.
    fn read(&self) -> Result<Vec<u8>, ImageSourceError>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// Image stored as a file on a mounted filesystem.
#[derive(Debug, Clone)]
pub struct FileImageSource {
    path: PathBuf,
    max_bytes: usize,
}

impl FileImageSource {
    /// Read `path`, refusing files larger than `max_bytes`
    pub fn new(path: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
        }
    }

    /// Image path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageSource for FileImageSource {
    fn read(&self) -> Result<Vec<u8>, ImageSourceError> {
        let read_error = |source: io::Error| {
            if source.kind() == io::ErrorKind::NotFound {
                ImageSourceError::NotFound(self.path.clone())
            } else {
                ImageSourceError::Read {
                    path: self.path.clone(),
                    source,
                }
            }
        };

        let size = std::fs::metadata(&self.path).map_err(read_error)?.len();
        if size > self.max_bytes as u64 {
            return Err(ImageSourceError::TooLarge {
                path: self.path.clone(),
                size,
                max: self.max_bytes,
            });
        }

        let bytes = std::fs::read(&self.path).map_err(read_error)?;
        if bytes.is_empty() {
            return Err(ImageSourceError::Empty);
        }
        Ok(bytes)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Image already in memory.
#[derive(Clone)]
pub struct MemoryImageSource {
    name: String,
    bytes: Vec<u8>,
}

impl MemoryImageSource {
    /// Serve `bytes` on every read
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

impl fmt::Debug for MemoryImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryImageSource")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ImageSource for MemoryImageSource {
    fn read(&self) -> Result<Vec<u8>, ImageSourceError> {
        if self.bytes.is_empty() {
            return Err(ImageSourceError::Empty);
        }
        Ok(self.bytes.clone())
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }
}
