// src/mapped.rs
use crate::http::Status;
use memmap2::Mmap;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// A whole file mapped read-only. Unmapped on drop.
///
/// Empty files carry no mapping and read as an empty slice.
pub struct MappedFile {
    map: Option<Mmap>,
}

impl MappedFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Self { map: None });
        }
        // Served files must not be truncated while mapped.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map: Some(map) })
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile").field("len", &self.len()).finish()
    }
}

/// Resolve a file response: missing is 404, not world-readable is 403,
/// a directory is 400, anything else is mapped.
pub fn map_resource(path: &Path) -> Result<MappedFile, Status> {
    let meta = fs::metadata(path).map_err(|_| Status::NotFound)?;
    if meta.permissions().mode() & libc::S_IROTH == 0 {
        return Err(Status::Forbidden);
    }
    if meta.is_dir() {
        return Err(Status::BadRequest);
    }
    MappedFile::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Status::NotFound,
        io::ErrorKind::PermissionDenied => Status::Forbidden,
        _ => Status::InternalError,
    })
}
