//! Atomic file I/O rooted at `repo_root`.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Stat {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// Filesystem-backed storage rooted at `repo_root`. Every method joins its
/// `rel` argument beneath the root and rejects traversal outside it.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve `rel` beneath the root, rejecting absolute paths and `..`
    /// segments that would escape it.
    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let rel_path = Path::new(rel);
        let mut out = self.root.clone();
        let mut depth = 0i32;
        for component in rel_path.components() {
            match component {
                Component::Normal(part) => {
                    out.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(Error::InvalidPath(rel.to_string()));
                    }
                    out.pop();
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::InvalidPath(rel.to_string()));
                }
            }
        }
        Ok(out)
    }

    pub fn stat(&self, rel: &str) -> Result<Stat> {
        let path = self.resolve(rel)?;
        let meta = std::fs::metadata(&path).map_err(|e| map_io(e, rel))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Stat {
            name,
            size: meta.len(),
            is_dir: meta.is_dir(),
        })
    }

    pub fn mkdir(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        std::fs::create_dir_all(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    /// Write `data` atomically via a sibling temp file plus rename. Returns bytes written.
    pub fn save(&self, rel: &str, data: &[u8]) -> Result<u64> {
        let path = self.resolve(rel)?;
        let dir = path
            .parent()
            .ok_or_else(|| Error::InvalidPath(rel.to_string()))?;
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(
                "{}-tmp-",
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ))
            .tempfile_in(dir)?;

        use std::io::Write;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;

        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        Ok(data.len() as u64)
    }

    /// Enumerate `rel`; directory entries recurse exactly one level deeper
    /// when `recurse` is true.
    pub fn list(&self, rel: &str, recurse: bool) -> Result<Vec<FileInfo>> {
        let path = self.resolve(rel)?;
        self.list_at(&path, recurse, true).map_err(|e| map_io(e, rel))
    }

    fn list_at(&self, dir: &Path, recurse: bool, allow_recurse: bool) -> std::io::Result<Vec<FileInfo>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.is_empty() {
                continue;
            }
            if file_type.is_dir() {
                if recurse && allow_recurse {
                    out.extend(self.list_at(&entry.path(), recurse, false)?);
                }
                continue;
            }
            let size = entry.metadata()?.len();
            out.push(FileInfo { name, size });
        }
        Ok(out)
    }

    /// Read `length` bytes starting at `offset`; `length == 0` means "to
    /// EOF". A short read is an error.
    pub fn load(&self, rel: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let path = self.resolve(rel)?;
        let mut file = std::fs::File::open(&path).map_err(|e| map_io(e, rel))?;
        file.seek(SeekFrom::Start(offset))?;

        if length == 0 {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            return Ok(buf);
        }

        let mut buf = vec![0u8; length as usize];
        let mut read_so_far = 0usize;
        loop {
            let n = file.read(&mut buf[read_so_far..])?;
            if n == 0 {
                break;
            }
            read_so_far += n;
            if read_so_far == buf.len() {
                break;
            }
        }
        if read_so_far < buf.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read on {rel}: got {read_so_far} of {length} bytes"),
            )));
        }
        Ok(buf)
    }

    /// Remove a single file. Directory removal is not supported.
    pub fn remove(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        std::fs::remove_file(&path).map_err(|e| map_io(e, rel))
    }
}

fn map_io(e: std::io::Error, rel: &str) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(rel.to_string())
    } else {
        Error::Io(e)
    }
}
