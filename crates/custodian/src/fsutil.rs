use rand::Rng as _;
use std::{
    fs::{self, OpenOptions},
    io::{self, Write as _},
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};

pub const MODE_DIR_PRIVATE: u32 = 0o700;
pub const MODE_FILE_PRIVATE: u32 = 0o600;

fn refuse_symlink(p: &Path) -> io::Result<()> {
    match fs::symlink_metadata(p) {
        Ok(md) if md.file_type().is_symlink() => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to follow symlink: {}", p.display()),
        )),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create `dir` if missing and clamp its permissions to owner-only.
pub fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    refuse_symlink(dir)?;
    if dir.exists() {
        if !fs::metadata(dir)?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("expected directory at {}", dir.display()),
            ));
        }
    } else {
        fs::create_dir_all(dir)?;
    }

    #[cfg(unix)]
    {
        let mode = fs::metadata(dir)?.permissions().mode();
        if (mode & 0o077) != 0 {
            fs::set_permissions(dir, fs::Permissions::from_mode(MODE_DIR_PRIVATE))?;
        }
    }

    Ok(())
}

fn sibling_tmp(path: &Path) -> io::Result<PathBuf> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("missing parent for {}", path.display()),
        )
    })?;
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("value");
    let mut suffix = [0_u8; 8];
    rand::rng().fill_bytes(&mut suffix);
    Ok(parent.join(format!(".{base}.tmp.{}", hex::encode(suffix))))
}

/// Write `bytes` to `path` so readers see either the old or the new contents, never a mix.
///
/// The value lands in a fresh owner-only temp file, is fsynced, then renamed over `path`.
pub fn write_private_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    refuse_symlink(path)?;

    let tmp = sibling_tmp(path)?;
    let mut opts = OpenOptions::new();
    opts.create_new(true).write(true);
    #[cfg(unix)]
    {
        opts.mode(MODE_FILE_PRIVATE);
    }
    let mut f = opts.open(&tmp)?;
    let written = f
        .write_all(bytes)
        .and_then(|()| f.flush())
        .and_then(|()| f.sync_all());
    drop(f);
    if let Err(e) = written {
        drop(fs::remove_file(&tmp));
        return Err(e);
    }

    #[cfg(windows)]
    {
        if path.exists() {
            fs::remove_file(path)?;
        }
    }

    fs::rename(&tmp, path).inspect_err(|_e| {
        drop(fs::remove_file(&tmp));
    })
}

/// Read a private file, treating a missing file as `None`.
pub fn read_private(path: &Path) -> io::Result<Option<Vec<u8>>> {
    refuse_symlink(path)?;
    match fs::read(path) {
        Ok(b) => Ok(Some(b)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Context as _;

    #[test]
    fn atomic_write_replaces_contents() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("tempdir")?;
        let p = td.path().join("nested").join("value.bin");
        write_private_atomic(&p, b"one")?;
        write_private_atomic(&p, b"two")?;
        assert_eq!(read_private(&p)?, Some(b"two".to_vec()));

        let leftovers = fs::read_dir(td.path().join("nested"))?
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[test]
    fn missing_file_reads_as_none_and_removes_cleanly() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("tempdir")?;
        let p = td.path().join("absent");
        assert_eq!(read_private(&p)?, None);
        remove_if_exists(&p)?;
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn refuses_to_write_through_symlink() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("tempdir")?;
        let target = td.path().join("target");
        fs::write(&target, b"x")?;
        let link = td.path().join("link");
        std::os::unix::fs::symlink(&target, &link)?;
        assert!(write_private_atomic(&link, b"y").is_err());
        Ok(())
    }
}
