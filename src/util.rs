use std::{
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
};

/// Writes `bytes` to a sibling temp file and renames it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = tmp_path_next_to(path);
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        let _ = file.sync_all();
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

pub fn tmp_path_next_to(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("tmp"));
    parent.join(format!(
        ".{}.tmp.{}",
        file.to_string_lossy(),
        std::process::id()
    ))
}

#[cfg(unix)]
pub fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn chmod(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
