use std::fs;
use std::io::Write;
use std::path::Path;

use crate::core::error::{Error, Result};

/// Recursively ensure a directory exists.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| Error::system(format!("create directory {}", path.display()), e))
}

/// Replace `path` atomically: write the contents to a sibling `<name>.new`
/// file, then rename it over the target. A crash mid-write leaves either
/// the previous complete file or the new complete file, never a partial
/// one. On error the temporary is removed and the original is untouched.
pub fn atomic_replace(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".new");
    let tmp = Path::new(&tmp);

    let result = (|| {
        let mut file = fs::File::create(tmp)
            .map_err(|e| Error::system(format!("create {}", tmp.display()), e))?;
        file.write_all(contents)
            .map_err(|e| Error::system(format!("write {}", tmp.display()), e))?;
        file.sync_all()
            .map_err(|e| Error::system(format!("sync {}", tmp.display()), e))?;
        fs::rename(tmp, path).map_err(|e| {
            Error::system(
                format!("rename {} to {}", tmp.display(), path.display()),
                e,
            )
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_replace_writes_and_cleans_temporary() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");

        atomic_replace(&target, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"{\"a\":1}");
        assert!(!dir.path().join("state.json.new").exists());

        atomic_replace(&target, b"{\"a\":2}").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"{\"a\":2}");
    }

    #[test]
    fn atomic_replace_failure_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("state.json");

        // Parent directory does not exist, so the temporary cannot be
        // created and nothing is left behind.
        assert!(atomic_replace(&target, b"x").is_err());
        assert!(!target.exists());
    }
}
