//! Startup check for the collaborator programs

use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::BinaryConfig;
use crate::error::{Result, RotatorError};

/// Resolve every collaborator program, failing on the first one missing
pub fn check(binaries: &BinaryConfig) -> Result<Vec<PathBuf>> {
    let path = std::env::var_os("PATH");
    [&binaries.haproxy, &binaries.privoxy, &binaries.tor]
        .into_iter()
        .map(|name| -> Result<PathBuf> {
            let found = find_program(name, path.as_deref())
                .ok_or_else(|| RotatorError::MissingDependency(name.clone()))?;
            debug!(name = %name, path = %found.display(), "found required program");
            Ok(found)
        })
        .collect()
}

/// Look `name` up like a shell would: names containing a slash are taken as
/// paths, anything else is searched in each `search_path` entry
pub fn find_program(name: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains('/') {
        let candidate = PathBuf::from(name);
        return is_executable(&candidate).then_some(candidate);
    }

    std::env::split_paths(search_path?)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
