use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Test assembly path cannot be empty.")]
    EmptyAssemblyPath,
    #[error("Test assembly path {0:?} has no parent folder to use as the base path")]
    NoBasePath(PathBuf),
    #[error("Test assembly path {assembly:?} must be contained in base path {base:?}")]
    OutsideBasePath { assembly: PathBuf, base: PathBuf },
    #[error("Could not resolve the current directory: {0}")]
    CurrentDir(String),
}

/// The folder shipped to the server, and the test binary relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPaths {
    pub base_path: PathBuf,
    /// Always `./`-prefixed with `/` separators.
    pub test_assembly_path: String,
}

/// Resolves the invoker's paths against the process working directory.
pub fn validate_paths(
    test_assembly_path: &Path,
    base_path: Option<&Path>,
) -> Result<ValidatedPaths, PathError> {
    let cwd = std::env::current_dir().map_err(|e| PathError::CurrentDir(e.to_string()))?;
    validate_paths_in(&cwd, test_assembly_path, base_path)
}

/// Like [`validate_paths`], with relative paths resolved against `cwd`.
///
/// A relative assembly path is taken relative to the base path when one is
/// given, otherwise relative to `cwd`, in which case its parent folder becomes
/// the base path.
pub fn validate_paths_in(
    cwd: &Path,
    test_assembly_path: &Path,
    base_path: Option<&Path>,
) -> Result<ValidatedPaths, PathError> {
    if test_assembly_path.as_os_str().is_empty() {
        return Err(PathError::EmptyAssemblyPath);
    }

    let (base, assembly) = match base_path {
        Some(base) => {
            let base = normalize(&cwd.join(base));
            let assembly = normalize(&base.join(test_assembly_path));
            (base, assembly)
        }
        None => {
            let assembly = normalize(&cwd.join(test_assembly_path));
            let base = assembly
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| PathError::NoBasePath(assembly.clone()))?;
            (base, assembly)
        }
    };

    let relative = match assembly.strip_prefix(&base) {
        Ok(relative) if !relative.as_os_str().is_empty() => relative,
        _ => return Err(PathError::OutsideBasePath { assembly, base }),
    };

    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    Ok(ValidatedPaths {
        test_assembly_path: format!("./{}", parts.join("/")),
        base_path: base,
    })
}

/// Lexically removes `.` and `..` components. Never touches the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
