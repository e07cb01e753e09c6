//! Filesystem module location for `Require`: resolves `foo::bar` against a
//! list of search roots, accepting either `foo/bar.sk` or `foo/bar/mod.sk`.

use std::fs;
use std::path::PathBuf;

use skein_vm::{LocateError, ModuleLocator};

/// The file extension module sources carry.
pub const MODULE_EXT: &str = "sk";

#[derive(Clone, Copy, Debug, Default)]
pub struct FsLocator;

impl FsLocator {
    pub fn new() -> Self {
        Self
    }
}

fn module_rel_path(module: &str) -> Result<PathBuf, LocateError> {
    let mut rel = PathBuf::new();
    for segment in module.split("::") {
        if segment.is_empty()
            || !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(LocateError {
                message: format!("invalid module name `{module}`"),
            });
        }
        rel.push(segment);
    }
    Ok(rel)
}

impl ModuleLocator for FsLocator {
    fn locate(&mut self, module: &str, search_paths: &[String]) -> Result<String, LocateError> {
        let rel = module_rel_path(module)?;

        for root in search_paths {
            let mut file_path = PathBuf::from(root).join(&rel);
            file_path.set_extension(MODULE_EXT);
            let dir_path = PathBuf::from(root).join(&rel).join(format!("mod.{MODULE_EXT}"));

            let file_exists = file_path.exists();
            let dir_exists = dir_path.exists();
            if file_exists && dir_exists {
                return Err(LocateError {
                    message: format!(
                        "ambiguous module `{module}`: both `{}` and `{}` exist",
                        file_path.display(),
                        dir_path.display()
                    ),
                });
            }
            let path = if file_exists {
                file_path
            } else if dir_exists {
                dir_path
            } else {
                continue;
            };

            return fs::read_to_string(&path).map_err(|e| LocateError {
                message: format!("failed to read `{}`: {e}", path.display()),
            });
        }

        Err(LocateError {
            message: format!("module `{module}` not found in search path"),
        })
    }
}
