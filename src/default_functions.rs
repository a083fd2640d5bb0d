use directories::ProjectDirs;
use std::path::PathBuf;
use tracing::debug;

pub(crate) fn default_functions_path() -> Option<PathBuf> {
    let proj = ProjectDirs::from("io", "streamsheets", "streamsheets")?;
    let mut path = proj.config_dir().to_path_buf();
    path.push("default.rhai");
    Some(path)
}

/// Load `default.rhai` from the config dir before any `-f` files.
pub(crate) fn prepend_default_functions_if_present(
    functions: &mut Vec<PathBuf>,
    no_default_functions: bool,
) {
    if no_default_functions {
        return;
    }
    let Some(path) = default_functions_path() else {
        return;
    };
    if path.is_file() {
        functions.insert(0, path);
    } else {
        debug!(path = %path.display(), "no default functions file");
    }
}
