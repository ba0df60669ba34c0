use std::path::PathBuf;

/// Returns a [PathBuf] to the directory where stevedore's configuration should live.
///
/// When compiled for testing, this returns `CARGO_MANIFEST_DIR` plus `resources/etc/stevedore`.
/// Otherwise, it returns `/etc/stevedore`.
pub fn config_dir() -> PathBuf {
    // Omit the leading slash so that PathBuf::push appends instead of replacing.
    const CONFIG_DIR: &str = "etc/stevedore";

    let mut path = PathBuf::new();

    #[cfg(test)]
    {
        path.push(env!("CARGO_MANIFEST_DIR"));
        path.push("resources");
    }

    path.push(CONFIG_DIR);
    path
}

/// Returns the path to the profiles file within the configuration directory.
pub fn profiles_path() -> PathBuf {
    let mut path = config_dir();
    path.push("profiles.yaml");
    path
}

/// Returns the path to the directory holding configuration templates.
pub fn template_dir() -> PathBuf {
    let mut path = config_dir();
    path.push("templates");
    path
}

/// Returns the path to the file holding the web frontend's session secret.
pub fn secret_path() -> PathBuf {
    let mut path = config_dir();
    path.push("session-secret");
    path
}
