use std::path::PathBuf;

pub trait AppPaths: Send + Sync {
    fn music_dir(&self) -> PathBuf;
    fn data_dir(&self) -> PathBuf;
}

/// Platform directories from `dirs`.
#[cfg(feature = "desktop")]
pub struct DesktopPaths;

#[cfg(feature = "desktop")]
impl AppPaths for DesktopPaths {
    fn music_dir(&self) -> PathBuf {
        dirs::audio_dir()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn data_dir(&self) -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("trackhaul"))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Paths rooted in one directory. Portable installs and tests use this.
pub struct FixedPaths {
    root: PathBuf,
}

impl FixedPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AppPaths for FixedPaths {
    fn music_dir(&self) -> PathBuf {
        self.root.join("music")
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }
}
