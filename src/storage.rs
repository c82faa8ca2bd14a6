use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
    pub duckdb_path: PathBuf,
    pub facility_index_dir: PathBuf,
    pub meta_path: PathBuf,
}

impl StoragePaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir: PathBuf = data_dir.into();
        let duckdb_path = data_dir.join("trials.duckdb");
        let facility_index_dir = data_dir.join("index").join("facilities");
        let meta_path = data_dir.join("meta.json");

        Self {
            data_dir,
            duckdb_path,
            facility_index_dir,
            meta_path,
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.facility_index_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

pub fn file_present_nonempty(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(m) => m.is_file() && m.len() > 0,
        Err(_) => false,
    }
}
