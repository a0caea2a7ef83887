use directories::ProjectDirs;
use eyre::{Context as _, ContextCompat as _};
use serde::Serialize;
use std::path::PathBuf;

const LOG_FILE_NAME: &str = "custodian.log.jsonl";

#[derive(Debug, Clone, Serialize)]
pub struct CustodianPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
}

impl CustodianPaths {
    pub fn discover() -> eyre::Result<Self> {
        // Both must be set; a lone override is ignored so config and data never split
        // across a test dir and the real home.
        if let (Ok(data_dir), Ok(config_dir)) = (
            std::env::var("CUSTODIAN_DATA_DIR"),
            std::env::var("CUSTODIAN_CONFIG_DIR"),
        ) {
            return Ok(Self::at(PathBuf::from(config_dir), PathBuf::from(data_dir)));
        }

        let proj =
            ProjectDirs::from("", "", "custodian").context("failed to resolve project dirs")?;
        Ok(Self::at(
            proj.config_dir().to_path_buf(),
            proj.data_dir().to_path_buf(),
        ))
    }

    pub fn at(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        let log_file = data_dir.join(LOG_FILE_NAME);
        Self {
            config_dir,
            data_dir,
            log_file,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// One sealed file per key lives here.
    pub fn secure_store_dir(&self) -> PathBuf {
        self.data_dir.join("secure")
    }

    pub fn machine_secret_path(&self) -> PathBuf {
        self.data_dir.join("machine_secret.bin")
    }

    pub fn ensure_private_dirs(&self) -> eyre::Result<()> {
        crate::fsutil::ensure_private_dir(&self.config_dir)
            .with_context(|| format!("create {}", self.config_dir.display()))?;
        crate::fsutil::ensure_private_dir(&self.data_dir)
            .with_context(|| format!("create {}", self.data_dir.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_hang_off_the_data_dir() {
        let p = CustodianPaths::at(PathBuf::from("/cfg"), PathBuf::from("/data"));
        assert_eq!(p.log_file, PathBuf::from("/data/custodian.log.jsonl"));
        assert_eq!(p.secure_store_dir(), PathBuf::from("/data/secure"));
        assert_eq!(p.config_path(), PathBuf::from("/cfg/config.toml"));
    }
}
