use std::path::{Path, PathBuf};

use crate::{
    error::{Error, Result},
    store::SEGMENTS_DIR,
};

/// Environment variable overriding the data root.
pub const DATA_DIR_ENV: &str = "SEGDEX_DATA_DIR";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The SEGDEX_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/segdex/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("segdex")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Configuration(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_db(&self) -> PathBuf {
        self.root.join("settings.redb")
    }

    /// Data directory of `tenant`, created if needed.
    pub fn tenant_dir(&self, tenant: &str) -> Result<PathBuf> {
        let path = self.tenant_path(tenant)?;
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }

    /// Path of `tenant`'s directory without creating it.
    pub fn tenant_path(&self, tenant: &str) -> Result<PathBuf> {
        validate_tenant(tenant)?;
        Ok(self.root.join(tenant))
    }

    /// Tenants that have a segment directory, sorted by name.
    pub fn tenants(&self) -> Result<Vec<String>> {
        let mut tenants = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && entry.path().join(SEGMENTS_DIR).is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                tenants.push(name.to_string());
            }
        }
        tenants.sort();
        Ok(tenants)
    }
}

fn validate_tenant(tenant: &str) -> Result<()> {
    let ok = !tenant.is_empty()
        && tenant != "."
        && tenant != ".."
        && tenant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(Error::Configuration(format!("invalid tenant name '{tenant}'")))
    }
}
