//! Upload and catalog registration workflow used by file creation
//!
//! Grid catalogs cannot create an empty entry directly. A new file is
//! produced by copying a placeholder to a fresh storage URL on the
//! configured storage element, then registering that replica under the
//! catalog name derived from the file's remote path.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tracing::{debug, error};

use crate::config::UploadConfig;
use crate::connector::{Connector, CopyParams};
use crate::error::{GridFsError, Result};
use crate::path::RemotePath;

/// Creates the remote object behind a new file
#[async_trait]
pub trait UploadWorkflow: Send + Sync {
    async fn upload(&self, target: &RemotePath) -> Result<()>;
}

/// Copy-then-register workflow against a file catalog
pub struct CatalogUpload {
    connector: Arc<dyn Connector>,
    config: UploadConfig,
}

impl CatalogUpload {
    pub fn new(connector: Arc<dyn Connector>, config: UploadConfig) -> Self {
        Self { connector, config }
    }

    /// Workflow over `connector`, refused when the backend cannot address
    /// the placeholder, storage or catalog identifiers it copies between
    pub fn for_connector(connector: Arc<dyn Connector>, config: UploadConfig) -> Result<Self> {
        let upload = Self::new(connector, config);
        let required = [
            RemotePath::from(upload.config.empty_file.as_str()),
            upload.storage_url(Local::now()),
            RemotePath::from("lfn:/"),
        ];
        if let Some(url) = required.iter().find(|url| !upload.connector.serves(url)) {
            return Err(GridFsError::Config(format!(
                "backend cannot address {} used by the upload workflow",
                url
            )));
        }
        Ok(upload)
    }

    /// Storage URL of the new replica, unique per second
    fn storage_url(&self, now: DateTime<Local>) -> RemotePath {
        let url = format!(
            "srm://{}/{}/{}",
            self.config.se,
            self.config.vo,
            now.format("%d%m%Y%H%M%S")
        );
        RemotePath::from(url.as_str())
    }

    /// Catalog name for a remote path: scheme and catalog host removed
    fn catalog_name(&self, target: &RemotePath) -> RemotePath {
        let bytes = target.as_bytes();
        let rest = match bytes.windows(3).position(|w| w == b"://") {
            Some(pos) => &bytes[pos + 3..],
            None => bytes,
        };
        let rest = rest
            .strip_prefix(self.config.lfc_host.as_bytes())
            .unwrap_or(rest);

        let mut name = b"lfn:".to_vec();
        name.extend_from_slice(rest);
        RemotePath::from_bytes(&name)
    }
}

#[async_trait]
impl UploadWorkflow for CatalogUpload {
    async fn upload(&self, target: &RemotePath) -> Result<()> {
        let placeholder = RemotePath::from(self.config.empty_file.as_str());
        let surl = self.storage_url(Local::now());
        let lfn = self.catalog_name(target);
        let params = CopyParams {
            replace_existing: true,
            create_parent: true,
        };

        debug!("upload: {} -> {} registered as {}", placeholder, surl, lfn);

        if let Err(e) = self.connector.copy(&placeholder, &surl, params).await {
            error!("copy of {} to {} failed ({}): {}", placeholder, surl, e.code, e.message);
            return Err(GridFsError::Upload(format!("copy to {}: {}", surl, e)));
        }

        if let Err(e) = self.connector.copy(&surl, &lfn, params).await {
            error!("registration of {} as {} failed ({}): {}", surl, lfn, e.code, e.message);
            return Err(GridFsError::Upload(format!("register {}: {}", lfn, e)));
        }

        Ok(())
    }
}
