// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The manifest a staged batch carries from the ingestion worker to the
//! transfer worker.

use fdist_options::JobMeta;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MANIFEST_NAME: &str = ".fdist_job.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct JobManifest {
    pub host: String,
    pub dir_alias: String,
    pub priority: Option<u8>,
    /// Seconds to keep delivered files in the archive.
    pub archive_secs: Option<u64>,
    /// Files older than this are dropped instead of sent.
    pub age_limit_secs: Option<u64>,
}

impl JobManifest {
    pub fn new(host: &str, dir_alias: &str, meta: &JobMeta) -> JobManifest {
        JobManifest {
            host: host.to_string(),
            dir_alias: dir_alias.to_string(),
            priority: meta.priority,
            archive_secs: meta.archive_time.map(|d| d.as_secs()),
            age_limit_secs: meta.age_limit.map(|d| d.as_secs()),
        }
    }

    pub fn write(&self, batch_dir: &Path) -> std::io::Result<()> {
        let tmp = batch_dir.join(".fdist_job.tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(tmp, batch_dir.join(MANIFEST_NAME))
    }

    /// Read and remove the manifest, leaving only payload files behind.
    pub fn take(batch_dir: &Path) -> std::io::Result<Option<JobManifest>> {
        let path = batch_dir.join(MANIFEST_NAME);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let manifest = serde_json::from_slice(&bytes)?;
        std::fs::remove_file(&path)?;
        Ok(Some(manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let meta = JobMeta {
            priority: Some(5),
            archive_time: Some(std::time::Duration::from_secs(3600)),
            ..JobMeta::default()
        };
        let manifest = JobManifest::new("mirror", "inbound", &meta);
        manifest.write(dir.path()).unwrap();

        let read = JobManifest::take(dir.path()).unwrap().unwrap();
        assert_eq!(read, manifest);
        assert_eq!(read.archive_secs, Some(3600));
        // Taking removes the file.
        assert!(JobManifest::take(dir.path()).unwrap().is_none());
    }
}
