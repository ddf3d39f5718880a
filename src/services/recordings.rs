use crate::http_response::InputError;
use anyhow::{Context, Result};
use log::{debug, info};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

const FAILED_UPLOADS_DIR: &str = "failed-uploads";
const CPTV_EXTENSION: &str = "cptv";
const META_EXTENSION: &str = "txt";

/// Recordings waiting in the thermal recorder output directory
pub struct RecordingService;

impl RecordingService {
    /// Names of all `.cptv` files, including the ones that failed to upload
    pub fn list(cptv_dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for dir in Self::search_dirs(cptv_dir) {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("{dir:?} does not exist");
                    continue;
                }
                Err(e) => return Err(e).context(format!("failed to read {dir:?}")),
            };

            for entry in entries {
                let path = entry.context("failed to read directory entry")?.path();
                if !Self::is_cptv(&path) {
                    continue;
                }
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Resolve a recording name to its file
    pub fn path(cptv_dir: &Path, id: &str) -> Result<PathBuf> {
        Self::find(cptv_dir, id)?.ok_or_else(|| InputError::new("file not found").into())
    }

    /// Delete a recording together with its metadata file
    ///
    /// # Returns
    /// The message reported to the client, an unknown recording is not an error
    pub fn delete(cptv_dir: &Path, id: &str) -> Result<&'static str> {
        let Some(path) = Self::find(cptv_dir, id)? else {
            info!("recording {id} not found");
            return Ok("cptv file not found");
        };

        let meta = path.with_extension(META_EXTENSION);
        match fs::remove_file(&meta) {
            Ok(()) => debug!("deleted {meta:?}"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(format!("failed to delete {meta:?}")),
        }

        fs::remove_file(&path).context(format!("failed to delete {path:?}"))?;
        info!("deleted recording {id}");

        Ok("cptv file deleted")
    }

    pub fn is_cptv(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == CPTV_EXTENSION)
    }

    fn find(cptv_dir: &Path, id: &str) -> Result<Option<PathBuf>> {
        Self::validate_id(id)?;

        Ok(Self::search_dirs(cptv_dir)
            .into_iter()
            .map(|dir| dir.join(id))
            .find(|path| path.is_file()))
    }

    fn search_dirs(cptv_dir: &Path) -> [PathBuf; 2] {
        [cptv_dir.to_path_buf(), cptv_dir.join(FAILED_UPLOADS_DIR)]
    }

    fn validate_id(id: &str) -> Result<()> {
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(InputError::new("file not found").into());
        }
        Ok(())
    }
}
