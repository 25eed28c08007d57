use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::Error;
use crate::metadata::MetadataDocument;
use crate::scratch::ScratchRegistry;

/// Writes the side-car metadata document into a fresh scratch file.
///
/// # Returns
/// Path of the written document; it stays registered in `scratch`.
pub fn save_metadata_document(
    scratch: &ScratchRegistry,
    doc: &MetadataDocument,
) -> Result<PathBuf, Error> {
    let path = scratch.create("metadata-", ".txt")?;
    fs::write(&path, doc.encode()).map_err(|source| Error::Scratch {
        path: path.clone(),
        source,
    })?;
    debug!(
        "Wrote metadata document with {} chapters to {:?}",
        doc.chapters.len(),
        path
    );
    Ok(path)
}

/// Moves a verified container from its staging path to its final name.
///
/// Staging files are created next to their destination, so this is a rename
/// within one directory and readers never see a half-written final file.
pub fn publish_output(
    scratch: &ScratchRegistry,
    staged: &Path,
    destination: &Path,
) -> Result<(), Error> {
    fs::rename(staged, destination).map_err(|source| Error::Io {
        path: destination.to_path_buf(),
        source,
    })?;
    scratch.forget(staged);
    debug!("Published {:?}", destination);
    Ok(())
}

/// Creates the output directory if needed.
pub fn prepare_output_dir(dir: &Path) -> Result<(), Error> {
    if dir.exists() && !dir.is_dir() {
        return Err(Error::OutputDir {
            path: dir.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "exists but is not a directory",
            ),
        });
    }
    fs::create_dir_all(dir).map_err(|source| Error::OutputDir {
        path: dir.to_path_buf(),
        source,
    })
}
