// pgstash/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Builder;
use walkdir::WalkDir;

/// Packages a directory into a single archive file.
pub trait Archiver: Send + Sync {
    /// Archives the full contents of `source_dir` into `archive_path` and
    /// returns the path of the written archive.
    fn archive(&self, source_dir: &Path, archive_path: &Path) -> Result<PathBuf>;
}

/// GZipped TAR archives, entries relative to the source directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarGzArchiver;

impl Archiver for TarGzArchiver {
    fn archive(&self, source_dir: &Path, archive_path: &Path) -> Result<PathBuf> {
        create_tar_gz_archive(source_dir, archive_path)
    }
}

/// Creates a GZipped TAR archive from a source directory.
///
/// # Arguments
/// * `source_dir` - The directory whose contents will be archived.
/// * `archive_dest_path` - The full path where the `.tar.gz` archive will be created.
///   Must not lie inside `source_dir`.
pub fn create_tar_gz_archive(source_dir: &Path, archive_dest_path: &Path) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        ));
    }
    if archive_dest_path.starts_with(source_dir) {
        return Err(anyhow::anyhow!(
            "Archive {} cannot be written inside the directory being archived",
            archive_dest_path.display()
        ));
    }
    if let Some(parent) = archive_dest_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "Failed to create parent directory for archive: {}",
                parent.display()
            )
        })?;
    }

    tracing::debug!(
        source = %source_dir.display(),
        archive = %archive_dest_path.display(),
        "Creating tar.gz archive"
    );

    let archive_file = File::create(archive_dest_path).with_context(|| {
        format!("Failed to create archive file: {}", archive_dest_path.display())
    })?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry
            .with_context(|| format!("Failed to walk directory: {}", source_dir.display()))?;
        let path = entry.path();
        let name = path.strip_prefix(source_dir).with_context(|| {
            format!(
                "Failed to strip prefix {} from {}",
                source_dir.display(),
                path.display()
            )
        })?;

        if name.as_os_str().is_empty() {
            continue;
        }

        if entry.file_type().is_dir() {
            tar_builder
                .append_dir(name, path)
                .with_context(|| format!("Failed to append directory {} to archive", path.display()))?;
        } else if entry.file_type().is_file() {
            tar_builder.append_path_with_name(path, name).with_context(|| {
                format!(
                    "Failed to append file {} as {} to archive",
                    path.display(),
                    name.display()
                )
            })?;
        }
    }

    let encoder = tar_builder.into_inner().with_context(|| {
        format!(
            "Failed to finish tar stream for archive: {}",
            archive_dest_path.display()
        )
    })?;
    encoder.finish().with_context(|| {
        format!(
            "Failed to finish Gzip encoding for archive: {}",
            archive_dest_path.display()
        )
    })?;

    tracing::info!(archive = %archive_dest_path.display(), "Archive created");
    Ok(archive_dest_path.to_path_buf())
}
