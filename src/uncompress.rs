//! Archive expansion between download and partitioning.
//!
//! A downloaded `.zip`, `.tar`, `.tar.gz` or `.tgz` is extracted next to
//! itself into `<name>-uncompressed/` and replaced by one child unit per
//! extracted file. Anything else passes through unchanged.
//!
//! Child identifiers are derived from the parent identifier and the entry
//! path, so re-extracting the same archive yields the same children.

use flate2::read::GzDecoder;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{IngestError, Result};
use crate::models::{DownloadResponse, FileData, SourceIdentifiers};

const ZIP_EXTENSIONS: &[&str] = &[".zip"];
const TAR_GZ_EXTENSIONS: &[&str] = &[".tar.gz", ".tgz"];
const TAR_EXTENSIONS: &[&str] = &[".tar"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

fn archive_kind(path: &Path) -> Option<(ArchiveKind, usize)> {
    let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
    let groups = [
        (ArchiveKind::Zip, ZIP_EXTENSIONS),
        (ArchiveKind::TarGz, TAR_GZ_EXTENSIONS),
        (ArchiveKind::Tar, TAR_EXTENSIONS),
    ];
    groups.iter().find_map(|(kind, exts)| {
        exts.iter()
            .find(|ext| name.ends_with(*ext) && name.len() > ext.len())
            .map(|ext| (*kind, ext.len()))
    })
}

pub fn is_archive(path: &Path) -> bool {
    archive_kind(path).is_some()
}

/// `<dir>/<name without archive extension>-uncompressed`
pub fn extraction_dir(path: &Path) -> Option<PathBuf> {
    let (_, ext_len) = archive_kind(path)?;
    let name = path.file_name()?.to_string_lossy();
    let stem = &name[..name.len() - ext_len];
    Some(path.with_file_name(format!("{}-uncompressed", stem)))
}

/// Expand `download` when it is an archive.
///
/// Returns the download itself for non-archives, and one response per
/// extracted file (sorted by entry path) otherwise.
pub fn uncompress(download: &DownloadResponse) -> Result<Vec<DownloadResponse>> {
    let Some((kind, _)) = archive_kind(&download.path) else {
        return Ok(vec![download.clone()]);
    };
    let Some(target) = extraction_dir(&download.path) else {
        return Ok(vec![download.clone()]);
    };

    if target.exists() {
        std::fs::remove_dir_all(&target)?;
    }
    std::fs::create_dir_all(&target)?;

    tracing::info!(
        archive = %download.path.display(),
        target = %target.display(),
        "extracting archive"
    );
    match kind {
        ArchiveKind::Zip => extract_zip(&download.path, &target)?,
        ArchiveKind::Tar => extract_tar(File::open(&download.path)?, &target)?,
        ArchiveKind::TarGz => extract_tar(GzDecoder::new(File::open(&download.path)?), &target)?,
    }

    let mut files: Vec<PathBuf> = WalkDir::new(&target)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();

    files
        .into_iter()
        .map(|path| {
            let relative = path
                .strip_prefix(&target)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            let child = child_file_data(&download.file_data, &path, &relative)?;
            Ok(DownloadResponse::fetched(child, path))
        })
        .collect()
}

fn extract_zip(archive: &Path, target: &Path) -> Result<()> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)
        .map_err(|e| IngestError::Value(format!("invalid zip {}: {}", archive.display(), e)))?;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| IngestError::Value(format!("invalid zip entry {}: {}", i, e)))?;
        if entry.is_dir() {
            continue;
        }
        let relative = entry.enclosed_name().map(|p| p.to_path_buf()).ok_or_else(|| {
            IngestError::Value(format!(
                "zip entry '{}' escapes the extraction directory",
                entry.name()
            ))
        })?;
        let out = target.join(relative);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&out)?;
        std::io::copy(&mut entry, &mut file)?;
    }
    Ok(())
}

fn extract_tar<R: std::io::Read>(reader: R, target: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| IngestError::Value(format!("invalid tar archive: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| IngestError::Value(format!("invalid tar entry: {}", e)))?;
        let name = entry.path()?.to_string_lossy().to_string();
        if !entry.unpack_in(target)? {
            return Err(IngestError::Value(format!(
                "tar entry '{}' escapes the extraction directory",
                name
            )));
        }
    }
    Ok(())
}

fn child_file_data(parent: &FileData, path: &Path, relative: &str) -> Result<FileData> {
    let mut hasher = Sha256::new();
    hasher.update(parent.identifier.as_bytes());
    hasher.update(relative.as_bytes());
    let identifier = hex::encode(hasher.finalize());

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut metadata = parent.metadata.clone();
    metadata.filesize_bytes = std::fs::metadata(path).ok().map(|m| m.len());

    let mut child = FileData::new(identifier, parent.connector_type.clone())?
        .with_source_identifiers(
            SourceIdentifiers::new(filename, path.to_string_lossy()).with_rel_path(relative),
        )
        .with_metadata(metadata);
    child.additional_metadata = parent.additional_metadata.clone();
    child
        .additional_metadata
        .insert("parent_identifier".into(), json!(parent.identifier));
    child.reprocess = parent.reprocess;
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn parent(path: &Path) -> DownloadResponse {
        let fd = FileData::new("bundle", "local").unwrap();
        DownloadResponse::fetched(fd, path.to_path_buf())
    }

    #[test]
    fn extraction_dir_strips_archive_extension() {
        assert_eq!(
            extraction_dir(Path::new("/dl/local/a.tar.gz")),
            Some(PathBuf::from("/dl/local/a-uncompressed"))
        );
        assert_eq!(
            extraction_dir(Path::new("/dl/x.ZIP")),
            Some(PathBuf::from("/dl/x-uncompressed"))
        );
        assert!(!is_archive(Path::new("/dl/notes.txt")));
        assert!(!is_archive(Path::new("/dl/.zip")));
    }

    #[test]
    fn plain_files_pass_through() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, "x").unwrap();
        let download = parent(&path);
        assert_eq!(uncompress(&download).unwrap(), vec![download]);
    }

    #[test]
    fn zip_entries_become_children() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bundle.zip");
        {
            let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("b.txt", options).unwrap();
            zip.write_all(b"bee").unwrap();
            zip.start_file("dir/a.txt", options).unwrap();
            zip.write_all(b"ay").unwrap();
            zip.finish().unwrap();
        }

        let children = uncompress(&parent(&path)).unwrap();
        assert_eq!(children.len(), 2);
        let rels: Vec<&str> = children
            .iter()
            .map(|c| c.file_data.source_identifiers.as_ref().unwrap().relative_path())
            .collect();
        assert_eq!(rels, vec!["b.txt", "dir/a.txt"]);
        assert_eq!(std::fs::read_to_string(&children[1].path).unwrap(), "ay");
        assert_eq!(
            children[0].file_data.additional_metadata["parent_identifier"],
            "bundle"
        );
        assert!(children[0].path.starts_with(tmp.path().join("bundle-uncompressed")));

        let again = uncompress(&parent(&path)).unwrap();
        assert_eq!(children[0].file_data.identifier, again[0].file_data.identifier);
    }

    #[test]
    fn tar_gz_entries_become_children() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bundle.tgz");
        {
            let gz = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
            let mut builder = tar::Builder::new(gz);
            let data = b"hello";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "docs/hello.txt", &data[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let children = uncompress(&parent(&path)).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(std::fs::read_to_string(&children[0].path).unwrap(), "hello");
        assert_eq!(children[0].file_data.metadata.filesize_bytes, Some(5));
    }

    #[test]
    fn corrupt_archive_is_a_value_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.zip");
        std::fs::write(&path, b"not a zip").unwrap();
        assert!(matches!(
            uncompress(&parent(&path)).unwrap_err(),
            IngestError::Value(_)
        ));
    }
}
