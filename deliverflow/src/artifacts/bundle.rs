//! Deterministic `tar.gz` bundles of an install prefix.
//!
//! Entries are written in sorted order with zeroed timestamps and fixed
//! ownership so the same prefix always produces the same digest.

use crate::errors::{DeliverError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Component, Path, PathBuf};

/// Metadata about a bundle on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// Location of the archive.
    pub path: PathBuf,
    /// Hex SHA-256 of the archive bytes.
    pub sha256: String,
    /// Archive size in bytes.
    pub size_bytes: u64,
    /// Number of entries (files, directories, links).
    pub entries: usize,
}

#[derive(Debug)]
struct SourceEntry {
    relative: PathBuf,
    absolute: PathBuf,
    kind: EntryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File { executable: bool },
    Symlink,
}

/// Strips the leading `/` (and any `.`) from an absolute in-archive root.
#[must_use]
pub fn archive_root(prefix: &str) -> PathBuf {
    Path::new(prefix)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Archives `source` into `output`, storing entries under `root`.
///
/// `root` is the in-archive location of `source`, for instance
/// `opt/performance_test` for an install prefix of `/opt/performance_test`,
/// so that extracting the bundle at `/` restores the prefix.
///
/// # Errors
///
/// Returns [`DeliverError::Archive`] if `source` is not a directory, or an
/// IO error if reading or writing fails.
pub fn create_bundle(source: &Path, root: &Path, output: &Path) -> Result<Bundle> {
    if !source.is_dir() {
        return Err(DeliverError::archive(source, "bundle source is not a directory"));
    }

    let mut entries = Vec::new();
    walk(source, Path::new(""), &mut entries)?;
    entries.sort_by(|a, b| a.relative.cmp(&b.relative));

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = BufWriter::new(File::create(output)?);
    let encoder: GzEncoder<BufWriter<File>> = GzBuilder::new().mtime(0).write(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    // The prefix directory itself comes first.
    if !root.as_os_str().is_empty() {
        append_dir(&mut builder, root)?;
    }

    for entry in &entries {
        let name = root.join(&entry.relative);
        match entry.kind {
            EntryKind::Dir => append_dir(&mut builder, &name)?,
            EntryKind::File { executable } => {
                let file = File::open(&entry.absolute)?;
                let size = file.metadata()?.len();
                let mut header = fixed_header(tar::EntryType::Regular, if executable { 0o755 } else { 0o644 });
                header.set_size(size);
                builder.append_data(&mut header, &name, BufReader::new(file))?;
            }
            EntryKind::Symlink => {
                let target = fs::read_link(&entry.absolute)?;
                let mut header = fixed_header(tar::EntryType::Symlink, 0o777);
                header.set_size(0);
                builder.append_link(&mut header, &name, &target)?;
            }
        }
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    io::Write::flush(&mut writer)?;

    let bundle = describe(output, entries.len() + usize::from(!root.as_os_str().is_empty()))?;
    tracing::debug!(
        bundle = %bundle.path.display(),
        sha256 = %bundle.sha256,
        entries = bundle.entries,
        "bundle created"
    );
    Ok(bundle)
}

/// Extracts a bundle beneath `target`, which acts as the filesystem root.
///
/// Entries escaping `target` (absolute paths, `..`) are rejected by the
/// archive reader.
///
/// # Errors
///
/// Returns [`DeliverError::Archive`] if the archive cannot be read.
pub fn extract_bundle(archive: &Path, target: &Path) -> Result<Bundle> {
    tracing::debug!(
        archive = %archive.display(),
        target = %target.display(),
        "extracting bundle"
    );

    fs::create_dir_all(target)?;
    let file = File::open(archive)?;
    let mut reader = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let mut count = 0;
    let entries = reader
        .entries()
        .map_err(|e| DeliverError::archive(archive, e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| DeliverError::archive(archive, e.to_string()))?;
        let unpacked = entry
            .unpack_in(target)
            .map_err(|e| DeliverError::archive(archive, e.to_string()))?;
        if !unpacked {
            return Err(DeliverError::archive(
                archive,
                format!("entry escapes extraction root: {}", entry.path().map(|p| p.display().to_string()).unwrap_or_default()),
            ));
        }
        count += 1;
    }

    describe(archive, count)
}

/// Computes the hex SHA-256 of a file.
///
/// # Errors
///
/// Returns an IO error if the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn describe(path: &Path, entries: usize) -> Result<Bundle> {
    Ok(Bundle {
        path: path.to_path_buf(),
        sha256: sha256_file(path)?,
        size_bytes: fs::metadata(path)?.len(),
        entries,
    })
}

fn fixed_header(kind: tar::EntryType, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn append_dir<W: io::Write>(builder: &mut tar::Builder<W>, name: &Path) -> Result<()> {
    let mut header = fixed_header(tar::EntryType::Directory, 0o755);
    header.set_size(0);
    builder.append_data(&mut header, name, io::empty())?;
    Ok(())
}

fn walk(dir: &Path, relative: &Path, out: &mut Vec<SourceEntry>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let absolute = entry.path();
        let relative = relative.join(entry.file_name());
        let metadata = fs::symlink_metadata(&absolute)?;
        let file_type = metadata.file_type();

        if file_type.is_symlink() {
            out.push(SourceEntry { relative, absolute, kind: EntryKind::Symlink });
        } else if file_type.is_dir() {
            out.push(SourceEntry {
                relative: relative.clone(),
                absolute: absolute.clone(),
                kind: EntryKind::Dir,
            });
            walk(&absolute, &relative, out)?;
        } else {
            out.push(SourceEntry {
                relative,
                absolute,
                kind: EntryKind::File { executable: is_executable(&metadata) },
            });
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn populate(prefix: &Path) {
        fs::create_dir_all(prefix.join("lib/pkg")).unwrap();
        fs::write(prefix.join("LICENSE"), "Apache-2.0\n").unwrap();
        fs::write(prefix.join("lib/pkg/perf_test"), "binary").unwrap();
        fs::write(prefix.join("setup.sh"), "#!/bin/sh\n").unwrap();
    }

    #[test]
    fn test_archive_root_strips_leading_slash() {
        assert_eq!(archive_root("/opt/performance_test"), PathBuf::from("opt/performance_test"));
        assert_eq!(archive_root("opt/x"), PathBuf::from("opt/x"));
    }

    #[test]
    fn test_bundle_extracts_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("install");
        populate(&prefix);

        let archive = dir.path().join("opt.tar.gz");
        let bundle = create_bundle(&prefix, &archive_root("/opt/performance_test"), &archive).unwrap();
        assert_eq!(bundle.sha256.len(), 64);
        assert!(bundle.size_bytes > 0);

        let rootfs = dir.path().join("rootfs");
        let extracted = extract_bundle(&archive, &rootfs).unwrap();
        assert_eq!(extracted.entries, bundle.entries);

        let license = fs::read_to_string(rootfs.join("opt/performance_test/LICENSE")).unwrap();
        assert_eq!(license, "Apache-2.0\n");
        assert!(rootfs.join("opt/performance_test/lib/pkg/perf_test").is_file());
    }

    #[test]
    fn test_bundle_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("install");
        populate(&prefix);
        let root = archive_root("/opt/ws");

        let first = create_bundle(&prefix, &root, &dir.path().join("a.tar.gz")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(prefix.join("setup.sh"), "#!/bin/sh\n").unwrap();
        let second = create_bundle(&prefix, &root, &dir.path().join("b.tar.gz")).unwrap();

        assert_eq!(first.sha256, second.sha256);
    }

    #[test]
    fn test_missing_source_is_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = create_bundle(&dir.path().join("nope"), Path::new("opt"), &dir.path().join("x.tar.gz"))
            .unwrap_err();
        assert!(matches!(err, DeliverError::Archive { .. }));
    }

    #[test]
    fn test_corrupt_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.tar.gz");
        fs::write(&archive, b"not a gzip stream").unwrap();
        assert!(extract_bundle(&archive, &dir.path().join("out")).is_err());
    }
}
