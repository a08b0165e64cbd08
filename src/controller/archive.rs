//! # Archives
//!
//! gzip-compressed tar archives exchanged with the ops runner through the build
//! service: manifest trees come in, rendered manifests go out.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Read;
use std::path::Path;
use tar::{Archive, Builder, Header};

/// Pack a single in-memory file into a tar.gz
pub fn create_tar_gz(file_name: &str, contents: &[u8]) -> Result<Vec<u8>> {
    let mut header = Header::new_gnu();
    header
        .set_path(file_name)
        .with_context(|| format!("Invalid archive entry name '{file_name}'"))?;
    header.set_size(contents.len() as u64);
    header.set_mode(0o666);
    header.set_cksum();

    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    builder
        .append(&header, contents)
        .context("Failed to append archive entry")?;
    let encoder = builder.into_inner().context("Failed to finish tar stream")?;
    encoder.finish().context("Failed to finish gzip stream")
}

/// Pack the contents of `dir` (not the directory itself) into a tar.gz
pub fn pack_directory(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    builder
        .append_dir_all(".", dir)
        .with_context(|| format!("Failed to archive {}", dir.display()))?;
    let encoder = builder.into_inner().context("Failed to finish tar stream")?;
    encoder.finish().context("Failed to finish gzip stream")
}

/// Unpack a tar.gz into `dest`. Entries escaping `dest` are skipped.
pub fn unpack_tar_gz(archive: &[u8], dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    Archive::new(GzDecoder::new(archive))
        .unpack(dest)
        .with_context(|| format!("Failed to unpack archive into {}", dest.display()))
}

/// Read one file out of a tar.gz, if present
pub fn read_entry(archive: &[u8], file_name: &str) -> Result<Option<Vec<u8>>> {
    let mut archive = Archive::new(GzDecoder::new(archive));
    for entry in archive.entries().context("Failed to read archive")? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path == Path::new(file_name) || path.strip_prefix(".").is_ok_and(|p| p == Path::new(file_name)) {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(Some(contents));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_file_archive() {
        let archive = create_tar_gz("manifest.yaml", b"kind: ConfigMap\n").unwrap();
        assert_eq!(
            read_entry(&archive, "manifest.yaml").unwrap().as_deref(),
            Some(b"kind: ConfigMap\n".as_slice())
        );
        assert!(read_entry(&archive, "other.yaml").unwrap().is_none());

        let mut entries = Archive::new(GzDecoder::new(archive.as_slice()));
        let entry = entries.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().mode().unwrap(), 0o666);
    }

    #[test]
    fn test_directory_unpacks_in_place() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("manifests/docker-desktop")).unwrap();
        std::fs::write(
            src.path().join("manifests/docker-desktop/kustomization.yaml"),
            "resources: []\n",
        )
        .unwrap();

        let archive = pack_directory(src.path()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        unpack_tar_gz(&archive, &dest.path().join("config")).unwrap();
        assert_eq!(
            std::fs::read_to_string(
                dest.path().join("config/manifests/docker-desktop/kustomization.yaml")
            )
            .unwrap(),
            "resources: []\n"
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        let dest = tempfile::tempdir().unwrap();
        assert!(unpack_tar_gz(b"not a tarball", dest.path()).is_err());
    }
}
