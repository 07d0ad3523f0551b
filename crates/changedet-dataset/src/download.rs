//! Dataset archive download and verification.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use changedet_core::{Error, RemoteArchive, Result};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

const HASH_CHUNK: usize = 4096;

/// Streams `url` into `path`, showing a progress bar.
///
/// Bytes go to `<path>.part`, which is renamed to `path` only once the body
/// has been read completely; a failed transfer leaves nothing at `path`.
pub fn download_file(url: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    info!("Downloading {} to {}", url, path.display());

    let response = ureq::get(url)
        .call()
        .map_err(|e| Error::Download(format!("failed to download {url}: {e}")))?;
    let total = response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }

    let partial = partial_path(path);
    let mut reader = response.into_body().into_reader();
    let written = stream_to(&mut reader, &partial, &pb, url);
    pb.finish_and_clear();

    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&partial) {
            debug!("Could not remove {}: {}", partial.display(), cleanup);
        }
        return Err(e);
    }
    fs::rename(&partial, path)?;
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

fn stream_to(reader: &mut impl Read, path: &Path, pb: &ProgressBar, url: &str) -> Result<()> {
    let mut file = File::create(path)?;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| Error::Download(format!("failed to read {url}: {e}")))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])?;
        pb.inc(read as u64);
    }
    file.flush()?;
    Ok(())
}

/// Makes sure `path` holds a download of `url` that hashes to `expected`
/// (any content when `expected` is `None`).
///
/// A cached file with the wrong digest is discarded and fetched again. A fresh
/// download with the wrong digest is deleted before [`Error::Integrity`] is
/// returned, so the next call starts from scratch.
pub fn fetch_file(url: &str, path: &Path, expected: Option<&str>) -> Result<()> {
    if path.exists() {
        match expected {
            Some(hash) if !verify_file(path, hash) => {
                warn!("Discarding {}: digest mismatch", path.display());
                fs::remove_file(path)?;
            }
            _ => {
                debug!("Using cached {}", path.display());
                return Ok(());
            }
        }
    }

    download_file(url, path)?;
    if let Some(hash) = expected {
        if let Err(e) = ensure_integrity(path, hash) {
            fs::remove_file(path)?;
            return Err(e);
        }
    }
    Ok(())
}

/// Lowercase hex SHA-256 of a file, read in 4 KiB chunks
pub fn compute_sha256(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_CHUNK];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether `path` exists and hashes to `expected`
pub fn verify_file(path: &Path, expected: &str) -> bool {
    if !path.exists() {
        return false;
    }
    match compute_sha256(path) {
        Ok(actual) => actual.eq_ignore_ascii_case(expected),
        Err(e) => {
            warn!("Could not hash {}: {}", path.display(), e);
            false
        }
    }
}

/// Downloads `url` to `path` and reports whether the result matches `expected`
pub fn download_and_verify(url: &str, path: &Path, expected: &str) -> Result<bool> {
    download_file(url, path)?;
    Ok(verify_file(path, expected))
}

/// Fails with [`Error::Integrity`] unless `path` hashes to `expected`
pub fn ensure_integrity(path: &Path, expected: &str) -> Result<()> {
    let actual = compute_sha256(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Error::Integrity {
            path: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Unpacks a zip archive into `dir`
pub fn extract_zip(archive: &Path, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| Error::Dataset(format!("invalid archive {}: {e}", archive.display())))?;
    zip.extract(dir)
        .map_err(|e| Error::Dataset(format!("failed to extract {}: {e}", archive.display())))?;
    info!("Extracted {} entries into {}", zip.len(), dir.display());
    Ok(())
}

/// Downloads (when missing), verifies and unpacks `source` into `root`,
/// removing the archive afterwards whether or not extraction succeeded
pub fn fetch_and_extract(source: &RemoteArchive, root: &Path, checksum: bool) -> Result<()> {
    let archive = root.join(&source.file_name);
    let expected = checksum.then_some(source.sha256.as_str());
    fetch_file(&source.url, &archive, expected)?;

    let extracted = extract_zip(&archive, root);
    fs::remove_file(&archive)?;
    extracted
}

/// Prepares `output_dir` from `source` unless it already exists.
///
/// The archive is fetched and unpacked into a hidden staging directory next
/// to `output_dir`, which is renamed into place only after extraction
/// succeeds. A failed attempt removes the staging directory.
pub fn prepare_archive(source: &RemoteArchive, output_dir: &Path, checksum: bool) -> Result<()> {
    if output_dir.exists() {
        info!("{} already exists, skipping download", output_dir.display());
        return Ok(());
    }

    let staging = staging_dir(output_dir)?;
    if staging.exists() {
        warn!("Removing leftover {}", staging.display());
        fs::remove_dir_all(&staging)?;
    }

    if let Err(e) = fetch_and_extract(source, &staging, checksum) {
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        return Err(e);
    }
    fs::rename(&staging, output_dir)?;
    info!("Dataset prepared in {}", output_dir.display());
    Ok(())
}

fn staging_dir(output_dir: &Path) -> Result<PathBuf> {
    let name = output_dir.file_name().ok_or_else(|| {
        Error::InvalidArgument(format!(
            "output directory {} has no file name",
            output_dir.display()
        ))
    })?;
    let mut staging = OsString::from(".");
    staging.push(name);
    staging.push(".partial");
    Ok(output_dir.with_file_name(staging))
}
