//! # pdfium-auto
//!
//! Fetches the PDFium shared library the first time `scanbook` needs it, so a
//! fresh install can render pages without a manual download.
//!
//! Resolution order:
//!
//! 1. `PDFIUM_LIB_PATH`, when it names an existing file.
//! 2. `<cache>/scanbook/pdfium-{VERSION}/<lib>`, from an earlier download.
//! 3. A download of the platform archive from
//!    [bblanchon/pdfium-binaries](https://github.com/bblanchon/pdfium-binaries),
//!    streamed to a temporary file and unpacked into the cache.
//!
//! The library is written under a temporary name and renamed into place, so
//! an interrupted download never leaves a truncated library behind.
//!
//! `PDFIUM_AUTO_CACHE_DIR` replaces the platform cache directory.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use pdfium_render::prelude::Pdfium;
use thiserror::Error;
use tracing::{info, warn};

/// The pdfium-binaries release (`chromium/{VERSION}`) to download.
pub const PDFIUM_VERSION: &str = "7690";

const RELEASES: &str = "https://github.com/bblanchon/pdfium-binaries/releases/download";

/// Download progress: `(bytes so far, total if the server sent a length)`.
pub type ProgressFn<'a> = &'a dyn Fn(u64, Option<u64>);

#[derive(Error, Debug)]
pub enum PdfiumAutoError {
    #[error("No PDFium build is published for {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("Cannot prepare the PDFium cache directory: {0}")]
    CacheDir(#[source] std::io::Error),

    #[error("PDFium download failed: {0}")]
    Download(String),

    #[error("Cannot unpack the PDFium archive: {0}")]
    Extract(String),

    #[error("Failed to bind PDFium from '{path}': {reason}")]
    Bind { path: PathBuf, reason: String },
}

/// One published build of pdfium-binaries.
#[derive(Debug, PartialEq, Eq)]
struct Platform {
    os: &'static str,
    arch: &'static str,
    archive: &'static str,
    /// Path of the library inside the archive.
    member: &'static str,
    lib_name: &'static str,
}

const PLATFORMS: &[Platform] = &[
    Platform { os: "macos", arch: "aarch64", archive: "pdfium-mac-arm64.tgz", member: "lib/libpdfium.dylib", lib_name: "libpdfium.dylib" },
    Platform { os: "macos", arch: "x86_64", archive: "pdfium-mac-x64.tgz", member: "lib/libpdfium.dylib", lib_name: "libpdfium.dylib" },
    Platform { os: "linux", arch: "x86_64", archive: "pdfium-linux-x64.tgz", member: "lib/libpdfium.so", lib_name: "libpdfium.so" },
    Platform { os: "linux", arch: "aarch64", archive: "pdfium-linux-arm64.tgz", member: "lib/libpdfium.so", lib_name: "libpdfium.so" },
    Platform { os: "windows", arch: "x86_64", archive: "pdfium-win-x64.tgz", member: "bin/pdfium.dll", lib_name: "pdfium.dll" },
    Platform { os: "windows", arch: "aarch64", archive: "pdfium-win-arm64.tgz", member: "bin/pdfium.dll", lib_name: "pdfium.dll" },
    Platform { os: "windows", arch: "x86", archive: "pdfium-win-x86.tgz", member: "bin/pdfium.dll", lib_name: "pdfium.dll" },
];

fn platform_for(os: &str, arch: &str) -> Result<&'static Platform, PdfiumAutoError> {
    PLATFORMS
        .iter()
        .find(|p| p.os == os && p.arch == arch)
        .ok_or_else(|| PdfiumAutoError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        })
}

fn current_platform() -> Result<&'static Platform, PdfiumAutoError> {
    platform_for(std::env::consts::OS, std::env::consts::ARCH)
}

/// Directory holding the downloaded library for [`PDFIUM_VERSION`].
pub fn pdfium_cache_dir() -> PathBuf {
    let base = match std::env::var_os("PDFIUM_AUTO_CACHE_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::cache_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
            .unwrap_or_else(std::env::temp_dir)
            .join("scanbook"),
    };
    base.join(format!("pdfium-{PDFIUM_VERSION}"))
}

fn env_library() -> Option<PathBuf> {
    std::env::var_os("PDFIUM_LIB_PATH")
        .map(PathBuf::from)
        .filter(|p| p.is_file())
}

/// The library on disk, if one is already available without a download.
pub fn cached_pdfium_path() -> Option<PathBuf> {
    env_library().or_else(|| {
        let platform = current_platform().ok()?;
        Some(pdfium_cache_dir().join(platform.lib_name)).filter(|p| p.is_file())
    })
}

pub fn is_pdfium_cached() -> bool {
    cached_pdfium_path().is_some()
}

static RESOLVED: OnceLock<PathBuf> = OnceLock::new();

/// Path to a usable PDFium library, downloading it on first use.
///
/// Blocking. Async callers should wrap it in `block_in_place` or
/// `spawn_blocking`.
pub fn ensure_pdfium_library(on_progress: Option<ProgressFn<'_>>) -> Result<PathBuf, PdfiumAutoError> {
    if let Some(path) = RESOLVED.get() {
        return Ok(path.clone());
    }
    let path = match cached_pdfium_path() {
        Some(path) => path,
        None => download_library(on_progress)?,
    };
    Ok(RESOLVED.get_or_init(|| path).clone())
}

/// Bind to the library at `path`.
pub fn bind_pdfium_from_path(path: &Path) -> Result<Pdfium, PdfiumAutoError> {
    Pdfium::bind_to_library(path)
        .map(Pdfium::new)
        .map_err(|e| PdfiumAutoError::Bind {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn download_library(on_progress: Option<ProgressFn<'_>>) -> Result<PathBuf, PdfiumAutoError> {
    if let Some(path) = std::env::var_os("PDFIUM_LIB_PATH") {
        warn!(
            "PDFIUM_LIB_PATH '{}' does not exist — downloading PDFium instead",
            Path::new(&path).display()
        );
    }
    let platform = current_platform()?;
    let dir = pdfium_cache_dir();
    std::fs::create_dir_all(&dir).map_err(PdfiumAutoError::CacheDir)?;

    let url = format!("{RELEASES}/chromium%2F{PDFIUM_VERSION}/{}", platform.archive);
    info!("Downloading PDFium {} from {}", PDFIUM_VERSION, url);

    let mut archive = tempfile::tempfile_in(&dir).map_err(PdfiumAutoError::CacheDir)?;
    let bytes = fetch(&url, &mut archive, on_progress)?;
    archive
        .seek(SeekFrom::Start(0))
        .map_err(|e| PdfiumAutoError::Download(e.to_string()))?;

    let dest = dir.join(platform.lib_name);
    install_library(archive, platform.member, &dest)?;
    info!("PDFium ready at {} ({} byte archive)", dest.display(), bytes);
    Ok(dest)
}

/// Counts bytes on their way to `inner`.
struct Counting<'a, W> {
    inner: W,
    written: u64,
    total: Option<u64>,
    on_progress: Option<ProgressFn<'a>>,
}

impl<W: Write> Write for Counting<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        if let Some(report) = self.on_progress {
            report(self.written, self.total);
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn fetch(url: &str, out: &mut File, on_progress: Option<ProgressFn<'_>>) -> Result<u64, PdfiumAutoError> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("pdfium-auto/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| PdfiumAutoError::Download(e.to_string()))?;

    let mut response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| PdfiumAutoError::Download(format!("GET {url}: {e}")))?;

    let mut sink = Counting {
        total: response.content_length(),
        inner: out,
        written: 0,
        on_progress,
    };
    response
        .copy_to(&mut sink)
        .map_err(|e| PdfiumAutoError::Download(format!("GET {url}: {e}")))?;
    Ok(sink.written)
}

/// Unpack `member` of a gzipped tarball to `dest`, replacing it atomically.
fn install_library(archive: impl Read, member: &str, dest: &Path) -> Result<(), PdfiumAutoError> {
    let extract = |e: std::io::Error| PdfiumAutoError::Extract(e.to_string());
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));

    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(archive));
    for entry in tar.entries().map_err(extract)? {
        let mut entry = entry.map_err(extract)?;
        if *entry.path().map_err(extract)? != *Path::new(member) {
            continue;
        }
        let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(PdfiumAutoError::CacheDir)?;
        std::io::copy(&mut entry, staged.as_file_mut()).map_err(extract)?;
        staged
            .persist(dest)
            .map_err(|e| PdfiumAutoError::Extract(e.error.to_string()))?;
        return Ok(());
    }
    Err(PdfiumAutoError::Extract(format!("'{member}' is not in the archive")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn every_published_build_is_found() {
        for p in PLATFORMS {
            assert_eq!(platform_for(p.os, p.arch).unwrap(), p);
            assert!(p.member.ends_with(p.lib_name));
        }
        assert!(matches!(
            platform_for("freebsd", "x86_64"),
            Err(PdfiumAutoError::UnsupportedPlatform { .. })
        ));
    }

    #[test]
    fn cache_dir_is_versioned_and_overridable() {
        let default = pdfium_cache_dir();
        assert!(default.ends_with(format!("pdfium-{PDFIUM_VERSION}")));

        std::env::set_var("PDFIUM_AUTO_CACHE_DIR", "/tmp/scanbook-pdfium-test");
        let overridden = pdfium_cache_dir();
        std::env::remove_var("PDFIUM_AUTO_CACHE_DIR");
        assert_eq!(
            overridden,
            PathBuf::from("/tmp/scanbook-pdfium-test").join(format!("pdfium-{PDFIUM_VERSION}"))
        );
    }

    #[test]
    fn installs_only_the_library_member() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(&[
            ("include/fpdfview.h", b"header"),
            ("lib/libpdfium.so", b"\x7fELF library"),
            ("LICENSE", b"license"),
        ]);
        let dest = dir.path().join("libpdfium.so");

        install_library(archive.as_slice(), "lib/libpdfium.so", &dest).unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"\x7fELF library");
        let names: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn archive_without_the_library_installs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(&[("LICENSE", b"license")]);
        let dest = dir.path().join("libpdfium.so");

        let err = install_library(archive.as_slice(), "lib/libpdfium.so", &dest).unwrap_err();

        assert!(matches!(err, PdfiumAutoError::Extract(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn counting_writer_reports_running_totals() {
        let seen = std::cell::RefCell::new(Vec::new());
        let report = |done: u64, total: Option<u64>| seen.borrow_mut().push((done, total));
        let mut sink = Counting {
            inner: Vec::new(),
            written: 0,
            total: Some(6),
            on_progress: Some(&report),
        };
        sink.write_all(b"abc").unwrap();
        sink.write_all(b"def").unwrap();
        assert_eq!(sink.inner, b"abcdef");
        assert_eq!(*seen.borrow(), vec![(3, Some(6)), (6, Some(6))]);
    }
}
