//! Native library loading with package-archive fallback
//!
//! The engine's library is normally found on the system search path. When it
//! is not, the library is pulled out of the application's own package archive
//! (`lib/<abi>/<file>` inside a zip) into a scratch file and loaded from there.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const COPY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Library {0} not found in any package archive")]
    NotFound(String),
    #[error("Failed to read package archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("Failed to extract library: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to load library {name}: {message}")]
    Link { name: String, message: String },
}

/// The platform's own library loading primitive
pub trait Linker: Send + Sync {
    /// Load by name from the system search path
    fn load_library(&self, name: &str) -> Result<(), String>;

    /// Load from an explicit file
    fn load_path(&self, path: &Path) -> Result<(), String>;
}

/// Anything that can guarantee a library is loaded
pub trait LoadLibrary: Send + Sync {
    fn ensure_loaded(&self, name: &str) -> Result<(), LoadError>;
}

/// Platform file name for a library, e.g. `libfoo.so` for `foo`
pub fn mapped_name(name: &str) -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        name,
        std::env::consts::DLL_SUFFIX
    )
}

/// Linker that resolves libraries against a list of directories
///
/// Loading succeeds when the file exists and is readable; the engine binding
/// opens it itself.
#[derive(Debug, Clone, Default)]
pub struct SearchPathLinker {
    dirs: Vec<PathBuf>,
}

impl SearchPathLinker {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

impl Linker for SearchPathLinker {
    fn load_library(&self, name: &str) -> Result<(), String> {
        let file_name = mapped_name(name);
        self.dirs
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
            .map(|found| debug!("Found {} at {}", name, found.display()))
            .ok_or_else(|| format!("{} is not on the search path", file_name))
    }

    fn load_path(&self, path: &Path) -> Result<(), String> {
        let meta = std::fs::metadata(path).map_err(|e| e.to_string())?;
        if meta.len() == 0 {
            return Err(format!("{} is empty", path.display()));
        }
        Ok(())
    }
}

pub struct LibraryLoader<L: Linker> {
    linker: L,
    packages: Vec<PathBuf>,
    abis: Vec<String>,
    scratch_dir: PathBuf,
}

impl<L: Linker> LibraryLoader<L> {
    /// Loader preferring the ABI this binary was built for
    pub fn new(linker: L) -> Self {
        Self {
            linker,
            packages: Vec::new(),
            abis: vec![std::env::consts::ARCH.to_string()],
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_package(mut self, path: impl Into<PathBuf>) -> Self {
        self.packages.push(path.into());
        self
    }

    /// Replace the ABI preference list, most preferred first
    pub fn with_abis<I, S>(mut self, abis: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.abis = abis.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Make sure `name` is loaded, extracting it from a package if needed
    pub fn load(&self, name: &str) -> Result<(), LoadError> {
        match self.linker.load_library(name) {
            Ok(()) => {
                debug!("Loaded {} from the system path", name);
                return Ok(());
            }
            Err(e) => info!("System load of {} failed ({}), trying package archives", name, e),
        }

        // Removed on drop, whatever happens below
        let scratch = tempfile::Builder::new()
            .prefix("lib")
            .suffix(std::env::consts::DLL_SUFFIX)
            .tempfile_in(&self.scratch_dir)?;

        if !self.extract(name, scratch.as_file())? {
            return Err(LoadError::NotFound(name.to_string()));
        }

        self.linker
            .load_path(scratch.path())
            .map_err(|message| LoadError::Link {
                name: name.to_string(),
                message,
            })?;
        info!("Loaded {} from package archive", name);
        Ok(())
    }

    /// Copy the first matching archive entry into `dest`
    fn extract(&self, name: &str, dest: &File) -> Result<bool, LoadError> {
        let file_name = mapped_name(name);

        for abi in &self.abis {
            let entry_path = format!("lib/{}/{}", abi, file_name);
            for package in &self.packages {
                let file = match File::open(package) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("Skipping package {}: {}", package.display(), e);
                        continue;
                    }
                };
                let mut archive =
                    zip::ZipArchive::new(file).map_err(|source| LoadError::Archive {
                        path: package.clone(),
                        source,
                    })?;

                let mut entry = match archive.by_name(&entry_path) {
                    Ok(entry) => entry,
                    Err(zip::result::ZipError::FileNotFound) => continue,
                    Err(source) => {
                        return Err(LoadError::Archive {
                            path: package.clone(),
                            source,
                        });
                    }
                };

                debug!(
                    "Extracting {}:/{} to scratch file",
                    package.display(),
                    entry_path
                );
                let mut out = BufWriter::with_capacity(COPY_BUFFER_SIZE, dest);
                io::copy(&mut entry, &mut out)?;
                out.flush()?;
                drop(out);
                dest.sync_all()?;
                return Ok(true);
            }
        }

        Ok(false)
    }
}

impl<L: Linker> LoadLibrary for LibraryLoader<L> {
    fn ensure_loaded(&self, name: &str) -> Result<(), LoadError> {
        self.load(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    /// Linker that refuses system loads and records file loads
    #[derive(Default)]
    struct RecordingLinker {
        system_ok: bool,
        loaded: Mutex<Vec<Vec<u8>>>,
    }

    impl Linker for RecordingLinker {
        fn load_library(&self, name: &str) -> Result<(), String> {
            if self.system_ok {
                Ok(())
            } else {
                Err(format!("{} missing", name))
            }
        }

        fn load_path(&self, path: &Path) -> Result<(), String> {
            let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
            self.loaded.lock().unwrap().push(bytes);
            Ok(())
        }
    }

    fn write_package(dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
        let path = dir.join("app.zip");
        let file = File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_system_load_skips_extraction() {
        let linker = RecordingLinker {
            system_ok: true,
            ..Default::default()
        };
        let loader = LibraryLoader::new(linker).with_package("/nonexistent/app.zip");

        loader.load("engine").unwrap();
        assert!(loader.linker.loaded.lock().unwrap().is_empty());
    }

    #[test]
    fn test_extracts_preferred_abi() {
        let dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let file_name = mapped_name("engine");
        let arm = format!("lib/arm64-v8a/{}", file_name);
        let x86 = format!("lib/x86_64/{}", file_name);
        let package = write_package(
            dir.path(),
            &[(x86.as_str(), "x86 build"), (arm.as_str(), "arm build")],
        );

        let loader = LibraryLoader::new(RecordingLinker::default())
            .with_package(&package)
            .with_abis(["arm64-v8a", "x86_64"])
            .with_scratch_dir(scratch.path());

        loader.load("engine").unwrap();
        assert_eq!(
            loader.linker.loaded.lock().unwrap().as_slice(),
            &[b"arm build".to_vec()]
        );
        // Scratch copy is gone after loading
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_falls_back_to_next_abi() {
        let dir = TempDir::new().unwrap();
        let entry = format!("lib/x86_64/{}", mapped_name("engine"));
        let package = write_package(dir.path(), &[(entry.as_str(), "x86 build")]);

        let loader = LibraryLoader::new(RecordingLinker::default())
            .with_package(&package)
            .with_abis(["arm64-v8a", "x86_64"])
            .with_scratch_dir(dir.path());

        loader.ensure_loaded("engine").unwrap();
        assert_eq!(loader.linker.loaded.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_library_is_not_found() {
        let dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let package = write_package(dir.path(), &[("lib/x86_64/libother.so", "other")]);

        let loader = LibraryLoader::new(RecordingLinker::default())
            .with_package(&package)
            .with_abis(["x86_64"])
            .with_scratch_dir(scratch.path());

        let err = loader.load("engine").unwrap_err();
        assert!(matches!(err, LoadError::NotFound(ref n) if n == "engine"));
        assert_eq!(err.to_string(), "Library engine not found in any package archive");
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_corrupt_package_is_archive_error() {
        let dir = TempDir::new().unwrap();
        let package = dir.path().join("broken.zip");
        std::fs::write(&package, b"not a zip file").unwrap();

        let loader = LibraryLoader::new(RecordingLinker::default())
            .with_package(&package)
            .with_scratch_dir(dir.path());

        assert!(matches!(
            loader.load("engine"),
            Err(LoadError::Archive { .. })
        ));
    }

    #[test]
    fn test_link_failure_is_reported() {
        struct RefusingLinker;
        impl Linker for RefusingLinker {
            fn load_library(&self, _name: &str) -> Result<(), String> {
                Err("missing".to_string())
            }
            fn load_path(&self, _path: &Path) -> Result<(), String> {
                Err("wrong ELF class".to_string())
            }
        }

        let dir = TempDir::new().unwrap();
        let entry = format!("lib/{}/{}", std::env::consts::ARCH, mapped_name("engine"));
        let package = write_package(dir.path(), &[(entry.as_str(), "bytes")]);
        let loader = LibraryLoader::new(RefusingLinker)
            .with_package(&package)
            .with_scratch_dir(dir.path());

        let err = loader.load("engine").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to load library engine: wrong ELF class"
        );
    }

    #[test]
    fn test_search_path_linker() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(mapped_name("engine")), b"elf").unwrap();
        let linker = SearchPathLinker::new(vec![dir.path().to_path_buf()]);

        assert!(linker.load_library("engine").is_ok());
        assert!(linker.load_library("other").is_err());

        let empty = dir.path().join("empty.so");
        std::fs::write(&empty, b"").unwrap();
        assert!(linker.load_path(&empty).is_err());
    }
}
