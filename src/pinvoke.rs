//! Shared-library symbols called under a native guard.
//!
//! Only nullary `extern "C"` entry points are supported; the caller names the
//! signature. Argument marshalling belongs to the runtime, not the bridge.
use crate::{
    error::{NativeLibraryError, Result},
    threading::Mutator,
};
use dashmap::{mapref::one::Ref, DashMap};
use libloading::{Library, Symbol};
use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg(target_os = "macos")]
const PLATFORM_SUFFIXES: &[&str] = &[".dylib"];
#[cfg(target_os = "windows")]
const PLATFORM_SUFFIXES: &[&str] = &[".dll"];
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const PLATFORM_SUFFIXES: &[&str] = &[".so"];

fn is_versioned(path: &Path, name: &str) -> bool {
    let Some(file_name) = path.file_name().and_then(|f| f.to_str()) else {
        return false;
    };
    file_name
        .strip_prefix(name)
        .is_some_and(|rest| rest.starts_with(".so.") || rest.starts_with(".dylib."))
}

pub struct NativeLibraries {
    /// Searched before the system loader's own paths
    root: Option<PathBuf>,
    libraries: DashMap<String, Library>,
}

impl NativeLibraries {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: Some(root.as_ref().to_path_buf()),
            libraries: DashMap::new(),
        }
    }

    /// Resolve libraries through the system loader only.
    pub fn system() -> Self {
        Self {
            root: None,
            libraries: DashMap::new(),
        }
    }

    /// Look under the root for `name` as given, then with the platform
    /// suffix, then as a versioned file such as `libm.so.6`.
    fn find_library_path(&self, name: &str) -> Option<PathBuf> {
        let root = self.root.as_deref()?;
        let exact = std::iter::once(root.join(name));
        let suffixed = PLATFORM_SUFFIXES.iter().map(|ext| root.join(format!("{name}{ext}")));
        if let Some(path) = exact.chain(suffixed).find(|p| p.is_file()) {
            return Some(path);
        }

        let mut versioned: Vec<PathBuf> = root
            .read_dir()
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_versioned(path, name))
            .collect();
        // Deterministic pick when several versions are installed.
        versioned.sort();
        versioned.pop()
    }

    pub fn get_library(&self, name: &str) -> std::result::Result<Ref<'_, String, Library>, NativeLibraryError> {
        if let Some(lib) = self.libraries.get(name) {
            return Ok(lib);
        }

        // Fall back to the bare name and let the platform loader search.
        let path = self.find_library_path(name).unwrap_or_else(|| PathBuf::from(name));
        debug!(library = name, ?path, "loading native library");

        let lib = unsafe { Library::new(&path) }.map_err(|e| {
            if self.root.is_some() && !path.exists() {
                NativeLibraryError::LibraryNotFound(name.to_string())
            } else {
                NativeLibraryError::LoadError(name.to_string(), e.to_string())
            }
        })?;

        Ok(self.libraries.entry(name.to_string()).or_insert(lib).downgrade())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.libraries.contains_key(name)
    }

    /// Look up `symbol` in `library` as a value of type `F`.
    ///
    /// # Safety
    /// `F` must be a function pointer type matching the symbol's real
    /// signature. The pointer stays valid while `self` is alive; loaded
    /// libraries are never unloaded before that.
    pub unsafe fn get_function<F: Copy>(
        &self,
        library: &str,
        symbol: &str,
    ) -> std::result::Result<F, NativeLibraryError> {
        let lib = self.get_library(library)?;
        let sym: Symbol<F> = lib
            .value()
            .get(symbol.as_bytes())
            .map_err(|_| NativeLibraryError::SymbolNotFound(library.to_string(), symbol.to_string()))?;
        Ok(*sym)
    }

    /// Call a nullary C entry point with the thread in native state.
    ///
    /// # Safety
    /// The symbol must have the signature `extern "C" fn() -> R` and must not
    /// touch the managed heap.
    pub unsafe fn invoke_guarded<R>(&self, mutator: &Mutator, library: &str, symbol: &str) -> Result<R> {
        let f: unsafe extern "C" fn() -> R = self.get_function(library, symbol)?;
        mutator.with_native_guard(|| f())
    }
}

impl std::fmt::Debug for NativeLibraries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeLibraries")
            .field("root", &self.root)
            .field("loaded", &self.libraries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BridgeConfig,
        error::BridgeError,
        gc::{CollectorCoordinator, NullCollector},
    };

    #[test]
    fn missing_library_is_reported() {
        let libs = NativeLibraries::new(std::env::temp_dir());
        let err = libs.get_library("libdefinitely-not-here").unwrap_err();
        assert_eq!(
            err,
            NativeLibraryError::LibraryNotFound("libdefinitely-not-here".to_string())
        );
        assert!(!libs.is_loaded("libdefinitely-not-here"));
    }

    fn library_dir(tag: &str, files: &[&str]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gc-bridge-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        for file in files {
            std::fs::write(dir.join(file), b"").unwrap();
        }
        dir
    }

    #[test]
    fn search_order_under_root() {
        let dir = library_dir(
            "search",
            &["libexact", "libplain.so", "libplain.so.1", "libold.so.1", "libold.so.2"],
        );
        let libs = NativeLibraries::new(&dir);

        assert_eq!(libs.find_library_path("libexact"), Some(dir.join("libexact")));
        assert_eq!(libs.find_library_path("libold"), Some(dir.join("libold.so.2")));
        assert_eq!(libs.find_library_path("libol"), None);
        assert_eq!(libs.find_library_path("libmissing"), None);
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        assert_eq!(libs.find_library_path("libplain"), Some(dir.join("libplain.so")));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn versioned_file_that_is_not_a_library() {
        let dir = library_dir("bogus", &["libbogus.so.3"]);
        let libs = NativeLibraries::new(&dir);

        let err = libs.get_library("libbogus").unwrap_err();
        assert!(matches!(err, NativeLibraryError::LoadError(ref name, _) if name == "libbogus"));
        assert!(!libs.is_loaded("libbogus"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn system_loader_has_no_root() {
        assert_eq!(NativeLibraries::system().find_library_path("libc.so.6"), None);
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn getpid_runs_native() {
        let coordinator = CollectorCoordinator::new(BridgeConfig::default(), NullCollector);
        let mutator = coordinator.register_thread().unwrap();
        let libs = NativeLibraries::system();

        let pid: i32 = unsafe { libs.invoke_guarded(&mutator, "libc.so.6", "getpid") }.unwrap();
        assert_eq!(pid as u32, std::process::id());
        assert!(libs.is_loaded("libc.so.6"));
        assert_eq!(coordinator.metrics().summary().native_transitions, 1);

        let missing = unsafe { libs.invoke_guarded::<i32>(&mutator, "libc.so.6", "no_such_symbol_here") };
        assert_eq!(
            missing,
            Err(BridgeError::NativeLibrary(NativeLibraryError::SymbolNotFound(
                "libc.so.6".to_string(),
                "no_such_symbol_here".to_string()
            )))
        );
    }
}
