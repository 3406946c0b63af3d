//! The module host: loads the game's dynamic library, owns its state
//! buffer, and hot-swaps the library when the file on disk changes.
//!
//! The library is never loaded from its build output path directly: the
//! bytes are copied to a sidecar path first and the copy is what gets
//! loaded, so the OS file lock lands on the sidecar and the build tool
//! can overwrite the original while the engine runs. The state buffer is
//! allocated once from the app arena and survives every reload; the
//! module reinterprets those bytes on each call.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use libloading::Library;
use thiserror::Error;

use kiln_abi::{
    GetApiVersionFn, GetMemorySizeFn, LifecycleFn, API_VERSION, SYM_GET_API_VERSION,
    SYM_GET_MEMORY_SIZE, SYM_LOAD, SYM_RELOAD, SYM_UNLOAD, SYM_UPDATE,
};

use crate::engine::Engine;
use crate::foundation::arena::Arena;

/// Module host errors.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// Reading or copying the library file failed.
    #[error("module file {path}: {source}")]
    Io {
        /// Path involved.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The dynamic loader rejected the library.
    #[error("failed to load module library: {0}")]
    Library(String),

    /// A required export is missing.
    #[error("module is missing symbol {0}")]
    MissingSymbol(String),

    /// The module was built against a different ABI.
    #[error("module ABI version {actual} does not match engine version {expected}")]
    VersionMismatch {
        /// The engine's version constant.
        expected: u32,
        /// What the module reported.
        actual: u32,
    },

    /// The state buffer could not be allocated from the app arena.
    #[error("module state allocation of {0} bytes failed")]
    StateAlloc(usize),
}

/// The six resolved exports, copied out of the library as plain function
/// pointers. Invalidated (dropped) together with the library handle.
struct ModuleSymbols {
    get_memory_size: GetMemorySizeFn,
    load: LifecycleFn,
    update: LifecycleFn,
    unload: LifecycleFn,
    reload: LifecycleFn,
}

/// Owns the loaded library, the resolved symbols, and the state buffer.
pub struct ModuleHost {
    source_path: PathBuf,
    loaded_path: PathBuf,
    library: Option<(Library, ModuleSymbols)>,
    memory: *mut u8,
    memory_len: usize,
    last_write: Option<SystemTime>,
}

impl ModuleHost {
    /// Load the module for the first time and run its `load` call.
    /// `load_mesh` is honored only inside that call.
    pub fn init_game(
        engine: &mut Engine,
        module_dir: &Path,
        module_name: &str,
    ) -> Result<Self, ModuleError> {
        let source_path = module_dir.join(platform_lib_name(module_name));
        let loaded_path = sidecar_path(&source_path);
        let last_write = file_mtime(&source_path);

        let (library, symbols) = load_library(&source_path, &loaded_path, &engine.arenas.frame)?;

        // Called once per process; reloads that report a different size
        // keep this buffer.
        let size = unsafe { (symbols.get_memory_size)() };
        let memory = engine.arenas.app.alloc_bytes(size);
        if memory.len() != size {
            return Err(ModuleError::StateAlloc(size));
        }

        let mut host = Self {
            source_path,
            loaded_path,
            library: Some((library, symbols)),
            memory: memory.as_mut_ptr(),
            memory_len: size,
            last_write,
        };

        log::info!(
            "module loaded from {:?} ({} state bytes)",
            host.source_path,
            size
        );

        engine.allow_mesh_load = true;
        host.call(engine, LifecyclePhase::Load);
        engine.allow_mesh_load = false;

        Ok(host)
    }

    /// Whether a module is currently loaded (a failed hot reload leaves
    /// the host empty until the next successful one).
    pub fn is_loaded(&self) -> bool {
        self.library.is_some()
    }

    /// Run the per-frame `update` if a module is loaded.
    pub fn update(&self, engine: &mut Engine) {
        self.call(engine, LifecyclePhase::Update);
    }

    /// Check the source file's timestamp and hot-swap the library if it
    /// changed. The engine memory buffer is preserved across the swap.
    pub fn poll_reload(&mut self, engine: &mut Engine) {
        let Some(mtime) = file_mtime(&self.source_path) else {
            return;
        };
        if self.last_write == Some(mtime) {
            return;
        }
        self.last_write = Some(mtime);
        log::info!("module change detected, reloading {:?}", self.source_path);

        // No module pointer may be invalidated while the GPU could still
        // be inside work recorded on its behalf.
        if let Err(e) = engine.context.wait_idle() {
            log::error!("device wait before reload failed: {}", e);
            return;
        }

        if self.library.is_some() {
            self.call(engine, LifecyclePhase::Unload);
            self.library = None; // closes the sidecar library
        }

        match load_library(&self.source_path, &self.loaded_path, &engine.arenas.frame) {
            Ok((library, symbols)) => {
                let new_size = unsafe { (symbols.get_memory_size)() };
                if new_size != self.memory_len {
                    log::warn!(
                        "module now wants {} state bytes (had {}); keeping the old buffer",
                        new_size,
                        self.memory_len
                    );
                }
                self.library = Some((library, symbols));
                self.call(engine, LifecyclePhase::Reload);
                log::info!("module reloaded");
            }
            Err(e) => {
                // Keep running without gameplay updates; the next file
                // change will be picked up by the timestamp check.
                log::warn!("module reload failed, previous module stays unloaded: {}", e);
            }
        }
    }

    /// Run `unload` and drop the library. Called at engine shutdown.
    pub fn shutdown(&mut self, engine: &mut Engine) {
        if self.library.is_some() {
            self.call(engine, LifecyclePhase::Unload);
            self.library = None;
        }
    }

    fn call(&self, engine: &mut Engine, phase: LifecyclePhase) {
        let Some((_, symbols)) = &self.library else {
            return;
        };
        let function = match phase {
            LifecyclePhase::Load => symbols.load,
            LifecyclePhase::Update => symbols.update,
            LifecyclePhase::Unload => symbols.unload,
            LifecyclePhase::Reload => symbols.reload,
        };
        let api = engine.api_table();
        // The module only reads and writes inside the state buffer for
        // the duration of the call; the api table points at `engine`.
        unsafe { function(&api, self.memory, self.memory_len) };
    }
}

#[derive(Clone, Copy)]
enum LifecyclePhase {
    Load,
    Update,
    Unload,
    Reload,
}

/// Read the source library, copy it to the sidecar path, and load the
/// copy. Resolves and version-checks the exports.
fn load_library(
    source: &Path,
    sidecar: &Path,
    frame_arena: &Arena,
) -> Result<(Library, ModuleSymbols), ModuleError> {
    let bytes = std::fs::read(source).map_err(|e| ModuleError::Io {
        path: source.display().to_string(),
        source: e,
    })?;
    // Stage through the frame arena; if the arena is exhausted the Vec
    // serves as-is.
    let staged = frame_arena.copy_bytes(&bytes);
    let payload: &[u8] = if staged.len() == bytes.len() {
        staged
    } else {
        &bytes
    };
    std::fs::write(sidecar, payload).map_err(|e| ModuleError::Io {
        path: sidecar.display().to_string(),
        source: e,
    })?;

    let library =
        unsafe { Library::new(sidecar) }.map_err(|e| ModuleError::Library(e.to_string()))?;

    let get_api_version: GetApiVersionFn = resolve(&library, SYM_GET_API_VERSION)?;
    let actual = unsafe { get_api_version() };
    if actual != API_VERSION {
        return Err(ModuleError::VersionMismatch {
            expected: API_VERSION,
            actual,
        });
    }

    let symbols = ModuleSymbols {
        get_memory_size: resolve(&library, SYM_GET_MEMORY_SIZE)?,
        load: resolve(&library, SYM_LOAD)?,
        update: resolve(&library, SYM_UPDATE)?,
        unload: resolve(&library, SYM_UNLOAD)?,
        reload: resolve(&library, SYM_RELOAD)?,
    };
    Ok((library, symbols))
}

/// Copy a typed function pointer out of the library.
fn resolve<T: Copy>(library: &Library, name: &[u8]) -> Result<T, ModuleError> {
    let symbol = unsafe { library.get::<T>(name) }.map_err(|_| {
        ModuleError::MissingSymbol(String::from_utf8_lossy(name).into_owned())
    })?;
    Ok(*symbol)
}

/// Platform dynamic-library file name for a module base name.
pub fn platform_lib_name(name: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.dll", name)
    } else if cfg!(target_os = "macos") {
        format!("lib{}.dylib", name)
    } else {
        format!("lib{}.so", name)
    }
}

/// The sidecar ("loaded") path next to the source library.
pub fn sidecar_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut file_name = format!("{}_loaded", stem);
    if let Some(ext) = source.extension() {
        file_name.push('.');
        file_name.push_str(&ext.to_string_lossy());
    }
    source.with_file_name(file_name)
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_names_follow_the_platform() {
        let name = platform_lib_name("game");
        #[cfg(target_os = "windows")]
        assert_eq!(name, "game.dll");
        #[cfg(target_os = "macos")]
        assert_eq!(name, "libgame.dylib");
        #[cfg(all(unix, not(target_os = "macos")))]
        assert_eq!(name, "libgame.so");
    }

    #[test]
    fn sidecar_sits_next_to_the_source() {
        let sidecar = sidecar_path(Path::new("/build/out/libgame.so"));
        assert_eq!(sidecar, PathBuf::from("/build/out/libgame_loaded.so"));

        let sidecar = sidecar_path(Path::new("game.dll"));
        assert_eq!(sidecar, PathBuf::from("game_loaded.dll"));
    }

    #[test]
    fn missing_file_reports_io_error() {
        let arena = Arena::with_capacity(1024, 4096).unwrap();
        let err = load_library(
            Path::new("/nonexistent/libgame.so"),
            Path::new("/nonexistent/libgame_loaded.so"),
            &arena,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ModuleError::Io { .. }));
    }
}
