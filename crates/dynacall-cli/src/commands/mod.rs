pub mod abi;
pub mod call;
pub mod config;
pub mod lookup;

use anyhow::{Context, Result};
use dynacall_config::EngineConfig;
use dynacall_runtime::{Library, LibraryHandle, Registry};

/// Library argument naming the symbols already loaded into the process
pub const SELF_LIBRARY: &str = "self";

/// A library opened for one command
pub enum Target {
    Process,
    Opened(Library),
}

impl Target {
    pub fn open(library: &str) -> Result<Self> {
        if library == SELF_LIBRARY {
            return Ok(Target::Process);
        }
        let lib = Library::open(library).with_context(|| format!("Failed to open {}", library))?;
        Ok(Target::Opened(lib))
    }

    pub fn handle(&self) -> LibraryHandle {
        match self {
            Target::Process => LibraryHandle::DEFAULT,
            Target::Opened(lib) => lib.handle(),
        }
    }
}

/// Install the effective configuration into the process registry
pub fn init_registry(engine: EngineConfig) -> Result<&'static Registry> {
    Registry::init(engine).context("Failed to initialize the FFI engine")
}
