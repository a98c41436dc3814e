//! Lookup command - resolve symbols and print their addresses

use super::{init_registry, Target};
use anyhow::{bail, Result};
use dynacall_config::EngineConfig;
use dynacall_runtime::loader;

pub fn run(engine: EngineConfig, library: &str, symbols: &[String]) -> Result<()> {
    init_registry(engine)?;
    let target = Target::open(library)?;

    let mut missing = 0;
    for symbol in symbols {
        match loader::lookup(target.handle(), symbol) {
            0 => {
                missing += 1;
                let reason = loader::error_message().unwrap_or_else(|| "not found".to_string());
                eprintln!("{}: {}", symbol, reason);
            }
            address => println!("{} {:#x}", symbol, address),
        }
    }

    if missing > 0 {
        bail!("{} of {} symbols not found in {}", missing, symbols.len(), library);
    }
    Ok(())
}
