//! Config command - print the effective configuration

use anyhow::Result;
use dynacall_config::Config;

pub fn run(config: &Config) -> Result<()> {
    match config.project_root() {
        Some(root) => println!("# project: {}", root.display()),
        None => println!("# project: none"),
    }
    println!("# gate mode: {}", config.engine.gate_mode());
    print!("{}", config.engine.to_toml_string()?);
    Ok(())
}
