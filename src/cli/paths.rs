//! CLI subcommand: `elementgate paths`
//!
//! Prints all resolved XDG-compliant paths for debugging and scripting.

use anyhow::Result;

use elementgate::paths::Paths;

pub fn run() -> Result<()> {
    let paths = Paths::resolve()?;

    println!("ElementGate Paths (XDG Base Directory)");
    println!("======================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data:       {}", paths.data_dir.display());
    println!("  portfolio:      {}", paths.portfolio.display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  audit log:      {}", paths.audit_log().display());
    println!();
    match paths.runtime_dir {
        Some(ref dir) => println!("Runtime:    {}", dir.display()),
        None => println!("Runtime:    (not available)"),
    }
    println!("  lock files:     {}", paths.lock_dir().display());

    Ok(())
}
