//! Camera Session - Main Entry Point
//!
//! Usage: `camera-session [settings.toml]`

use camera_hal::HalSettings;
use camera_session::{init_logging, run_session, SessionPlan};
use std::path::PathBuf;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    let settings = HalSettings::load(path.as_deref())?;
    init_logging(&settings.log_level)?;

    info!("=== Camera HAL session v{} ===", env!("CARGO_PKG_VERSION"));

    let report = run_session(settings, &SessionPlan::default())?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
