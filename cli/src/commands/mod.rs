//! CLI command implementations.

mod info;
mod run;
mod scan;

pub use info::show_info;
pub use run::run_service;
pub use scan::scan_devices;
