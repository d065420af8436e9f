//! UI utilities for terminal output.

mod banner;
mod device_list;

pub use banner::print_banner;
pub use device_list::{format_preview, print_device_page};
