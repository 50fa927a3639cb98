use glob::glob;
use std::fs;

pub const PORT_PREFIX: &str = "/dev/ttyUSB";

/// True if any process holds `port_name` open.
pub fn is_port_open(port_name: &str) -> bool {
    let entries = match glob("/proc/[0-9]*/fd/*") {
        Ok(entries) => entries,
        Err(_) => return false,
    };

    entries
        .filter_map(|p| p.ok())
        .filter_map(|path| fs::read_link(path).ok())
        .any(|link| link.to_str() == Some(port_name))
}
