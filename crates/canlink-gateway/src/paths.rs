//! Well-known socket location

use std::path::PathBuf;

/// Per-user gateway socket: the runtime dir when the platform has one,
/// otherwise the system temp dir
pub fn default_socket_path() -> PathBuf {
    let dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
    dir.join(socket_file_name(&current_user()))
}

fn socket_file_name(user: &str) -> String {
    format!("canlink-{}.sock", user)
}

fn current_user() -> String {
    ["USER", "LOGNAME", "USERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|name| name.trim().replace(['/', '\\'], "_"))
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_name_is_per_user() {
        assert_eq!(socket_file_name("alice"), "canlink-alice.sock");
        let path = default_socket_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("canlink-") && name.ends_with(".sock"));
    }
}
