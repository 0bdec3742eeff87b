// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ini::{Ini, Properties};
use log::{debug, info, warn};
use nvhost_common::settings::{BackendKind, HostSettings, ResourcePolicy, TeardownPolicy};
use std::path::PathBuf;

/// Locate `nvhost.ini`.
pub fn find_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("NVHOST_CONFIG") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    // XDG_CONFIG_HOME
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join("nvhost").join("nvhost.ini");
        if path.exists() {
            return Some(path);
        }
    }

    // ~/.config/nvhost/nvhost.ini
    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home)
            .join(".config")
            .join("nvhost")
            .join("nvhost.ini");
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Parse a decimal or `0x`-prefixed hex number.
fn parse_number(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true")
}

/// Overwrite `field` with `key` from `section`; keep the default when the
/// value does not parse.
fn read_u32(section: &Properties, key: &str, field: &mut u32) {
    if let Some(value) = section.get(key) {
        match parse_number(value) {
            Some(n) => *field = n,
            None => warn!("Invalid value {:?} for {}, keeping {}", value, key, field),
        }
    }
}

/// Load settings from an INI file, falling back to defaults.
pub fn load_config(path: Option<&PathBuf>) -> HostSettings {
    let mut settings = HostSettings::default();

    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                warn!("Config file not found: {}", p.display());
                return settings;
            }
            p.clone()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => {
                info!("No nvhost config found, using defaults");
                return settings;
            }
        },
    };

    info!("Loading config from: {}", config_path.display());

    let conf = match Ini::load_from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to parse config: {}", e);
            return settings;
        }
    };

    // [Host]
    if let Some(section) = conf.section(Some("Host")) {
        if let Some(backend) = section.get("backend") {
            settings.backend = BackendKind::from_str_or_default(backend);
            debug!("Backend: {:?}", settings.backend);
        }
        if let Some(policy) = section.get("resource_policy") {
            settings.resource_policy = ResourcePolicy::from_str_or_default(policy);
            debug!("Resource policy: {:?}", settings.resource_policy);
        }
        if let Some(abort) = section.get("abort_on_close") {
            settings.abort_on_close = parse_bool(abort);
        }
        read_u32(section, "device_class", &mut settings.device_class);
        read_u32(section, "module_aperture_words", &mut settings.module_aperture_words);
        let mut virt_message_size = settings.virt_message_size as u32;
        read_u32(section, "virt_message_size", &mut virt_message_size);
        settings.virt_message_size = virt_message_size as usize;
    }

    // [Syncpoints]
    if let Some(section) = conf.section(Some("Syncpoints")) {
        read_u32(section, "count", &mut settings.num_syncpoints);
        read_u32(section, "mutexes", &mut settings.num_mutexes);
        read_u32(section, "free_wait_ms", &mut settings.syncpt_free_wait_ms);
        read_u32(section, "check_period_ms", &mut settings.syncpt_check_period_ms);
        read_u32(section, "max_stuck_checks", &mut settings.max_stuck_checks);
        read_u32(section, "poll_period_ms", &mut settings.poll_period_ms);
    }

    // [Channels]
    if let Some(section) = conf.section(Some("Channels")) {
        read_u32(section, "count", &mut settings.num_channels);
        read_u32(section, "push_buffer_slots", &mut settings.push_buffer_slots);
        read_u32(section, "max_gathers_per_job", &mut settings.max_gathers_per_job);
    }

    // [Timeouts]
    if let Some(section) = conf.section(Some("Timeouts")) {
        read_u32(section, "default_ms", &mut settings.default_timeout_ms);
        read_u32(section, "watchdog_period_ms", &mut settings.watchdog_period_ms);
        if let Some(policy) = section.get("teardown_policy") {
            settings.teardown_policy = TeardownPolicy::from_str_or_default(policy);
            debug!("Teardown policy: {:?}", settings.teardown_policy);
        }
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sections() {
        let file = write_config(
            "[Host]\n\
             backend = virtual\n\
             device_class = 0x5D\n\
             resource_policy = instance\n\
             abort_on_close = true\n\
             [Syncpoints]\n\
             count = 64\n\
             check_period_ms = 250\n\
             [Channels]\n\
             count = 4\n\
             push_buffer_slots = 128\n\
             [Timeouts]\n\
             default_ms = 500\n\
             teardown_policy = drop\n",
        );
        let settings = load_config(Some(&file.path().to_path_buf()));
        assert_eq!(settings.backend, BackendKind::Virtual);
        assert_eq!(settings.device_class, 0x5D);
        assert_eq!(settings.resource_policy, ResourcePolicy::PerChannelInstance);
        assert!(settings.abort_on_close);
        assert_eq!(settings.num_syncpoints, 64);
        assert_eq!(settings.syncpt_check_period_ms, 250);
        assert_eq!(settings.num_channels, 4);
        assert_eq!(settings.push_buffer_slots, 128);
        assert_eq!(settings.default_timeout_ms, 500);
        assert_eq!(settings.teardown_policy, TeardownPolicy::Drop);
        assert_eq!(settings.num_mutexes, HostSettings::default().num_mutexes);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let file = write_config("[Channels]\ncount = lots\n[Host]\nbackend = quantum\n");
        let settings = load_config(Some(&file.path().to_path_buf()));
        let defaults = HostSettings::default();
        assert_eq!(settings.num_channels, defaults.num_channels);
        assert_eq!(settings.backend, BackendKind::Local);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_config(Some(&dir.path().join("absent.ini")));
        assert_eq!(settings.num_syncpoints, HostSettings::default().num_syncpoints);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(" 0x30 "), Some(0x30));
        assert_eq!(parse_number("48"), Some(48));
        assert_eq!(parse_number("0xZZ"), None);
    }
}
