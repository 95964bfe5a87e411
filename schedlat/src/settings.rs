use std::time::Duration;

use config::{Config, ConfigError, Environment};
use log::debug;
use schedlat_common::{ProbeConfig, TaskLayout};
use serde::Deserialize;

const DEFAULT_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_TIME_WINDOW_SECONDS: u64 = 10;

// Offsets that hold on common x86_64 builds. task_struct->cgroups moves with
// every config change and has no default.
const DEFAULT_CSS_SET_SUBSYS_OFFSET: u32 = 0;
const DEFAULT_SUBSYS_SLOT: u32 = 1;
const DEFAULT_CSS_CGROUP_OFFSET: u32 = 0;
const DEFAULT_CGROUP_KN_OFFSET: u32 = 0x100;
const DEFAULT_KERNFS_NAME_OFFSET: u32 = 0x10;

/// How the container runtime names container cgroups.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CgroupDriver {
    #[default]
    Systemd,
    Cgroupfs,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct CollectorSettings {
    pub enabled: Option<bool>,
    pub interval_seconds: Option<u64>,
    pub time_window_seconds: Option<u64>,
    pub cgroup_driver: Option<CgroupDriver>,
}

/// Kernel structure offsets used to walk from a task to its cgroup name.
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct KernelSettings {
    pub task_cgroups_offset: Option<u32>,
    pub css_set_subsys_offset: Option<u32>,
    pub subsys_slot: Option<u32>,
    pub css_cgroup_offset: Option<u32>,
    pub cgroup_kn_offset: Option<u32>,
    pub kernfs_name_offset: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    pub otel_exporter_otlp_protocol: Option<String>,
    pub node_name: Option<String>,
    #[serde(default)]
    pub collector: CollectorSettings,
    #[serde(default)]
    pub kernel: KernelSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn collector_enabled(&self) -> bool {
        self.collector.enabled.unwrap_or(true)
    }

    pub fn collector_interval(&self) -> Duration {
        Duration::from_secs(
            self.collector
                .interval_seconds
                .unwrap_or(DEFAULT_INTERVAL_SECONDS),
        )
    }

    pub fn collector_window(&self) -> Duration {
        Duration::from_secs(
            self.collector
                .time_window_seconds
                .unwrap_or(DEFAULT_TIME_WINDOW_SECONDS),
        )
    }

    pub fn cgroup_driver(&self) -> CgroupDriver {
        self.collector.cgroup_driver.unwrap_or_default()
    }

    pub fn task_layout(&self) -> TaskLayout {
        let kernel = &self.kernel;
        TaskLayout {
            task_cgroups: kernel.task_cgroups_offset.unwrap_or(0),
            css_set_subsys: kernel
                .css_set_subsys_offset
                .unwrap_or(DEFAULT_CSS_SET_SUBSYS_OFFSET),
            subsys_slot: kernel.subsys_slot.unwrap_or(DEFAULT_SUBSYS_SLOT),
            css_cgroup: kernel
                .css_cgroup_offset
                .unwrap_or(DEFAULT_CSS_CGROUP_OFFSET),
            cgroup_kn: kernel.cgroup_kn_offset.unwrap_or(DEFAULT_CGROUP_KN_OFFSET),
            kernfs_name: kernel
                .kernfs_name_offset
                .unwrap_or(DEFAULT_KERNFS_NAME_OFFSET),
        }
    }

    pub fn to_probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            layout: self.task_layout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 4] = [
        "COLLECTOR__INTERVAL_SECONDS",
        "COLLECTOR__CGROUP_DRIVER",
        "KERNEL__TASK_CGROUPS_OFFSET",
        "KERNEL__SUBSYS_SLOT",
    ];

    fn clear_vars() {
        for var in VARS {
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn test_load_settings() {
        clear_vars();
        unsafe {
            std::env::set_var("COLLECTOR__INTERVAL_SECONDS", "30");
            std::env::set_var("COLLECTOR__CGROUP_DRIVER", "cgroupfs");
            std::env::set_var("KERNEL__TASK_CGROUPS_OFFSET", "2336");
            std::env::set_var("KERNEL__SUBSYS_SLOT", "2");
        }

        let settings = Settings::new().expect("Failed to load settings");

        assert_eq!(settings.collector_interval(), Duration::from_secs(30));
        assert_eq!(settings.cgroup_driver(), CgroupDriver::Cgroupfs);
        let layout = settings.task_layout();
        assert_eq!(layout.task_cgroups, 2336);
        assert_eq!(layout.subsys_slot, 2);
        assert!(layout.is_configured());

        clear_vars();
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_vars();

        let settings = Settings::new().expect("Failed to load settings");

        assert!(settings.collector_enabled());
        assert_eq!(settings.collector_window(), Duration::from_secs(10));
        assert_eq!(settings.cgroup_driver(), CgroupDriver::Systemd);
        assert_eq!(settings.task_layout().subsys_slot, 1);
    }

    #[test]
    #[serial]
    fn test_every_cgroup_driver_parses() {
        clear_vars();

        for (value, driver) in [
            ("systemd", CgroupDriver::Systemd),
            ("cgroupfs", CgroupDriver::Cgroupfs),
        ] {
            unsafe { std::env::set_var("COLLECTOR__CGROUP_DRIVER", value) };
            let settings = Settings::new().expect("Failed to load settings");
            assert_eq!(settings.cgroup_driver(), driver);
        }

        clear_vars();
    }

    #[test]
    #[serial]
    fn test_unknown_cgroup_driver_is_rejected() {
        clear_vars();
        unsafe { std::env::set_var("COLLECTOR__CGROUP_DRIVER", "openrc") };

        assert!(Settings::new().is_err());

        clear_vars();
    }

    #[test]
    fn test_probe_config_without_task_offset_is_unconfigured() {
        let settings = Settings::default();

        let config = settings.to_probe_config();

        assert!(!config.layout.is_configured());
        assert_eq!(config.layout.kernfs_name, DEFAULT_KERNFS_NAME_OFFSET);
        assert_eq!(settings.collector_interval(), Duration::from_secs(60));
    }
}
