//! Host configuration: a JSON file plus command-line overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cadence_jobs::JobQueueConfig;
use cadence_runtime::SchedulerConfig;
use clap::Args;
use color_eyre::eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

/// Scheduler and job queue settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Pass budget and host slicing
    pub scheduler: SchedulerConfig,
    /// Worker pool
    pub jobs: JobQueueConfig,
}

/// Flags that override the configuration file
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Time budget per pass in milliseconds
    #[arg(long, conflicts_with = "unbounded")]
    pub budget_ms: Option<u64>,
    /// Run passes without a time budget
    #[arg(long)]
    pub unbounded: bool,
    /// Cycle cap per pass
    #[arg(long)]
    pub max_cycles: Option<u64>,
    /// Host time slice in milliseconds
    #[arg(long)]
    pub slice_ms: Option<u64>,
    /// Job worker threads
    #[arg(long)]
    pub workers: Option<usize>,
}

impl Settings {
    /// Read `path`, or start from defaults without one.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).wrap_err_with(|| format!("parsing {}", path.display()))
    }

    /// Load, override and validate.
    pub fn resolve(args: &ConfigArgs) -> Result<Self> {
        let mut settings = Self::load(args.config.as_deref())?;
        settings.apply(args);
        settings.validate()?;
        Ok(settings)
    }

    /// Apply command-line overrides.
    pub fn apply(&mut self, args: &ConfigArgs) {
        if args.unbounded {
            self.scheduler.time_budget = None;
        }
        if let Some(ms) = args.budget_ms {
            self.scheduler.time_budget = Some(Duration::from_millis(ms));
        }
        if args.max_cycles.is_some() {
            self.scheduler.max_cycles_per_pass = args.max_cycles;
        }
        if let Some(ms) = args.slice_ms {
            self.scheduler.slice_interval = Duration::from_millis(ms);
        }
        if let Some(workers) = args.workers {
            self.jobs.worker_slots = workers;
        }
    }

    /// Validate both sections.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate().wrap_err("scheduler settings")?;
        self.jobs.validate().wrap_err("job queue settings")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_jobs::NotificationMode;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::resolve(&ConfigArgs::default()).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_file_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"scheduler": {{"time_budget": 20, "slice_interval": 5}}, "jobs": {{"worker_slots": 3, "notification": "per_job"}}}}"#
        )
        .unwrap();

        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            workers: Some(6),
            max_cycles: Some(100),
            ..ConfigArgs::default()
        };
        let settings = Settings::resolve(&args).unwrap();
        assert_eq!(settings.scheduler.time_budget, Some(Duration::from_millis(20)));
        assert_eq!(settings.scheduler.slice_interval, Duration::from_millis(5));
        assert_eq!(settings.scheduler.max_cycles_per_pass, Some(100));
        assert_eq!(settings.jobs.worker_slots, 6);
        assert_eq!(settings.jobs.notification, NotificationMode::PerJob);
    }

    #[test]
    fn test_unbounded_flag() {
        let mut settings = Settings::default();
        settings.apply(&ConfigArgs {
            unbounded: true,
            ..ConfigArgs::default()
        });
        assert_eq!(settings.scheduler.time_budget, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let args = ConfigArgs {
            workers: Some(0),
            ..ConfigArgs::default()
        };
        assert!(Settings::resolve(&args).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            ..ConfigArgs::default()
        };
        assert!(Settings::resolve(&args).is_err());
    }
}
