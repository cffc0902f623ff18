use std::sync::Arc;

use anyhow::Context as _;
use dayclose_closing::{ClosingOptions, DailyClosing, SimulatedBackend};
use dayclose_core::DaycloseConfig;
use dayclose_engine::{EngineOptions, Runtime, Store, SystemClock};
use dayclose_scheduler::{DailyClosingScheduler, SchedulerOptions};
use tracing::info;

/// Everything a command needs: the runtime with both services registered and
/// the collaborators they were registered with.
pub struct App {
    pub runtime: Runtime,
    pub backend: Arc<SimulatedBackend>,
}

impl App {
    /// Open the database (running migrations) and register services.
    pub fn open(config: &DaycloseConfig) -> anyhow::Result<Self> {
        let db_path = &config.database.path;
        ensure_parent_dir(db_path);
        info!(path = %db_path, "opening SQLite database");
        let store = Store::open(db_path).with_context(|| format!("opening {db_path}"))?;

        let runtime = Runtime::new(
            store,
            Arc::new(SystemClock),
            EngineOptions::from_config(&config.engine),
        );

        let backend = Arc::new(SimulatedBackend::new(&config.simulation));
        let closing = ClosingOptions::from_config(&config.closing)?;
        Arc::new(DailyClosing::new(backend.clone(), backend.clone(), closing)).register(&runtime);

        let schedule = SchedulerOptions::from_config(config)?;
        Arc::new(DailyClosingScheduler::new(schedule)).register(&runtime);

        Ok(Self { runtime, backend })
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dayclose_closing::workflow;
    use dayclose_core::ClosingDate;

    fn config_in(dir: &tempfile::TempDir) -> DaycloseConfig {
        let mut config = DaycloseConfig::default();
        config.database.path = dir
            .path()
            .join("nested/dayclose.db")
            .to_string_lossy()
            .into_owned();
        config
    }

    #[test]
    fn open_creates_the_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(&config_in(&dir)).unwrap();
        assert!(dir.path().join("nested/dayclose.db").exists());
        assert!(app.runtime.next_timer_at().unwrap().is_none());
    }

    #[test]
    fn enqueued_run_is_visible_to_a_second_process() {
        let dir = tempfile::tempdir().unwrap();
        let date = ClosingDate::parse("2025-01-31").unwrap();
        {
            let app = App::open(&config_in(&dir)).unwrap();
            app.runtime
                .send(
                    workflow::target(&date),
                    serde_json::Value::Null,
                    std::time::Duration::ZERO,
                )
                .unwrap();
        }
        let app = App::open(&config_in(&dir)).unwrap();
        let timers = app.runtime.store().timers().unwrap();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].target, workflow::target(&date));
    }
}
