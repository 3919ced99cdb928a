use super::{CliConfig, Config, FileConfig};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Called with the old and the new configuration after every change.
pub type ConfigListener = Box<dyn Fn(&Config, &Config) + Send + Sync>;

/// Source of the runtime configuration.
pub trait ConfigService: Send + Sync {
    fn config(&self) -> Arc<Config>;

    /// Registers `listener` and returns an id for [`ConfigService::remove_config_listener`].
    fn add_config_listener(&self, listener: ConfigListener) -> String;

    fn remove_config_listener(&self, id: &str);
}

/// In-memory [`ConfigService`].
///
/// When built with [`LiveConfigService::with_file`] the configuration can be
/// re-read from its TOML file with [`LiveConfigService::reload`].
pub struct LiveConfigService {
    current: RwLock<Arc<Config>>,
    listeners: Mutex<HashMap<String, Arc<dyn Fn(&Config, &Config) + Send + Sync>>>,
    source: Option<(CliConfig, PathBuf)>,
}

impl LiveConfigService {
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            listeners: Mutex::new(HashMap::new()),
            source: None,
        }
    }

    pub fn with_file(config: Config, cli: CliConfig, path: PathBuf) -> Self {
        Self {
            source: Some((cli, path)),
            ..Self::new(config)
        }
    }

    /// Replaces the configuration and notifies every listener.
    pub fn set_config(&self, config: Config) {
        let new_config = Arc::new(config);
        let old_config = {
            let mut current = self.current.write().unwrap();
            std::mem::replace(&mut *current, new_config.clone())
        };

        // Listeners are called outside the lock so they can register or
        // remove listeners themselves.
        let listeners: Vec<_> = self.listeners.lock().unwrap().values().cloned().collect();
        debug!("Config changed, notifying {} listeners", listeners.len());
        for listener in listeners {
            listener(&old_config, &new_config);
        }
    }

    /// Re-reads the TOML file and publishes the result.
    pub fn reload(&self) -> Result<()> {
        let (cli, path) = self
            .source
            .as_ref()
            .ok_or_else(|| anyhow!("No config file to reload from"))?;
        let file = FileConfig::load(path)?;
        let config = Config::resolve(cli, &file)?;

        if *self.config() == config {
            info!("Config file {:?} reloaded, nothing changed", path);
            return Ok(());
        }
        info!("Config file {:?} reloaded", path);
        self.set_config(config);
        Ok(())
    }
}

impl ConfigService for LiveConfigService {
    fn config(&self) -> Arc<Config> {
        self.current.read().unwrap().clone()
    }

    fn add_config_listener(&self, listener: ConfigListener) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.listeners
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::from(listener));
        id
    }

    fn remove_config_listener(&self, id: &str) {
        self.listeners.lock().unwrap().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_set_config_notifies_listeners_with_old_and_new() {
        let service = LiveConfigService::new(Config::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        service.add_config_listener(Box::new(move |old, new| {
            seen_clone
                .lock()
                .unwrap()
                .push((old.is_leader, new.is_leader));
        }));

        service.set_config(Config {
            is_leader: false,
            ..Config::default()
        });

        assert_eq!(*seen.lock().unwrap(), vec![(true, false)]);
        assert!(!service.config().is_leader);
    }

    #[test]
    fn test_removed_listener_is_not_called() {
        let service = LiveConfigService::new(Config::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let id = service.add_config_listener(Box::new(move |_, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));
        service.set_config(Config::default());
        service.remove_config_listener(&id);
        service.set_config(Config::default());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reload_reads_file_and_notifies() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[jobs]\nrun_jobs = true\n").unwrap();

        let cli = CliConfig {
            is_leader: true,
            run_jobs: true,
            run_scheduler: true,
            ..Default::default()
        };
        let initial = Config::resolve(&cli, &FileConfig::load(&path).unwrap()).unwrap();
        let service = LiveConfigService::with_file(initial, cli, path.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        service.add_config_listener(Box::new(move |_, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        service.reload().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        std::fs::write(&path, "[jobs]\nrun_jobs = false\n").unwrap();
        service.reload().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!service.config().jobs.run_jobs);
    }

    #[test]
    fn test_reload_without_file_fails() {
        let service = LiveConfigService::new(Config::default());
        assert!(service.reload().is_err());
    }
}
