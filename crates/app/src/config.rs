use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chorus_store::DEFAULT_CHANNEL_NAME;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "chorus";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "chorus.sqlite3";
pub const ENV_PREFIX: &str = "CHORUS_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Signs this address in at startup when set.
    #[serde(default)]
    pub email: Option<String>,
    /// `tracing` filter directives; `RUST_LOG` applies when unset.
    #[serde(default)]
    pub log_filter: Option<String>,
    #[serde(default = "default_channel_name")]
    pub default_channel_name: String,
    /// Domains seeded into the sign-in allow list at startup.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            email: None,
            log_filter: None,
            default_channel_name: default_channel_name(),
            allowed_domains: Vec::new(),
        }
    }
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.database_url = if self.database_url.trim().is_empty() {
            default_database_url()
        } else {
            self.database_url.trim().to_string()
        };
        self.email = self
            .email
            .map(|email| email.trim().to_lowercase())
            .filter(|email| !email.is_empty());
        self.log_filter = self
            .log_filter
            .map(|filter| filter.trim().to_string())
            .filter(|filter| !filter.is_empty());
        self.default_channel_name = if self.default_channel_name.trim().is_empty() {
            default_channel_name()
        } else {
            self.default_channel_name.trim().to_string()
        };

        self.allowed_domains = self
            .allowed_domains
            .into_iter()
            .map(|domain| domain.trim().to_lowercase())
            .filter(|domain| !domain.is_empty())
            .collect();
        self.allowed_domains.sort();
        self.allowed_domains.dedup();

        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".chorus"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Stores the address signed in at startup; `None` forgets it.
    pub fn remember_email(&self, email: Option<String>) -> Result<(), SettingsError> {
        let current = self.settings();
        if current.email == email {
            return Ok(());
        }
        self.update(AppSettings {
            email,
            ..AppSettings::clone(&current)
        })
    }

    fn load_from_disk(path: &Path) -> AppSettings {
        let mut figment = Figment::from(Serialized::defaults(AppSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        let figment = figment.merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_database_url() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME).join(DATABASE_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(".chorus").join(DATABASE_FILE_NAME))
        .display()
        .to_string()
}

fn default_channel_name() -> String {
    DEFAULT_CHANNEL_NAME.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(directory.path().join("settings.json"));
        let settings = store.settings();
        assert_eq!(settings.default_channel_name, DEFAULT_CHANNEL_NAME);
        assert!(settings.database_url.ends_with(DATABASE_FILE_NAME));
        assert_eq!(settings.email, None);
    }

    #[test]
    fn file_values_are_merged_and_normalized() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "database_url": "  /tmp/chat.sqlite3 ",
                "email": " Ada@Example.com ",
                "log_filter": "   ",
                "default_channel_name": "",
                "allowed_domains": ["Example.com", " ", "example.com"]
            }"#,
        )
        .unwrap();

        let settings = SettingsStore::new(path).settings();
        assert_eq!(settings.database_url, "/tmp/chat.sqlite3");
        assert_eq!(settings.email.as_deref(), Some("ada@example.com"));
        assert_eq!(settings.log_filter, None);
        assert_eq!(settings.default_channel_name, DEFAULT_CHANNEL_NAME);
        assert_eq!(settings.allowed_domains, vec!["example.com".to_string()]);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let settings = SettingsStore::new(path).settings();
        assert_eq!(settings.email, None);
        assert_eq!(settings.default_channel_name, DEFAULT_CHANNEL_NAME);
    }

    #[test]
    fn update_persists_and_a_new_store_reads_back() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone());

        store
            .update(AppSettings {
                email: Some("bob@example.com".to_string()),
                default_channel_name: "Scratch".to_string(),
                ..AppSettings::default()
            })
            .unwrap();
        assert!(path.exists());
        assert_eq!(store.settings().default_channel_name, "Scratch");

        let reloaded = SettingsStore::new(path).settings();
        assert_eq!(reloaded.email.as_deref(), Some("bob@example.com"));
        assert_eq!(reloaded.default_channel_name, "Scratch");
    }

    #[test]
    fn remembered_email_survives_restart_until_forgotten() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("settings.json");
        let store = SettingsStore::new(path.clone());

        store
            .remember_email(Some("Ada@Example.com".to_string()))
            .unwrap();
        assert_eq!(store.settings().email.as_deref(), Some("ada@example.com"));
        assert_eq!(
            SettingsStore::new(path.clone()).settings().email.as_deref(),
            Some("ada@example.com")
        );

        store.remember_email(None).unwrap();
        assert_eq!(SettingsStore::new(path).settings().email, None);
    }
}
