//! Server configuration file.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9090"
//! storage_path = "/var/lib/strand"
//!
//! [store]
//! sync_writes = true
//!
//! [email]
//! endpoint = "http://mail:8097"
//!
//! [notifications.defaults]
//! "activity:ids:MentionNotification" = ["notification:providers:InboxNotificationProvider"]
//!
//! [[indexes]]
//! domain = "tracker"
//! indexes = ["assignee"]
//!
//! [[classes]]
//! id = "tracker:class:Issue"
//! extends = "core:class:Doc"
//! domain = "tracker"
//! attributes = [{ name = "description", kind = "markup" }]
//! ```
//!
//! Every section is optional.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use strand_activity::{EmailConfig, NotificationSettings, PipelineConfig};
use strand_core::{ClassDef, Hierarchy, SchemaFile};

use crate::error::{ConfigError, ServerError};
use crate::server::{ServerConfig, StrandServer};
use crate::storage::{DomainIndexConfiguration, StoreConfig};
use crate::workspace::WorkspaceSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub email: EmailConfig,
    pub notifications: NotificationSettings,
    pub indexes: Vec<DomainIndexConfiguration>,
    /// Classes added to the platform schema.
    pub classes: Vec<ClassDef>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml(&text)?;
        log::info!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.trigger_partitions == 0 {
            return Err(ConfigError::Invalid("server.trigger_partitions must be at least 1".into()));
        }
        if server.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid("server.broadcast_capacity must be at least 1".into()));
        }
        if server.send_queue_capacity == 0 {
            return Err(ConfigError::Invalid("server.send_queue_capacity must be at least 1".into()));
        }
        if let Some(dup) = self
            .indexes
            .iter()
            .enumerate()
            .find(|(i, c)| self.indexes[..*i].iter().any(|o| o.domain == c.domain))
        {
            return Err(ConfigError::Invalid(format!(
                "index overrides for domain {} given twice",
                dup.1.domain
            )));
        }
        Ok(())
    }

    /// Platform schema extended with the configured classes.
    pub fn schema(&self) -> Hierarchy {
        Hierarchy::from_schema_file(SchemaFile {
            classes: self.classes.clone(),
        })
    }

    pub fn workspace_settings(&self) -> WorkspaceSettings {
        WorkspaceSettings {
            schema: Arc::new(self.schema()),
            indexes: self.indexes.clone(),
            notifications: self.notifications.clone(),
            email: self.email.clone(),
            pipeline: PipelineConfig {
                partitions: self.server.trigger_partitions,
                ..PipelineConfig::default()
            },
            broadcast_capacity: self.server.broadcast_capacity,
            max_sessions: self.server.max_sessions_per_workspace,
            ..WorkspaceSettings::default()
        }
    }

    pub fn into_server(self) -> Result<StrandServer, ServerError> {
        let settings = self.workspace_settings();
        StrandServer::with_store_config(self.server, self.store, settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use strand_activity::{notification_type, provider};
    use strand_core::{ClassId, Domain, SchemaDescriptor};

    const SAMPLE: &str = r#"
        [server]
        bind_addr = "0.0.0.0:7000"
        chunk_limit = 1024

        [store]
        sync_writes = true

        [email]
        endpoint = "http://mail:8097"

        [notifications.defaults]
        "activity:ids:MentionNotification" = ["notification:providers:InboxNotificationProvider"]

        [[indexes]]
        domain = "tracker"
        indexes = ["assignee"]
        skip = ["legacy"]

        [[classes]]
        id = "tracker:class:Issue"
        extends = "core:class:Doc"
        domain = "tracker"
        attributes = [
            { name = "description", kind = "markup" },
            { name = "status", kind = "string", index = "indexed" },
        ]
    "#;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.server.chunk_limit, 32 * 1024);
        assert!(config.email.endpoint.is_none());
        assert_eq!(config.email.timeout_ms, 10_000);
        assert!(config.indexes.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.server.chunk_limit, 1024);
        assert!(config.store.sync_writes);
        assert_eq!(config.email.endpoint.as_deref(), Some("http://mail:8097"));
        assert_eq!(
            config.notifications.defaults[&notification_type::MENTION],
            vec![provider::INBOX]
        );
        assert_eq!(config.indexes[0].domain, Domain::new("tracker"));
        assert_eq!(config.indexes[0].skip, vec!["legacy".to_string()]);

        let schema = config.schema();
        let issue = ClassId::new("tracker:class:Issue");
        assert_eq!(schema.domain_of(&issue), Some(Domain::new("tracker")));
        assert_eq!(schema.content_attributes(&issue).len(), 1);

        let settings = config.workspace_settings();
        assert_eq!(settings.pipeline.partitions, 4);
        assert_eq!(settings.indexes.len(), 1);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            AppConfig::from_toml("[server]\ntrigger_partitions = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            AppConfig::from_toml("[[indexes]]\ndomain = \"a\"\n[[indexes]]\ndomain = \"a\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            AppConfig::from_toml("[server]\nchunk_limit = \"big\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.classes.len(), 1);

        assert!(matches!(
            AppConfig::load("/nonexistent/strand.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
