//! Processor registry
//!
//! Maps the `type` tag of a configured processor to a constructor. Each
//! constructor deserializes its own typed settings from the remaining keys
//! of the entry, so a bad setting is reported against the processor that
//! owns it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::platform_connector::{self, PLATFORM_CONNECTOR};
use super::EventProcessor;
use crate::categorization::CategorizationTables;
use crate::error::ConfigError;
use crate::metrics::MetricsRegistry;

/// One configured processor: a type tag plus its settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSpec {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl ProcessorSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            settings: serde_json::Map::new(),
        }
    }

    /// Add a setting
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.settings.insert(key.to_string(), value.into());
        self
    }
}

/// Everything a constructor may need besides its own settings
#[derive(Clone)]
pub struct ProcessorContext {
    pub node_name: String,
    pub tables: Arc<CategorizationTables>,
    pub shutdown: CancellationToken,
    pub metrics: MetricsRegistry,
    /// State file used by processors that do not configure their own
    pub default_state_file: PathBuf,
}

impl ProcessorContext {
    /// Default state file for a processor instance.
    ///
    /// The default-named instance uses `default_state_file` itself; other
    /// instances get `<stem>-<name>.<ext>` next to it.
    pub fn state_file_for(&self, processor_name: &str) -> PathBuf {
        if processor_name == PLATFORM_CONNECTOR {
            return self.default_state_file.clone();
        }

        let stem = self
            .default_state_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let file_name = match self.default_state_file.extension() {
            Some(ext) => format!("{}-{}.{}", stem, processor_name, ext.to_string_lossy()),
            None => format!("{}-{}", stem, processor_name),
        };
        self.default_state_file.with_file_name(file_name)
    }
}

/// Builds a processor from its settings
pub type Constructor = for<'a> fn(
    &'a ProcessorContext,
    serde_json::Value,
) -> BoxFuture<'a, Result<Arc<dyn EventProcessor>, ConfigError>>;

/// Type tag → constructor
pub struct ProcessorRegistry {
    constructors: HashMap<String, Constructor>,
}

impl ProcessorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the built-in processor types
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(PLATFORM_CONNECTOR, platform_connector::construct);
        // Class name used by older configuration files
        registry.register("PlatformConnectorEventProcessor", platform_connector::construct);
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, constructor: Constructor) {
        self.constructors.insert(kind.into(), constructor);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Build one processor
    pub async fn build(
        &self,
        ctx: &ProcessorContext,
        spec: &ProcessorSpec,
    ) -> Result<Arc<dyn EventProcessor>, ConfigError> {
        let constructor = self
            .constructors
            .get(&spec.kind)
            .ok_or_else(|| ConfigError::UnknownProcessor(spec.kind.clone()))?;

        let processor = constructor(ctx, serde_json::Value::Object(spec.settings.clone())).await?;
        info!(kind = %spec.kind, name = %processor.name(), "Event processor enabled");
        Ok(processor)
    }

    /// Build every configured processor; names must be unique
    pub async fn build_all(
        &self,
        ctx: &ProcessorContext,
        specs: &[ProcessorSpec],
    ) -> Result<Vec<Arc<dyn EventProcessor>>, ConfigError> {
        if specs.is_empty() {
            return Err(ConfigError::invalid(
                "processors",
                "at least one event processor must be enabled",
            ));
        }

        // Reject unknown tags before any state file is opened
        if let Some(unknown) = specs.iter().find(|s| !self.contains(&s.kind)) {
            return Err(ConfigError::UnknownProcessor(unknown.kind.clone()));
        }

        let mut names = HashSet::new();
        let mut processors = Vec::with_capacity(specs.len());
        for spec in specs {
            let processor = self.build(ctx, spec).await?;
            if !names.insert(processor.name().to_string()) {
                return Err(ConfigError::invalid(
                    "processors",
                    format!("duplicate processor name {:?}", processor.name()),
                ));
            }
            processors.push(processor);
        }
        Ok(processors)
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categorization::{ErrorMappingTable, SeverityClassMap};
    use std::path::Path;

    fn context(dir: &Path) -> ProcessorContext {
        let errors = ErrorMappingTable::parse("79,Reset GPU,Xid79\n", Path::new("<inline>")).unwrap();
        let severity = SeverityClassMap::new(HashMap::new(), "NonFatal").unwrap();
        ProcessorContext {
            node_name: "node-a".to_string(),
            tables: Arc::new(CategorizationTables::new(errors, severity)),
            shutdown: CancellationToken::new(),
            metrics: MetricsRegistry::new(),
            default_state_file: dir.join("state.json"),
        }
    }

    #[test]
    fn test_spec_from_yaml_shape() {
        let spec: ProcessorSpec = serde_json::from_value(serde_json::json!({
            "type": "platform_connector",
            "socket_path": "/tmp/c.sock",
            "ongoing": "emit",
        }))
        .unwrap();
        assert_eq!(spec.kind, "platform_connector");
        assert_eq!(spec.settings["socket_path"], "/tmp/c.sock");
        assert!(!spec.settings.contains_key("type"));
    }

    #[test]
    fn test_state_file_for() {
        let ctx = context(Path::new("/var/run/ghm"));
        assert_eq!(ctx.state_file_for(PLATFORM_CONNECTOR), Path::new("/var/run/ghm/state.json"));
        assert_eq!(ctx.state_file_for("audit"), Path::new("/var/run/ghm/state-audit.json"));
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let registry = ProcessorRegistry::with_builtin();

        let specs = vec![ProcessorSpec::new(PLATFORM_CONNECTOR), ProcessorSpec::new("syslog")];
        match registry.build_all(&ctx, &specs).await {
            Err(ConfigError::UnknownProcessor(kind)) => assert_eq!(kind, "syslog"),
            other => panic!("unexpected result: {:?}", other.map(|p| p.len())),
        }
        // No state file was opened for the valid entry
        assert!(!dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn test_empty_list_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let err = ProcessorRegistry::with_builtin()
            .build_all(&ctx, &[])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InvalidSetting { .. }));
    }

    #[tokio::test]
    async fn test_malformed_settings_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let spec = ProcessorSpec::new(PLATFORM_CONNECTOR).with("max_attempts", "many");

        let err = ProcessorRegistry::with_builtin()
            .build(&ctx, &spec)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InvalidSetting { .. }));
    }

    #[tokio::test]
    async fn test_builtin_and_alias() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let registry = ProcessorRegistry::with_builtin();

        let specs = vec![
            ProcessorSpec::new(PLATFORM_CONNECTOR),
            ProcessorSpec::new("PlatformConnectorEventProcessor").with("name", "legacy"),
        ];
        let processors = registry.build_all(&ctx, &specs).await.unwrap();
        let names: Vec<&str> = processors.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec![PLATFORM_CONNECTOR, "legacy"]);
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let specs = vec![
            ProcessorSpec::new(PLATFORM_CONNECTOR),
            ProcessorSpec::new(PLATFORM_CONNECTOR),
        ];
        assert!(ProcessorRegistry::with_builtin()
            .build_all(&ctx, &specs)
            .await
            .is_err());
    }
}
