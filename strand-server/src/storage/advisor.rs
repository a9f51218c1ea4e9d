//! Per-domain secondary index management.
//!
//! The advisor derives the wanted indexes of every storage domain from the
//! schema (attribute index hints plus class-level index configuration) and
//! from [`DomainIndexConfiguration`] overrides, then reconciles them with
//! what the store has:
//!
//! ```text
//! schema ──► desired(domain) ─┐
//! overrides ──────────────────┼──► check_domain ──► create_index / drop_index
//! list_indexes(domain) ───────┘
//! ```
//!
//! Indexes are only created once a domain holds at least
//! [`INDEX_DOCUMENT_THRESHOLD`] documents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use strand_core::{Domain, FieldIndex, IndexKey, IndexKind, IndexSpec, SchemaDescriptor};

use super::StoreError;

pub const INDEX_DOCUMENT_THRESHOLD: usize = 50;

/// Name of the primary key index. Never dropped.
pub const PRIMARY_INDEX: &str = "_id_";

const UNINDEXED_DOMAINS: &[&str] = &["model", "benchmark"];

/// Overrides for one domain.
///
/// ```toml
/// [[indexes]]
/// domain = "tracker"
/// indexes = ["assignee"]
/// disabled = [{ keys = [{ field = "rank", order = -1 }] }]
/// skip = ["legacy"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainIndexConfiguration {
    pub domain: Domain,
    /// Indexes wanted in addition to the schema-derived ones.
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    /// Key sets that must never be created.
    #[serde(default)]
    pub disabled: Vec<IndexSpec>,
    /// The domain needs no collection at all.
    #[serde(default)]
    pub disable_collection: bool,
    /// Existing indexes whose name contains one of these are left alone.
    #[serde(default)]
    pub skip: Vec<String>,
}

impl DomainIndexConfiguration {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: Domain::new(domain),
            indexes: Vec::new(),
            disabled: Vec::new(),
            disable_collection: false,
            skip: Vec::new(),
        }
    }

    fn is_disabled(&self, spec: &IndexSpec) -> bool {
        let keys = spec.keys();
        self.disabled.iter().any(|d| d.keys() == keys)
    }

    fn is_skipped(&self, name: &str) -> bool {
        self.skip.iter().any(|s| name.contains(s.as_str()))
    }
}

/// An index as reported by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    #[serde(flatten)]
    pub index: FieldIndex,
}

impl IndexInfo {
    pub fn primary() -> Self {
        Self {
            name: PRIMARY_INDEX.to_string(),
            index: FieldIndex::single(IndexKey::asc("_id")),
        }
    }
}

/// Collection and index primitives of a store.
#[async_trait]
pub trait DomainOperations: Send + Sync {
    async fn exists(&self, domain: &Domain) -> Result<bool, StoreError>;

    async fn create(&self, domain: &Domain) -> Result<(), StoreError>;

    /// Whether the domain holds at least `count` documents.
    async fn has_documents(&self, domain: &Domain, count: usize) -> Result<bool, StoreError>;

    async fn list_indexes(&self, domain: &Domain) -> Result<Vec<IndexInfo>, StoreError>;

    async fn create_index(&self, domain: &Domain, index: &IndexSpec, name: &str)
        -> Result<(), StoreError>;

    async fn drop_index(&self, domain: &Domain, name: &str) -> Result<(), StoreError>;
}

/// Canonical index name: `<field><_fi|_sp>_<order>` per key, joined by `_`.
/// A bare field name stands for a sparse ascending index (`<field>_sp_1`).
pub fn index_name(spec: &IndexSpec) -> String {
    match spec {
        IndexSpec::Field(field) => format!("{field}_sp_1"),
        IndexSpec::Keys(index) => {
            let suffix = if index.filter.is_some() {
                "_fi"
            } else if index.sparse {
                "_sp"
            } else {
                ""
            };
            index
                .keys
                .iter()
                .map(|key| format!("{}{suffix}_{}", key.field, i32::from(key.order)))
                .collect::<Vec<_>>()
                .join("_")
        }
    }
}

pub struct DomainIndexAdvisor {
    domains: BTreeMap<Domain, Vec<IndexSpec>>,
    configurations: Vec<DomainIndexConfiguration>,
}

impl DomainIndexAdvisor {
    pub fn new(schema: &dyn SchemaDescriptor, configurations: Vec<DomainIndexConfiguration>) -> Self {
        Self {
            domains: desired_indexes(schema),
            configurations,
        }
    }

    /// Recompute the desired indexes after a schema change.
    pub fn rebuild(&mut self, schema: &dyn SchemaDescriptor) {
        self.domains = desired_indexes(schema);
        log::debug!("Index advisor rebuilt for {} domains", self.domains.len());
    }

    pub fn domains(&self) -> impl Iterator<Item = &Domain> {
        self.domains.keys()
    }

    pub fn desired(&self, domain: &Domain) -> &[IndexSpec] {
        self.domains.get(domain).map(Vec::as_slice).unwrap_or_default()
    }

    fn configuration(&self, domain: &Domain) -> Option<&DomainIndexConfiguration> {
        self.configurations.iter().find(|c| &c.domain == domain)
    }

    /// Bring the indexes of `domain` in line with the desired set.
    ///
    /// Returns `false` when the domain needs no collection: it is disabled,
    /// it is empty and `force_create` is off, or it does not exist and
    /// `force_create` is off. Failures on individual indexes are logged and
    /// do not stop the check.
    pub async fn check_domain(
        &self,
        domain: &Domain,
        force_create: bool,
        ops: &dyn DomainOperations,
    ) -> Result<bool, StoreError> {
        let config = self.configuration(domain);

        let mut exists = ops.exists(domain).await?;
        let has_documents = exists && ops.has_documents(domain, 1).await?;
        let disabled = config.is_some_and(|c| c.disable_collection);
        if exists && (disabled || (!has_documents && !force_create)) {
            return Ok(false);
        }

        if force_create && !exists {
            ops.create(domain).await?;
            log::info!("Collection {domain} created");
            exists = true;
        }
        if !exists {
            return Ok(false);
        }

        let has_enough = match ops.has_documents(domain, INDEX_DOCUMENT_THRESHOLD).await {
            Ok(v) => v,
            Err(e) => {
                log::error!("Failed to count documents of {domain}: {e}");
                return Ok(true);
            }
        };
        let mut stale: Vec<IndexInfo> = match ops.list_indexes(domain).await {
            Ok(indexes) => indexes.into_iter().filter(|i| i.name != PRIMARY_INDEX).collect(),
            Err(e) => {
                log::error!("Failed to list indexes of {domain}: {e}");
                return Ok(true);
            }
        };
        log::debug!("Checking indexes of {domain} (enough documents: {has_enough})");

        let mut created = Vec::new();
        if has_enough {
            let extra = config.map(|c| c.indexes.as_slice()).unwrap_or_default();
            let mut added = HashSet::new();
            for spec in self.desired(domain).iter().chain(extra) {
                if config.is_some_and(|c| c.is_disabled(spec)) {
                    continue;
                }
                let name = index_name(spec);
                if !added.insert(name.clone()) {
                    continue;
                }
                if let Some(pos) = stale.iter().position(|i| i.name == name) {
                    stale.remove(pos);
                    continue;
                }
                match ops.create_index(domain, spec, &name).await {
                    Ok(()) => created.push(name),
                    Err(e) => log::error!("Failed to create index {name} on {domain}: {e}"),
                }
            }
        }

        // Below the document threshold nothing was matched above, so every
        // secondary index not named in `skip` is dropped, including ones the
        // schema asks for.
        for index in stale {
            if config.is_some_and(|c| c.is_skipped(&index.name)) {
                continue;
            }
            log::info!("Dropping index {} from {domain}", index.name);
            if let Err(e) = ops.drop_index(domain, &index.name).await {
                log::error!("Failed to drop index {} from {domain}: {e}", index.name);
            }
        }

        if !created.is_empty() {
            log::info!("Created indexes on {domain}: {}", created.join(", "));
        }
        Ok(true)
    }
}

fn desired_indexes(schema: &dyn SchemaDescriptor) -> BTreeMap<Domain, Vec<IndexSpec>> {
    let mut domains: BTreeMap<Domain, Vec<IndexSpec>> = BTreeMap::new();
    for def in schema.classes() {
        let Some(domain) = schema.domain_of(&def.id) else {
            continue;
        };
        if UNINDEXED_DOMAINS.contains(&domain.as_str()) {
            continue;
        }
        let specs = domains.entry(domain).or_default();
        for attr in schema.all_attributes(&def.id) {
            let key = match attr.index {
                Some(IndexKind::Indexed) => IndexKey::asc(attr.name),
                Some(IndexKind::IndexedDsc) => IndexKey::desc(attr.name),
                Some(IndexKind::FullText) | None => continue,
            };
            specs.push(IndexSpec::Keys(FieldIndex::single(key)));
        }
        // Class-level shorthand is a plain ascending index, unlike the
        // sparse shorthand of domain overrides.
        for spec in schema.index_configuration(&def.id) {
            specs.push(match spec {
                IndexSpec::Field(field) => IndexSpec::Keys(FieldIndex::single(IndexKey::asc(field))),
                keys => keys,
            });
        }
    }
    domains
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use strand_core::{AttributeDef, ClassDef, ClassId, Hierarchy, TypeKind};

    const ISSUE: ClassId = ClassId::from_static("tracker:class:Issue");

    fn schema() -> Hierarchy {
        let mut h = Hierarchy::platform();
        h.add(
            ClassDef::new(ISSUE)
                .extends(strand_core::class::DOC)
                .domain("tracker")
                .attribute(AttributeDef::new("title", TypeKind::String).indexed(IndexKind::FullText))
                .attribute(AttributeDef::new("status", TypeKind::Ref).indexed(IndexKind::Indexed))
                .attribute(AttributeDef::new("rank", TypeKind::String).indexed(IndexKind::IndexedDsc))
                .index(IndexSpec::Field("space".into()))
                .index(IndexSpec::Keys(FieldIndex {
                    keys: vec![IndexKey::asc("space"), IndexKey::desc("modifiedOn")],
                    sparse: true,
                    filter: None,
                })),
        );
        h
    }

    fn tracker_config() -> DomainIndexConfiguration {
        let mut config = DomainIndexConfiguration::new("tracker");
        config.indexes.push(IndexSpec::Field("assignee".into()));
        config.disabled.push(IndexSpec::Keys(FieldIndex::single(IndexKey::desc("rank"))));
        config.skip.push("keep".into());
        config
    }

    fn info(name: &str) -> IndexInfo {
        IndexInfo {
            name: name.to_string(),
            index: FieldIndex::single(IndexKey::asc(name)),
        }
    }

    #[derive(Default)]
    struct FakeOps {
        exists: Mutex<bool>,
        documents: usize,
        indexes: Mutex<Vec<IndexInfo>>,
        created: Mutex<Vec<String>>,
        dropped: Mutex<Vec<String>>,
        failing: Vec<String>,
    }

    impl FakeOps {
        fn with(documents: usize, indexes: &[&str]) -> Self {
            let mut all = vec![IndexInfo::primary()];
            all.extend(indexes.iter().map(|n| info(n)));
            Self {
                exists: Mutex::new(true),
                documents,
                indexes: Mutex::new(all),
                ..Self::default()
            }
        }

        fn created(&self) -> Vec<String> {
            self.created.lock().unwrap().clone()
        }

        fn dropped(&self) -> Vec<String> {
            self.dropped.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DomainOperations for FakeOps {
        async fn exists(&self, _domain: &Domain) -> Result<bool, StoreError> {
            Ok(*self.exists.lock().unwrap())
        }

        async fn create(&self, _domain: &Domain) -> Result<(), StoreError> {
            *self.exists.lock().unwrap() = true;
            Ok(())
        }

        async fn has_documents(&self, _domain: &Domain, count: usize) -> Result<bool, StoreError> {
            Ok(self.documents >= count)
        }

        async fn list_indexes(&self, _domain: &Domain) -> Result<Vec<IndexInfo>, StoreError> {
            Ok(self.indexes.lock().unwrap().clone())
        }

        async fn create_index(&self, _domain: &Domain, _index: &IndexSpec, name: &str) -> Result<(), StoreError> {
            if self.failing.iter().any(|f| f == name) {
                return Err(StoreError::Invalid(format!("cannot build {name}")));
            }
            self.created.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn drop_index(&self, _domain: &Domain, name: &str) -> Result<(), StoreError> {
            self.dropped.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_index_names() {
        assert_eq!(index_name(&IndexSpec::Field("space".into())), "space_sp_1");
        assert_eq!(
            index_name(&IndexSpec::Keys(FieldIndex::single(IndexKey::desc("rank")))),
            "rank_-1"
        );
        let compound = FieldIndex {
            keys: vec![IndexKey::asc("space"), IndexKey::desc("modifiedOn")],
            sparse: true,
            filter: None,
        };
        assert_eq!(
            index_name(&IndexSpec::Keys(compound.clone())),
            "space_sp_1_modifiedOn_sp_-1"
        );
        let filtered = FieldIndex {
            filter: Some(json!({ "archived": false })),
            ..compound
        };
        assert_eq!(index_name(&IndexSpec::Keys(filtered)), "space_fi_1_modifiedOn_fi_-1");
    }

    #[test]
    fn test_desired_indexes_from_schema() {
        let advisor = DomainIndexAdvisor::new(&schema(), Vec::new());
        let names: Vec<String> = advisor
            .desired(&Domain::new("tracker"))
            .iter()
            .map(index_name)
            .collect();
        assert_eq!(
            names,
            vec!["status_1", "rank_-1", "space_1", "space_sp_1_modifiedOn_sp_-1"]
        );

        let domains: Vec<&str> = advisor.domains().map(Domain::as_str).collect();
        assert!(!domains.contains(&"model"));
        assert!(domains.contains(&"contact"));
        assert!(advisor.desired(&Domain::new("space")).is_empty());
        assert!(advisor
            .desired(&Domain::new("contact"))
            .iter()
            .any(|s| index_name(s) == "person_1"));
    }

    #[tokio::test]
    async fn test_small_domain_gets_no_new_indexes() {
        let advisor = DomainIndexAdvisor::new(&schema(), vec![tracker_config()]);
        let ops = FakeOps::with(10, &["old_1", "keep_me_1"]);

        assert!(advisor.check_domain(&Domain::new("tracker"), false, &ops).await.unwrap());
        assert!(ops.created().is_empty());
        assert_eq!(ops.dropped(), vec!["old_1"]);
    }

    #[tokio::test]
    async fn test_small_domain_drops_schema_indexes() {
        let advisor = DomainIndexAdvisor::new(&schema(), vec![tracker_config()]);
        let ops = FakeOps::with(INDEX_DOCUMENT_THRESHOLD - 1, &["status_1", "space_1"]);

        assert!(advisor.check_domain(&Domain::new("tracker"), false, &ops).await.unwrap());
        assert!(ops.created().is_empty());
        assert_eq!(ops.dropped(), vec!["status_1", "space_1"]);
    }

    #[tokio::test]
    async fn test_large_domain_reconciles_indexes() {
        let advisor = DomainIndexAdvisor::new(&schema(), vec![tracker_config()]);
        let ops = FakeOps::with(60, &["status_1", "old_1", "keep_me_1"]);

        assert!(advisor.check_domain(&Domain::new("tracker"), false, &ops).await.unwrap());
        assert_eq!(
            ops.created(),
            vec!["space_1", "space_sp_1_modifiedOn_sp_-1", "assignee_sp_1"]
        );
        assert_eq!(ops.dropped(), vec!["old_1"]);
    }

    #[tokio::test]
    async fn test_index_failure_does_not_stop_others() {
        let advisor = DomainIndexAdvisor::new(&schema(), Vec::new());
        let ops = FakeOps {
            failing: vec!["status_1".into()],
            ..FakeOps::with(60, &[])
        };

        assert!(advisor.check_domain(&Domain::new("tracker"), false, &ops).await.unwrap());
        assert_eq!(ops.created(), vec!["rank_-1", "space_1", "space_sp_1_modifiedOn_sp_-1"]);
    }

    #[tokio::test]
    async fn test_collection_existence_rules() {
        let advisor = DomainIndexAdvisor::new(&schema(), Vec::new());
        let tracker = Domain::new("tracker");

        let missing = FakeOps::default();
        assert!(!advisor.check_domain(&tracker, false, &missing).await.unwrap());
        assert!(!*missing.exists.lock().unwrap());

        assert!(advisor.check_domain(&tracker, true, &missing).await.unwrap());
        assert!(*missing.exists.lock().unwrap());

        let empty = FakeOps::with(0, &["old_1"]);
        assert!(!advisor.check_domain(&tracker, false, &empty).await.unwrap());
        assert!(empty.dropped().is_empty());
        assert!(advisor.check_domain(&tracker, true, &empty).await.unwrap());

        let mut disabled = DomainIndexConfiguration::new("tracker");
        disabled.disable_collection = true;
        let advisor = DomainIndexAdvisor::new(&schema(), vec![disabled]);
        let full = FakeOps::with(60, &[]);
        assert!(!advisor.check_domain(&tracker, true, &full).await.unwrap());
        assert!(full.created().is_empty());
    }

    #[test]
    fn test_rebuild_follows_schema() {
        let mut advisor = DomainIndexAdvisor::new(&Hierarchy::platform(), Vec::new());
        assert!(advisor.desired(&Domain::new("tracker")).is_empty());
        advisor.rebuild(&schema());
        assert_eq!(advisor.desired(&Domain::new("tracker")).len(), 4);
    }

    #[test]
    fn test_configuration_from_toml() {
        let config: DomainIndexConfiguration = toml::from_str(
            r#"
            domain = "tracker"
            indexes = ["assignee"]
            disabled = [{ keys = [{ field = "rank", order = -1 }] }]
            skip = ["legacy"]
            "#,
        )
        .unwrap();
        assert_eq!(config.indexes, vec![IndexSpec::Field("assignee".into())]);
        assert!(config.is_disabled(&IndexSpec::Keys(FieldIndex::single(IndexKey::desc("rank")))));
        assert!(config.is_skipped("legacy_status_1"));
        assert!(!config.disable_collection);
    }
}
