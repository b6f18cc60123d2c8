use crate::errors::{QueryError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const ALERT_FIELDS: &[&str] = &[
    "OrganizationId",
    "DeviceId",
    "UserId",
    "Timestamp",
    "TimestampTz",
    "Ward",
    "ParameterKey",
    "ParameterValue",
    "LowerThreshold",
    "UpperThreshold",
    "Bound",
    "SmartAlertId",
    "Source",
    "Stage",
    "Status",
    "_id.UserId",
    "_id.Timestamp",
    "_id.Source",
];

const DEVICE_LOG_FIELDS: &[&str] = &[
    "OrganizationId",
    "DeviceId",
    "UserId",
    "TagId",
    "Timestamp",
    "Date",
    "Hour",
    "Month",
    "Year",
    "Index",
    "AppName",
    "LogLevel",
    "LogLabel",
    "LogSummary",
    "CreatedAt",
    "LogData.DeviceName",
    "LogData.DeviceType",
    "LogData.Model",
    "LogData.LoggedEvent",
    "LogData.MessageType",
    "LogData.State",
    "LogData.StateCode",
    "LogData.Tag",
    "LogData.Description",
    "LogData.Ward",
    "LogData.EpochCount",
    "LogData.ExecutionDuration",
    "LogData.Timezone",
    "LogData.RequestId",
    "LogData.TagDetail.AlertCode",
    "LogData.TagDetail.AlertLevel",
    "LogData.TagDetail.HeaderTime",
    "LogData.TagDetail.Key",
    "LogData.TagDetail.Message",
    "LogData.TagDetail.RequestId",
];

/// Canonical field paths of one collection plus every alias the intent
/// oracle is known to emit for them.
///
/// Immutable once built; share it behind an `Arc`.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaDescriptor {
    name: String,
    collection: String,
    fields: Vec<String>,
    aliases: BTreeMap<String, String>,
    compound_keys: Vec<String>,
    time_field: Option<String>,
}

impl SchemaDescriptor {
    pub fn builder(name: impl Into<String>, collection: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            collection: collection.into(),
            fields: Vec::new(),
            aliases: Vec::new(),
            compound_keys: Vec::new(),
            time_field: None,
            leaf_aliases: false,
        }
    }

    /// Patient alerts. Documents are keyed by a compound `_id`
    /// of `{UserId, Timestamp, Source}`.
    pub fn alerts() -> Result<Self> {
        Self::builder("alerts", "Alerts")
            .fields(ALERT_FIELDS.iter().copied())
            .alias("IdUserId", "_id.UserId")
            .alias("IdTimestamp", "_id.Timestamp")
            .alias("IdSource", "_id.Source")
            // the oracle sometimes addresses the organisation through _id
            .alias("_id.$oid", "OrganizationId")
            .alias("_id.$OrganizationId", "OrganizationId")
            .compound_key("_id")
            .time_field("Timestamp")
            .build()
    }

    /// Device logs. Nested `LogData.*` leaves are also accepted by their
    /// flat names.
    pub fn device_logs() -> Result<Self> {
        Self::builder("device_logs", "device_logs")
            .fields(DEVICE_LOG_FIELDS.iter().copied())
            .with_leaf_aliases()
            .time_field("Timestamp")
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }

    pub fn compound_keys(&self) -> &[String] {
        &self.compound_keys
    }

    pub fn time_field(&self) -> Option<&str> {
        self.time_field.as_deref()
    }

    pub fn is_canonical(&self, path: &str) -> bool {
        self.fields.iter().any(|f| f == path)
    }

    /// Resolves a field name to its canonical path. Unknown names come back
    /// unchanged.
    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        match self.aliases.get(name) {
            Some(path) => path.as_str(),
            None => name,
        }
    }

    /// Splits `"<compound>.<subfield>"` when `<compound>` is one of this
    /// collection's compound keys.
    pub fn compound_parent<'a>(&self, key: &'a str) -> Option<(&'a str, &'a str)> {
        let (parent, sub) = key.split_once('.')?;
        if sub.is_empty() || !self.compound_keys.iter().any(|k| k == parent) {
            return None;
        }
        Some((parent, sub))
    }
}

pub struct SchemaBuilder {
    name: String,
    collection: String,
    fields: Vec<String>,
    aliases: Vec<(String, String)>,
    compound_keys: Vec<String>,
    time_field: Option<String>,
    leaf_aliases: bool,
}

impl SchemaBuilder {
    pub fn field(mut self, path: impl Into<String>) -> Self {
        self.fields.push(path.into());
        self
    }

    pub fn fields<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn alias(mut self, alias: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.aliases.push((alias.into(), canonical.into()));
        self
    }

    pub fn compound_key(mut self, key: impl Into<String>) -> Self {
        self.compound_keys.push(key.into());
        self
    }

    pub fn time_field(mut self, path: impl Into<String>) -> Self {
        self.time_field = Some(path.into());
        self
    }

    /// Derive a flat alias for every nested leaf whose last segment is not
    /// already taken. First path wins on collisions.
    pub fn with_leaf_aliases(mut self) -> Self {
        self.leaf_aliases = true;
        self
    }

    pub fn build(self) -> Result<SchemaDescriptor> {
        let mut seen = BTreeSet::new();
        for f in &self.fields {
            if f.is_empty() {
                return Err(QueryError::Schema(format!("{}: empty field path", self.name)));
            }
            if !seen.insert(f.as_str()) {
                return Err(QueryError::Schema(format!("{}: duplicate field {}", self.name, f)));
            }
        }

        let mut aliases: BTreeMap<String, String> = BTreeMap::new();
        if self.leaf_aliases {
            for path in self.fields.iter().filter(|f| f.contains('.')) {
                let leaf = path.rsplit('.').next().unwrap_or(path);
                if seen.contains(leaf) || aliases.contains_key(leaf) {
                    continue;
                }
                aliases.insert(leaf.to_string(), path.clone());
            }
        }
        for (alias, canonical) in self.aliases {
            if !seen.contains(canonical.as_str()) {
                return Err(QueryError::Schema(format!(
                    "{}: alias {} targets unknown path {}",
                    self.name, alias, canonical
                )));
            }
            if seen.contains(alias.as_str()) && alias != canonical {
                return Err(QueryError::Schema(format!(
                    "{}: alias {} shadows a canonical path",
                    self.name, alias
                )));
            }
            if let Some(prev) = aliases.get(&alias) {
                if prev != &canonical {
                    return Err(QueryError::Schema(format!(
                        "{}: alias {} maps to both {} and {}",
                        self.name, alias, prev, canonical
                    )));
                }
            }
            aliases.insert(alias, canonical);
        }
        // identity entries keep the alias table total over canonical paths
        for f in &self.fields {
            aliases.entry(f.clone()).or_insert_with(|| f.clone());
        }

        if let Some(t) = &self.time_field {
            if !seen.contains(t.as_str()) {
                return Err(QueryError::Schema(format!(
                    "{}: time field {} is not a schema path",
                    self.name, t
                )));
            }
        }

        Ok(SchemaDescriptor {
            name: self.name,
            collection: self.collection,
            fields: self.fields,
            aliases,
            compound_keys: self.compound_keys,
            time_field: self.time_field,
        })
    }
}

/// Process-wide set of descriptors, looked up by name or collection.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: Vec<Arc<SchemaDescriptor>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Result<Self> {
        let mut reg = Self::new();
        reg.insert(SchemaDescriptor::alerts()?);
        reg.insert(SchemaDescriptor::device_logs()?);
        Ok(reg)
    }

    pub fn insert(&mut self, schema: SchemaDescriptor) {
        self.schemas.retain(|s| s.name() != schema.name());
        self.schemas.push(Arc::new(schema));
    }

    pub fn get(&self, name: &str) -> Option<Arc<SchemaDescriptor>> {
        self.schemas
            .iter()
            .find(|s| s.name().eq_ignore_ascii_case(name) || s.collection().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SchemaDescriptor>> {
        self.schemas.iter()
    }
}
