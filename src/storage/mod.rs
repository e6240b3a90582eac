//! Record persistence capability.
//!
//! Every exchange record type has its own [`Repository`]. The only guarantees
//! relied upon are read-your-writes within the process and an optimistic
//! version check on [`Repository::update`].
mod in_memory;

pub use in_memory::InMemoryRepository;

use std::{collections::HashMap, fmt};

use async_trait::async_trait;

use crate::{Error, Result};

/// A persisted record.
pub trait Record: Clone + Send + Sync + 'static {
    /// Record type name, used in errors and logs.
    const TYPE: &'static str;

    fn id(&self) -> &str;

    /// Version the record had when it was loaded. Bumped by every update.
    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);

    fn thread_id(&self) -> Option<&str> {
        None
    }

    fn connection_id(&self) -> Option<&str> {
        None
    }

    /// Additional searchable values.
    fn tags(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// Conjunction of equality predicates. An empty query matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub thread_id: Option<String>,
    pub connection_id: Option<String>,
    pub tags: HashMap<String, String>,
}

impl Query {
    pub fn thread(thread_id: &str) -> Self {
        Query {
            thread_id: Some(thread_id.to_string()),
            ..Default::default()
        }
    }

    pub fn tag(name: &str, value: &str) -> Self {
        Query::default().with_tag(name, value)
    }

    pub fn with_connection(mut self, connection_id: Option<&str>) -> Self {
        self.connection_id = connection_id.map(str::to_string);
        self
    }

    pub fn with_tag(mut self, name: &str, value: &str) -> Self {
        self.tags.insert(name.to_string(), value.to_string());
        self
    }

    pub fn matches<R: Record>(&self, record: &R) -> bool {
        if let Some(thread_id) = &self.thread_id {
            if record.thread_id() != Some(thread_id.as_str()) {
                return false;
            }
        }
        if let Some(connection_id) = &self.connection_id {
            if record.connection_id() != Some(connection_id.as_str()) {
                return false;
            }
        }
        if self.tags.is_empty() {
            return true;
        }
        let tags = record.tags();
        self.tags
            .iter()
            .all(|(name, value)| tags.get(name) == Some(value))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![];
        if let Some(thread_id) = &self.thread_id {
            parts.push(format!("thread_id={}", thread_id));
        }
        if let Some(connection_id) = &self.connection_id {
            parts.push(format!("connection_id={}", connection_id));
        }
        let mut tags: Vec<_> = self.tags.iter().collect();
        tags.sort();
        for (name, value) in tags {
            parts.push(format!("{}={}", name, value));
        }
        if parts.is_empty() {
            f.write_str("any")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

#[async_trait]
pub trait Repository<R: Record>: Send + Sync {
    /// Stores a new record. Fails with `RecordExists` if the id is taken.
    async fn save(&self, record: &R) -> Result<()>;

    /// Replaces the stored record if its version still equals
    /// `record.version()`, then bumps the version of both.
    /// Fails with `StaleRecord` otherwise, leaving storage untouched.
    async fn update(&self, record: &mut R) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<R>>;

    async fn find_by_query(&self, query: &Query) -> Result<Vec<R>>;

    async fn get_by_id(&self, id: &str) -> Result<R> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(R::TYPE, format!("id={}", id)))
    }

    async fn get_all(&self) -> Result<Vec<R>> {
        self.find_by_query(&Query::default()).await
    }

    /// Zero matches is `Ok(None)`, more than one is `RecordDuplicate`.
    async fn find_single_by_query(&self, query: &Query) -> Result<Option<R>> {
        let mut found = self.find_by_query(query).await?;
        if found.len() > 1 {
            return Err(Error::RecordDuplicate {
                record_type: R::TYPE,
                query: query.to_string(),
            });
        }
        Ok(found.pop())
    }

    async fn get_single_by_query(&self, query: &Query) -> Result<R> {
        self.find_single_by_query(query)
            .await?
            .ok_or_else(|| Error::not_found(R::TYPE, query.to_string()))
    }
}
