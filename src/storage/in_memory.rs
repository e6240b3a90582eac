use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Query, Record, Repository};
use crate::{Error, Result};

/// Process local repository.
pub struct InMemoryRepository<R: Record> {
    records: RwLock<HashMap<String, R>>,
}

impl<R: Record> Default for InMemoryRepository<R> {
    fn default() -> Self {
        InMemoryRepository {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<R: Record> InMemoryRepository<R> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<R: Record> Repository<R> for InMemoryRepository<R> {
    async fn save(&self, record: &R) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(record.id()) {
            return Err(Error::RecordExists {
                record_type: R::TYPE,
                id: record.id().to_string(),
            });
        }
        records.insert(record.id().to_string(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &mut R) -> Result<()> {
        let mut records = self.records.write().await;
        let stored = records
            .get(record.id())
            .ok_or_else(|| Error::not_found(R::TYPE, format!("id={}", record.id())))?;
        if stored.version() != record.version() {
            return Err(Error::StaleRecord {
                record_type: R::TYPE,
                id: record.id().to_string(),
                expected: record.version(),
                stored: stored.version(),
            });
        }
        record.set_version(record.version() + 1);
        records.insert(record.id().to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(R::TYPE, format!("id={}", id)))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<R>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn find_by_query(&self, query: &Query) -> Result<Vec<R>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| query.matches(*r))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Note {
        id: String,
        thread: String,
        text: String,
        version: u64,
    }

    impl Record for Note {
        const TYPE: &'static str = "Note";
        fn id(&self) -> &str {
            &self.id
        }
        fn version(&self) -> u64 {
            self.version
        }
        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
        fn thread_id(&self) -> Option<&str> {
            Some(&self.thread)
        }
    }

    fn note(id: &str, thread: &str) -> Note {
        Note {
            id: id.into(),
            thread: thread.into(),
            text: String::new(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn update_is_visible_to_find() -> Result<()> {
        // Arrange
        let repo: InMemoryRepository<Note> = InMemoryRepository::new();
        let mut record = note("1", "t");
        repo.save(&record).await?;
        // Act
        record.text = "changed".into();
        repo.update(&mut record).await?;
        // Assert
        let stored = repo.get_by_id("1").await?;
        assert_eq!(stored.text, "changed");
        assert_eq!(stored.version, 1);
        assert_eq!(record.version, 1);
        Ok(())
    }

    #[tokio::test]
    async fn stale_write_is_rejected() -> Result<()> {
        let repo: InMemoryRepository<Note> = InMemoryRepository::new();
        repo.save(&note("1", "t")).await?;
        let mut first = repo.get_by_id("1").await?;
        let mut second = repo.get_by_id("1").await?;
        first.text = "first".into();
        repo.update(&mut first).await?;
        second.text = "second".into();
        let result = repo.update(&mut second).await;
        assert!(matches!(result, Err(Error::StaleRecord { stored: 1, .. })));
        assert_eq!(repo.get_by_id("1").await?.text, "first");
        Ok(())
    }

    #[tokio::test]
    async fn single_query_detects_duplicates() -> Result<()> {
        let repo: InMemoryRepository<Note> = InMemoryRepository::new();
        repo.save(&note("1", "t")).await?;
        repo.save(&note("2", "t")).await?;
        repo.save(&note("3", "other")).await?;
        assert_eq!(
            repo.get_single_by_query(&Query::thread("other")).await?.id,
            "3"
        );
        assert!(matches!(
            repo.get_single_by_query(&Query::thread("t")).await,
            Err(Error::RecordDuplicate { .. })
        ));
        assert!(matches!(
            repo.get_single_by_query(&Query::thread("none")).await,
            Err(Error::RecordNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() -> Result<()> {
        let repo: InMemoryRepository<Note> = InMemoryRepository::new();
        repo.save(&note("1", "t")).await?;
        assert!(repo.save(&note("1", "t")).await.is_err());
        Ok(())
    }
}
