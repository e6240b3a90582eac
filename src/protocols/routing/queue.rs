use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use serde_json::Value;
use tokio::sync::RwLock;

/// Packed messages waiting for pickup, per connection.
#[derive(Default, Clone)]
pub struct MessageQueue {
    queues: Arc<RwLock<HashMap<String, VecDeque<Value>>>>,
}

impl MessageQueue {
    pub async fn push(&self, connection_id: &str, message: Value) {
        self.queues
            .write()
            .await
            .entry(connection_id.to_string())
            .or_default()
            .push_back(message);
    }

    /// Removes and returns up to `limit` oldest messages.
    pub async fn take(&self, connection_id: &str, limit: usize) -> Vec<Value> {
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.get_mut(connection_id) else {
            return vec![];
        };
        let count = limit.min(queue.len());
        let taken = queue.drain(..count).collect();
        if queue.is_empty() {
            queues.remove(connection_id);
        }
        taken
    }

    pub async fn len(&self, connection_id: &str) -> usize {
        self.queues
            .read()
            .await
            .get(connection_id)
            .map_or(0, VecDeque::len)
    }

    /// Number of connections with messages waiting.
    pub async fn connections(&self) -> usize {
        self.queues.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn take_is_fifo_and_bounded() {
        let queue = MessageQueue::default();
        for i in 0..3 {
            queue.push("c", json!({ "n": i })).await;
        }
        let first = queue.take("c", 2).await;
        assert_eq!(first, vec![json!({"n": 0}), json!({"n": 1})]);
        assert_eq!(queue.len("c").await, 1);
        assert_eq!(queue.take("c", 10).await, vec![json!({"n": 2})]);
        assert!(queue.take("other", 10).await.is_empty());
    }

    #[tokio::test]
    async fn drained_queue_is_forgotten() {
        let queue = MessageQueue::default();
        for connection in ["a", "b"] {
            queue.push(connection, json!({ "to": connection })).await;
        }
        assert_eq!(queue.connections().await, 2);

        queue.take("a", 1).await;
        assert_eq!(queue.connections().await, 1);

        queue.take("b", 10).await;
        assert_eq!(queue.connections().await, 0);
        assert_eq!(queue.len("b").await, 0);
    }
}
