//! InMemoryMessenger - 開発用の message bus
//!
//! # 実装詳細
//! - topic ごとに `HashMap<domain, Vec<UnboundedSender<T>>>` を管理
//! - publish は同じ domain の全 subscriber に clone して配送（fan-out）
//! - drop された subscriber は publish 時に取り除く

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{
    CancelTaskEvent, GraphFinishedEvent, MessengerError, RunGraphEvent, RunTaskEvent,
    TaskFinishedEvent,
};
use crate::ports::{Messenger, Subscription};

struct Topic<T> {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T: Clone> Topic<T> {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    fn subscribe(&self, domain: &str) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(domain.to_string())
            .or_default()
            .push(tx);
        Subscription::new(rx)
    }

    /// Returns how many subscribers received the event.
    fn publish(&self, domain: &str, event: T) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(senders) = subscribers.get_mut(domain) else {
            return 0;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        senders.len()
    }
}

/// In-process messenger shared by every component of one engine (or of
/// several engines in a test).
pub struct InMemoryMessenger {
    run_task: Topic<RunTaskEvent>,
    cancel_task: Topic<CancelTaskEvent>,
    task_finished: Topic<TaskFinishedEvent>,
    run_task_graph: Topic<RunGraphEvent>,
    graph_finished: Topic<GraphFinishedEvent>,
}

impl InMemoryMessenger {
    pub fn new() -> Self {
        Self {
            run_task: Topic::new(),
            cancel_task: Topic::new(),
            task_finished: Topic::new(),
            run_task_graph: Topic::new(),
            graph_finished: Topic::new(),
        }
    }
}

impl Default for InMemoryMessenger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Messenger for InMemoryMessenger {
    async fn publish_run_task(
        &self,
        domain: &str,
        event: RunTaskEvent,
    ) -> Result<(), MessengerError> {
        self.run_task.publish(domain, event);
        Ok(())
    }

    async fn subscribe_run_task(
        &self,
        domain: &str,
    ) -> Result<Subscription<RunTaskEvent>, MessengerError> {
        Ok(self.run_task.subscribe(domain))
    }

    async fn publish_cancel_task(
        &self,
        domain: &str,
        event: CancelTaskEvent,
    ) -> Result<(), MessengerError> {
        self.cancel_task.publish(domain, event);
        Ok(())
    }

    async fn subscribe_cancel(
        &self,
        domain: &str,
    ) -> Result<Subscription<CancelTaskEvent>, MessengerError> {
        Ok(self.cancel_task.subscribe(domain))
    }

    async fn publish_task_finished(
        &self,
        domain: &str,
        event: TaskFinishedEvent,
    ) -> Result<(), MessengerError> {
        self.task_finished.publish(domain, event);
        Ok(())
    }

    async fn subscribe_task_finished(
        &self,
        domain: &str,
    ) -> Result<Subscription<TaskFinishedEvent>, MessengerError> {
        Ok(self.task_finished.subscribe(domain))
    }

    async fn publish_run_task_graph(
        &self,
        domain: &str,
        event: RunGraphEvent,
    ) -> Result<(), MessengerError> {
        self.run_task_graph.publish(domain, event);
        Ok(())
    }

    async fn subscribe_run_task_graph(
        &self,
        domain: &str,
    ) -> Result<Subscription<RunGraphEvent>, MessengerError> {
        Ok(self.run_task_graph.subscribe(domain))
    }

    async fn publish_graph_finished(
        &self,
        domain: &str,
        event: GraphFinishedEvent,
    ) -> Result<(), MessengerError> {
        self.graph_finished.publish(domain, event);
        Ok(())
    }

    async fn subscribe_graph_finished(
        &self,
        domain: &str,
    ) -> Result<Subscription<GraphFinishedEvent>, MessengerError> {
        Ok(self.graph_finished.subscribe(domain))
    }
}
