//! Messenger port - domain-scoped publish / subscribe.
//!
//! Delivery is best-effort at-least-once. A `Subscription` is a plain
//! receiver; dropping it unsubscribes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{
    CancelTaskEvent, GraphFinishedEvent, MessengerError, RunGraphEvent, RunTaskEvent,
    TaskFinishedEvent,
};

/// Stream of events for one subscriber.
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(receiver: mpsc::UnboundedReceiver<T>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn into_receiver(self) -> mpsc::UnboundedReceiver<T> {
        self.receiver
    }
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn publish_run_task(&self, domain: &str, event: RunTaskEvent)
    -> Result<(), MessengerError>;

    async fn subscribe_run_task(
        &self,
        domain: &str,
    ) -> Result<Subscription<RunTaskEvent>, MessengerError>;

    async fn publish_cancel_task(
        &self,
        domain: &str,
        event: CancelTaskEvent,
    ) -> Result<(), MessengerError>;

    async fn subscribe_cancel(
        &self,
        domain: &str,
    ) -> Result<Subscription<CancelTaskEvent>, MessengerError>;

    async fn publish_task_finished(
        &self,
        domain: &str,
        event: TaskFinishedEvent,
    ) -> Result<(), MessengerError>;

    async fn subscribe_task_finished(
        &self,
        domain: &str,
    ) -> Result<Subscription<TaskFinishedEvent>, MessengerError>;

    async fn publish_run_task_graph(
        &self,
        domain: &str,
        event: RunGraphEvent,
    ) -> Result<(), MessengerError>;

    async fn subscribe_run_task_graph(
        &self,
        domain: &str,
    ) -> Result<Subscription<RunGraphEvent>, MessengerError>;

    async fn publish_graph_finished(
        &self,
        domain: &str,
        event: GraphFinishedEvent,
    ) -> Result<(), MessengerError>;

    async fn subscribe_graph_finished(
        &self,
        domain: &str,
    ) -> Result<Subscription<GraphFinishedEvent>, MessengerError>;
}
