//! Run lifecycle events and event handling.
//!
//! Every execution request ends in exactly one [`Event::RunFinished`], carrying
//! the [`ExecutionResult`]. Handlers registered on the [`EventBus`] are the
//! reporting sink: they observe results, they cannot influence them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::core::types::{JobId, RunId};
use crate::execution::ExecutionResult;

/// Lifecycle events emitted by the execution coordinator.
#[derive(Debug, Clone)]
pub enum Event {
    /// A run acquired its slot and is about to load its module.
    RunStarted {
        job_id: JobId,
        run_id: RunId,
        fire_time: DateTime<Utc>,
        timestamp: Instant,
    },

    /// A run finished, was skipped, or failed before starting.
    RunFinished {
        job_id: JobId,
        run_id: RunId,
        fire_time: DateTime<Utc>,
        result: ExecutionResult,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::RunStarted { timestamp, .. } => *timestamp,
            Event::RunFinished { timestamp, .. } => *timestamp,
        }
    }

    /// The job this event belongs to.
    pub fn job_id(&self) -> &JobId {
        match self {
            Event::RunStarted { job_id, .. } => job_id,
            Event::RunFinished { job_id, .. } => job_id,
        }
    }

    /// Create a RunStarted event.
    pub fn run_started(job_id: JobId, run_id: RunId, fire_time: DateTime<Utc>) -> Self {
        Event::RunStarted {
            job_id,
            run_id,
            fire_time,
            timestamp: Instant::now(),
        }
    }

    /// Create a RunFinished event.
    pub fn run_finished(
        job_id: JobId,
        run_id: RunId,
        fire_time: DateTime<Utc>,
        result: ExecutionResult,
    ) -> Self {
        Event::RunFinished {
            job_id,
            run_id,
            fire_time,
            result,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Emit an event to all registered handlers, in registration order.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
