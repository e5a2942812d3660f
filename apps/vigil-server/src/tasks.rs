use std::{borrow::Cow, time::Duration};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A named background task owned by the engine.
#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Collects the engine's long-lived tasks and tears them down in
/// registration order, giving each a grace window before aborting.
#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(task = task.name(), "task registered");
        self.tasks.push(task);
    }

    pub fn extend<I>(&mut self, tasks: I)
    where
        I: IntoIterator<Item = TaskHandle>,
    {
        for task in tasks {
            self.push(task);
        }
    }

    pub async fn shutdown_with_grace(self, grace: Duration) {
        for task in self.tasks {
            let TaskHandle { name, mut handle } = task;
            if grace.is_zero() {
                handle.abort();
                if let Err(err) = handle.await {
                    debug!(task = %name, ?err, "task join after abort failed");
                }
                continue;
            }

            let sleeper = tokio::time::sleep(grace);
            tokio::pin!(sleeper);
            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        debug!(task = %name, ?err, "task exited with error");
                    }
                }
                _ = &mut sleeper => {
                    handle.abort();
                    if let Err(err) = handle.await {
                        debug!(task = %name, ?err, "task join after abort failed");
                    }
                }
            }
        }
    }
}

impl From<Vec<TaskHandle>> for TaskManager {
    fn from(tasks: Vec<TaskHandle>) -> Self {
        let mut manager = TaskManager::new();
        manager.extend(tasks);
        manager
    }
}
