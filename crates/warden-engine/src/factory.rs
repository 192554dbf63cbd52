use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::task::Task;

/// Registry of live invocations keyed by task id.
///
/// Non-periodic invocations live here from dispatch until their terminal
/// report; a periodic task's reusable invocation is present only while it is
/// actually running, which is what makes the non-overlap check atomic.
#[derive(Default)]
pub struct TaskFactory {
    tasks: Mutex<HashMap<String, Arc<Task>>>,
}

impl TaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invocation; returns false when the id is already live.
    pub fn add_task(&self, task: Arc<Task>) -> bool {
        let mut tasks = self.tasks.lock().expect("task factory poisoned");
        match tasks.entry(task.task_id().to_string()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(task);
                true
            }
        }
    }

    pub fn remove_task(&self, task_id: &str) {
        self.tasks.lock().expect("task factory poisoned").remove(task_id);
    }

    pub fn get_task(&self, task_id: &str) -> Option<Arc<Task>> {
        self.tasks.lock().expect("task factory poisoned").get(task_id).cloned()
    }

    pub fn contains_task(&self, task_id: &str) -> bool {
        self.tasks.lock().expect("task factory poisoned").contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("task factory poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
