use std::collections::HashMap;

use crate::console::Console;
use crate::queue::Queue;

/// What happens to a queue once it has neither consumers nor messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Retention {
    /// Queues live for the lifetime of the broker.
    #[default]
    Retain,
    /// A queue is dropped when its last consumer detaches and it holds no
    /// messages.
    EvictIdle,
}

/// Address to queue map. Queues are created the first time an address is
/// referenced, either by a consumer attaching or by a publish.
#[derive(Debug)]
pub struct QueueRegistry {
    queues: HashMap<String, Queue>,
    console: Console,
    retention: Retention,
}

impl QueueRegistry {
    pub fn new(console: Console, retention: Retention) -> Self {
        Self {
            queues: HashMap::new(),
            console,
            retention,
        }
    }

    pub fn get_or_create(&mut self, address: &str) -> &mut Queue {
        let console = self.console;
        self.queues.entry(address.to_string()).or_insert_with(|| {
            let queue = Queue::new(address, console);
            console.info(format_args!("Created {}", queue));
            queue
        })
    }

    pub fn get(&self, address: &str) -> Option<&Queue> {
        self.queues.get(address)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut Queue> {
        self.queues.get_mut(address)
    }

    /// Applies the retention policy to the queue at `address`.
    /// Returns true if the queue was dropped.
    pub fn release_if_idle(&mut self, address: &str) -> bool {
        if self.retention != Retention::EvictIdle {
            return false;
        }
        match self.queues.get(address) {
            Some(queue) if queue.is_idle() => {
                self.queues.remove(address);
                self.console
                    .info(format_args!("Dropped idle queue '{}'", address));
                true
            }
            _ => false,
        }
    }

    pub fn addresses(&self) -> Vec<&str> {
        self.queues.keys().map(|s| s.as_str()).collect()
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
