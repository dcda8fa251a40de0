//! Request queue: the FIFO of files the scheduler decided to pull,
//! deduplicated by name and drained by the transfer slots.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::store::AvailableFile;

#[derive(Default)]
pub struct RequestQueue {
    queue: Mutex<VecDeque<AvailableFile>>,
    pushed: Notify,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue unless a request with the same name is already waiting.
    /// Returns whether the entry was inserted.
    pub fn push(&self, file: AvailableFile) -> bool {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        if queue
            .iter()
            .any(|queued| queued.file_info.file_name == file.file_info.file_name)
        {
            return false;
        }
        queue.push_back(file);
        drop(queue);
        self.pushed.notify_waiters();
        true
    }

    pub fn try_pop(&self) -> Option<AvailableFile> {
        self.queue
            .lock()
            .expect("queue lock poisoned")
            .pop_front()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queue
            .lock()
            .expect("queue lock poisoned")
            .iter()
            .any(|queued| queued.file_info.file_name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().expect("queue lock poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    pub fn clear(&self) {
        self.queue.lock().expect("queue lock poisoned").clear();
    }

    /// Resolves once something has been pushed.
    pub async fn wait_pushed(&self) {
        self.pushed.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileInfo;
    use std::net::{IpAddr, Ipv4Addr};

    fn available(name: &str) -> AvailableFile {
        AvailableFile {
            file_info: FileInfo {
                file_name: name.to_string(),
                size: 1,
                sha256sum: None,
            },
            source_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            source_port: 8000,
            public_key: "peer".to_string(),
        }
    }

    #[test]
    fn fifo_order() {
        let queue = RequestQueue::new();
        assert!(queue.push(available("first")));
        assert!(queue.push(available("second")));
        assert_eq!(queue.try_pop().unwrap().file_info.file_name, "first");
        assert_eq!(queue.try_pop().unwrap().file_info.file_name, "second");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn duplicate_names_are_dropped() {
        let queue = RequestQueue::new();
        assert!(queue.push(available("same")));
        assert!(!queue.push(available("same")));
        assert_eq!(queue.len(), 1);
        // Once popped, the name may be queued again.
        queue.try_pop();
        assert!(queue.push(available("same")));
    }

    #[test]
    fn contains_sees_queued_names() {
        let queue = RequestQueue::new();
        queue.push(available("queued"));
        assert!(queue.contains("queued"));
        assert!(!queue.contains("other"));
    }
}
