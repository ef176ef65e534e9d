//! Deferred resource destruction
//!
//! Destroying a GPU object the moment the caller releases it is unsafe
//! while a frame is in flight: the GPU may still be executing commands
//! that reference it. Any destruction requested between `begin_frame` and
//! `end_frame` is appended here instead, tagged with the frame-in-flight
//! slot it was requested during, and drained after that frame's work has
//! been submitted and presented.
//!
//! Entries own their resource; dropping an entry runs the backend's RAII
//! teardown. The queue itself is generic so each backend supplies its own
//! tagged-union entry type.

/// Pending destruction tagged with the frame slot it was requested during
#[derive(Debug)]
struct DeferredEntry<T> {
    frame: usize,
    resource: T,
}

/// Queue of resources awaiting safe destruction
#[derive(Debug)]
pub struct DeferredFreeQueue<T> {
    entries: Vec<DeferredEntry<T>>,
}

impl<T> DeferredFreeQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Defer a resource's destruction, recording the current frame slot
    pub fn push(&mut self, frame: usize, resource: T) {
        self.entries.push(DeferredEntry { frame, resource });
    }

    /// Number of pending destructions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether anything is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every pending resource for destruction. Called after
    /// submit + present, before the frame index advances; the returned
    /// values drop (and destroy) at the call site.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|e| e.resource).collect()
    }

    /// Frame slots with pending destructions, for diagnostics
    pub fn pending_frames(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().map(|e| e.frame)
    }
}

impl<T> Default for DeferredFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_push_then_drain() {
        let mut queue = DeferredFreeQueue::new();
        queue.push(1, "texture");
        queue.push(1, "pipeline");
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained, vec!["texture", "pipeline"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_runs_on_drain() {
        // Rc strong counts stand in for RAII destructors.
        let marker = Rc::new(());
        let mut queue = DeferredFreeQueue::new();
        queue.push(0, Rc::clone(&marker));
        assert_eq!(Rc::strong_count(&marker), 2);

        drop(queue.drain());
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn test_pending_frames_tagged() {
        let mut queue = DeferredFreeQueue::new();
        queue.push(2, ());
        queue.push(0, ());
        let frames: Vec<usize> = queue.pending_frames().collect();
        assert_eq!(frames, vec![2, 0]);
    }
}
