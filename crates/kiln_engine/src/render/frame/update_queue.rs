//! Per-frame-in-flight host write queues
//!
//! Mapped GPU memory that belongs to a frame-in-flight slot must not be
//! written while that slot's previous submission may still be executing.
//! Instead of writing immediately, buffer and uniform updates are queued
//! against the owning slot and applied ("flushed") right before that
//! slot's next submission, when the slot's fence has been waited and the
//! mapped pointer is safe to touch.
//!
//! The queue is generic over the write target so backends can name their
//! own destinations (a handle plus replica index rather than a raw
//! pointer).

/// One queued host→device write
#[derive(Debug, Clone)]
pub struct PendingWrite<T> {
    /// Backend-specific destination
    pub target: T,
    /// Byte offset within the destination
    pub offset: u64,
    /// Payload, stored inline
    pub data: Vec<u8>,
}

/// Write queue for a single frame-in-flight slot
#[derive(Debug)]
pub struct UpdateQueue<T> {
    writes: Vec<PendingWrite<T>>,
}

impl<T: PartialEq> UpdateQueue<T> {
    fn new() -> Self {
        Self { writes: Vec::new() }
    }

    /// Queue a write. A newer write to the same target, offset and length
    /// replaces the older payload so repeated per-frame updates do not
    /// accumulate.
    pub fn push(&mut self, target: T, offset: u64, data: Vec<u8>) {
        if let Some(existing) = self.writes.iter_mut().find(|w| {
            w.target == target && w.offset == offset && w.data.len() == data.len()
        }) {
            existing.data = data;
            return;
        }
        self.writes.push(PendingWrite {
            target,
            offset,
            data,
        });
    }

    /// Number of queued writes
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Take every queued write, leaving the queue empty
    pub fn drain(&mut self) -> Vec<PendingWrite<T>> {
        std::mem::take(&mut self.writes)
    }
}

/// One [`UpdateQueue`] per frame-in-flight slot
#[derive(Debug)]
pub struct FrameUpdateQueues<T> {
    queues: Vec<UpdateQueue<T>>,
}

impl<T: PartialEq + Clone> FrameUpdateQueues<T> {
    /// Create queues for `frames_in_flight` slots
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            queues: (0..frames_in_flight).map(|_| UpdateQueue::new()).collect(),
        }
    }

    /// Queue a write against one slot (dynamic buffer updates)
    pub fn push(&mut self, frame: usize, target: T, offset: u64, data: Vec<u8>) {
        self.queues[frame].push(target, offset, data);
    }

    /// Queue a write against every slot (uniform updates: the value
    /// applies going forward, whichever slot executes next)
    pub fn push_all(&mut self, target: T, offset: u64, data: &[u8]) {
        for queue in &mut self.queues {
            queue.push(target.clone(), offset, data.to_vec());
        }
    }

    /// Drain one slot's writes for flushing
    pub fn drain(&mut self, frame: usize) -> Vec<PendingWrite<T>> {
        self.queues[frame].drain()
    }

    /// Number of writes queued against one slot
    pub fn len(&self, frame: usize) -> usize {
        self.queues[frame].len()
    }

    /// Drop every queued write (teardown and structural recreation)
    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_drain() {
        let mut queues: FrameUpdateQueues<u32> = FrameUpdateQueues::new(3);
        queues.push(0, 7, 16, vec![1, 2, 3]);
        assert_eq!(queues.len(0), 1);
        assert_eq!(queues.len(1), 0);

        let writes = queues.drain(0);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].target, 7);
        assert_eq!(writes[0].offset, 16);
        assert_eq!(queues.len(0), 0);
    }

    #[test]
    fn test_fan_out_reaches_every_slot() {
        let mut queues: FrameUpdateQueues<u32> = FrameUpdateQueues::new(3);
        queues.push_all(1, 0, &[9, 9]);
        for frame in 0..3 {
            assert_eq!(queues.len(frame), 1);
        }
        // Draining one slot leaves the others pending.
        queues.drain(1);
        assert_eq!(queues.len(0), 1);
        assert_eq!(queues.len(1), 0);
        assert_eq!(queues.len(2), 1);
    }

    #[test]
    fn test_matching_write_replaces() {
        let mut queues: FrameUpdateQueues<u32> = FrameUpdateQueues::new(2);
        queues.push_all(1, 0, &[1, 1]);
        queues.push_all(1, 0, &[2, 2]);
        assert_eq!(queues.len(0), 1);
        let writes = queues.drain(0);
        assert_eq!(writes[0].data, vec![2, 2]);
    }

    #[test]
    fn test_different_offsets_kept_separate() {
        let mut queues: FrameUpdateQueues<u32> = FrameUpdateQueues::new(1);
        queues.push(0, 1, 0, vec![1]);
        queues.push(0, 1, 8, vec![2]);
        assert_eq!(queues.len(0), 2);
    }
}
