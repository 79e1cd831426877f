use {
    parking_lot::{Condvar, Mutex},
    std::collections::VecDeque,
};

#[derive(Debug, thiserror::Error)]
#[error("queue closed for puts")]
pub struct QueueClosed<T> {
    inner: T,
}

impl<T> QueueClosed<T> {
    ///
    /// Gives back the item that was refused.
    ///
    pub fn into_inner(self) -> T {
        self.inner
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

///
/// Unbounded FIFO queue shared by many producers and many consumers.
///
/// Once [`BlockingQueue::close`] is called, puts are refused while gets keep draining what is left.
///
/// Examples
///
/// ```
/// use rust_coordkv::queue::BlockingQueue;
///
/// let queue = BlockingQueue::new();
/// queue.put(1).expect("queue is open");
/// queue.close();
///
/// assert!(queue.put(2).is_err());
/// assert_eq!(queue.get(), Some(1));
/// assert_eq!(queue.get(), None);
/// ```
///
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    consumers: Condvar,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            consumers: Condvar::new(),
        }
    }

    pub fn put(&self, item: T) -> Result<(), QueueClosed<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueClosed { inner: item });
        }
        state.items.push_back(item);
        self.consumers.notify_one();
        Ok(())
    }

    ///
    /// Appends an item that was already accepted once, even after close.
    ///
    pub(crate) fn requeue(&self, item: T) {
        let mut state = self.state.lock();
        state.items.push_back(item);
        self.consumers.notify_one();
    }

    ///
    /// Blocks until an item is available. Returns `None` once the queue is empty and closed.
    ///
    pub fn get(&self) -> Option<T> {
        let mut state = self.state.lock();
        while !state.closed && state.items.is_empty() {
            self.consumers.wait(&mut state);
        }
        state.items.pop_front()
    }

    ///
    /// Moves up to `max_count` items into `out`, in FIFO order.
    ///
    /// With `require_at_least_one`, blocks until one item is available and returns false only when
    /// the queue is empty and closed. Without it, an empty queue returns immediately with nothing added.
    ///
    pub fn get_batch(&self, out: &mut Vec<T>, max_count: usize, require_at_least_one: bool) -> bool {
        if max_count == 0 {
            return true;
        }
        let mut state = self.state.lock();
        if require_at_least_one {
            while !state.closed && state.items.is_empty() {
                self.consumers.wait(&mut state);
            }
            if state.items.is_empty() {
                return false;
            }
        }
        let count = max_count.min(state.items.len());
        out.extend(state.items.drain(..count));
        true
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.consumers.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    ///
    /// Snapshot check, advisory only.
    ///
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}
