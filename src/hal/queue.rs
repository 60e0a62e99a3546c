use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use derive_more::{Deref, Display};

/// Identity of a [`Queue`]. Clones of one queue share it.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct QueueId(uid::Id<QueueId>);

impl QueueId {
    #[inline]
    pub fn new() -> Self {
        Self(uid::Id::new())
    }
}

/// Completion marker recorded on a [`Queue`].
pub trait Event: std::fmt::Debug + Send + Sync {
    /// Polls the event without blocking.
    fn is_signaled(&self) -> bool;
    /// Blocks until the event is signaled.
    fn wait(&self);
}

/// An asynchronous device queue.
pub trait Queue: std::fmt::Debug + Send + Sync {
    fn id(&self) -> QueueId;
    /// Blocks until all work submitted so far has completed.
    fn wait_until_completed(&self);
    /// Records an event that is signaled once all work submitted so far has completed.
    fn signal(&self) -> Box<dyn Event>;
}

#[derive(Debug, Default)]
struct HostQueueState {
    submitted: u64,
    completed: u64,
    /// Events waiting for the work item of the given ticket.
    waiters: Vec<(u64, flume::Sender<()>)>,
}

/// A queue whose work is submitted and completed explicitly by the host.
///
/// Work items complete in submission order. Clones refer to the same queue.
#[derive(Debug, Clone)]
pub struct HostQueue {
    id: QueueId,
    state: Arc<Mutex<HostQueueState>>,
}

impl Default for HostQueue {
    fn default() -> Self {
        let id = QueueId::new();
        let state = Default::default();
        Self { id, state }
    }
}

impl HostQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues one work item and returns its ticket.
    pub fn submit(&self) -> u64 {
        let mut state = self.state.lock().expect("failed to lock");
        state.submitted += 1;
        state.submitted
    }

    /// Completes the oldest outstanding work item, if any.
    pub fn complete(&self) {
        let mut state = self.state.lock().expect("failed to lock");
        if state.completed < state.submitted {
            state.completed += 1;
        }
        let completed = state.completed;
        state.waiters.retain(|(ticket, sender)| match *ticket <= completed {
            true => {
                _ = sender.send(());
                false
            }
            false => true,
        });
    }

    /// Completes every outstanding work item.
    pub fn complete_all(&self) {
        while !self.is_idle() {
            self.complete();
        }
    }

    /// Returns `true` if no submitted work is outstanding.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().expect("failed to lock");
        state.completed == state.submitted
    }
}

impl Queue for HostQueue {
    #[inline]
    fn id(&self) -> QueueId {
        self.id
    }

    fn wait_until_completed(&self) {
        self.signal().wait();
    }

    fn signal(&self) -> Box<dyn Event> {
        let (sender, receiver) = flume::bounded(1);
        let mut state = self.state.lock().expect("failed to lock");
        match state.completed == state.submitted {
            true => {
                _ = sender.send(());
            }
            false => {
                let ticket = state.submitted;
                state.waiters.push((ticket, sender));
            }
        }
        Box::new(HostEvent::new(receiver))
    }
}

/// Event signaled through a channel. A dropped sender also counts as signaled, so that events
/// of a dropped queue never block.
#[derive(Debug)]
pub struct HostEvent {
    receiver: flume::Receiver<()>,
    signaled: AtomicBool,
}

impl HostEvent {
    fn new(receiver: flume::Receiver<()>) -> Self {
        let signaled = AtomicBool::new(false);
        Self { receiver, signaled }
    }
}

impl Event for HostEvent {
    fn is_signaled(&self) -> bool {
        if self.signaled.load(Ordering::Acquire) {
            return true;
        }
        let signaled = match self.receiver.try_recv() {
            Ok(()) | Err(flume::TryRecvError::Disconnected) => true,
            Err(flume::TryRecvError::Empty) => false,
        };
        if signaled {
            self.signaled.store(true, Ordering::Release);
        }
        signaled
    }

    fn wait(&self) {
        if !self.signaled.load(Ordering::Acquire) {
            _ = self.receiver.recv();
            self.signaled.store(true, Ordering::Release);
        }
    }
}
