use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// Handle for pushing replicable commands from any thread.
#[derive(Debug, Clone)]
pub struct ConsoleQueueSender {
    tx: Sender<String>,
}

impl ConsoleQueueSender {
    /// Returns false when the queue is full; the command is dropped.
    pub fn push(&self, command: impl Into<String>) -> bool {
        match self.tx.try_send(command.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(command)) => {
                log::warn!("Console replication queue is full, dropping '{}'", command);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Bounded queue of console commands awaiting replication, drained on the
/// tick thread in fixed-size batches.
#[derive(Debug)]
pub struct ConsoleCommandQueue {
    tx: Sender<String>,
    rx: Receiver<String>,
    batch_size: usize,
}

impl ConsoleCommandQueue {
    pub fn new(capacity: usize, batch_size: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            batch_size: batch_size.max(1),
        }
    }

    pub fn sender(&self) -> ConsoleQueueSender {
        ConsoleQueueSender {
            tx: self.tx.clone(),
        }
    }

    pub fn push(&self, command: impl Into<String>) -> bool {
        self.sender().push(command)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Everything queued so far, split into batches of at most `batch_size`.
    pub fn drain_batches(&self) -> Vec<Vec<String>> {
        let mut batches = Vec::new();
        let mut current = Vec::with_capacity(self.batch_size);
        while let Ok(command) = self.rx.try_recv() {
            current.push(command);
            if current.len() == self.batch_size {
                batches.push(std::mem::replace(
                    &mut current,
                    Vec::with_capacity(self.batch_size),
                ));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}
