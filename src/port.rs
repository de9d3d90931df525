use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, never, select, Receiver, Sender, TryRecvError, TrySendError};
use fnv::FnvHashMap as HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error::{Error, Result};
use crate::kernel::{PortId, TeamId};
use crate::message::Message;

/// One-shot broadcast: once triggered, every current and future wait on it
/// returns immediately.
#[derive(Debug)]
pub struct Latch {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.lock().take();
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// How long a port operation may block.
#[derive(Debug, Clone, Copy, Default)]
pub struct Wait<'a> {
    timeout: Option<Duration>,
    kill: Option<&'a Latch>,
}

impl<'a> Wait<'a> {
    pub fn forever() -> Self {
        Self::default()
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            kill: None,
        }
    }

    pub fn no_wait() -> Self {
        Self::timeout(Duration::from_secs(0))
    }

    /// Blocks until done, the timeout expires or `kill` is triggered.
    pub fn kill_interruptible(kill: &'a Latch) -> Self {
        Self {
            timeout: None,
            kill: Some(kill),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn timer(&self) -> Receiver<Instant> {
        match self.timeout {
            Some(d) => after(d),
            None => never(),
        }
    }

    fn is_no_wait(&self) -> bool {
        matches!(self.timeout, Some(d) if d.as_nanos() == 0)
    }
}

#[derive(Debug)]
pub struct Port {
    id: PortId,
    name: String,
    owner: Mutex<TeamId>,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    closed: Latch,
}

impl Port {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> TeamId {
        *self.owner.lock()
    }

    pub fn queued(&self) -> usize {
        self.rx.len()
    }
}

/// Kernel-wide port registry.
#[derive(Debug)]
pub struct PortTable {
    ports: RwLock<HashMap<PortId, Arc<Port>>>,
    next_id: AtomicI32,
}

impl PortTable {
    pub fn new() -> Self {
        Self {
            ports: RwLock::new(HashMap::default()),
            next_id: AtomicI32::new(1),
        }
    }

    pub fn create(&self, owner: TeamId, capacity: usize, name: impl Into<String>) -> PortId {
        let id = PortId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = bounded(capacity.max(1));
        let port = Port {
            id,
            name: name.into(),
            owner: Mutex::new(owner),
            tx,
            rx,
            closed: Latch::new(),
        };
        trace!(port = %id, name = port.name(), owner = %owner, "port created");
        self.ports.write().insert(id, Arc::new(port));
        id
    }

    pub fn get(&self, id: PortId) -> Result<Arc<Port>> {
        self.ports.read().get(&id).cloned().ok_or(Error::BadPortId(id))
    }

    pub fn exists(&self, id: PortId) -> bool {
        self.ports.read().contains_key(&id)
    }

    pub fn owner(&self, id: PortId) -> Result<TeamId> {
        self.get(id).map(|p| p.owner())
    }

    pub fn set_owner(&self, id: PortId, owner: TeamId) -> Result<()> {
        let port = self.get(id)?;
        *port.owner.lock() = owner;
        Ok(())
    }

    /// Deletes the port; pending and future reads and writes fail.
    pub fn delete(&self, id: PortId) -> Result<()> {
        let port = self.ports.write().remove(&id).ok_or(Error::BadPortId(id))?;
        port.closed.trigger();
        trace!(port = %id, name = port.name(), "port deleted");
        Ok(())
    }

    pub fn delete_owned_by(&self, owner: TeamId) -> Vec<PortId> {
        let owned: Vec<_> = self
            .ports
            .read()
            .values()
            .filter(|p| p.owner() == owner)
            .map(|p| p.id)
            .collect();
        for id in &owned {
            self.delete(*id).ok();
        }
        owned
    }

    pub fn write(&self, id: PortId, message: impl Into<Message>, wait: Wait<'_>) -> Result<()> {
        let port = self.get(id)?;
        let message = message.into();

        if port.closed.is_triggered() {
            return Err(Error::BadPortId(id));
        }
        if let Some(kill) = wait.kill {
            if kill.is_triggered() {
                return Err(Error::Interrupted);
            }
        }

        if wait.is_no_wait() {
            return port.tx.try_send(message).map_err(|e| match e {
                TrySendError::Full(_) => Error::TimedOut,
                TrySendError::Disconnected(_) => Error::BadPortId(id),
            });
        }

        let unkillable = never();
        let kill = wait.kill.map(Latch::receiver).unwrap_or(&unkillable);
        let timer = wait.timer();

        select! {
            send(port.tx, message) -> res => res.map_err(|_| Error::BadPortId(id)),
            recv(port.closed.receiver()) -> _ => Err(Error::BadPortId(id)),
            recv(kill) -> _ => Err(Error::Interrupted),
            recv(timer) -> _ => Err(Error::TimedOut),
        }
    }

    pub fn read(&self, id: PortId, wait: Wait<'_>) -> Result<Message> {
        let port = self.get(id)?;

        if port.closed.is_triggered() {
            return Err(Error::BadPortId(id));
        }
        if let Some(kill) = wait.kill {
            if kill.is_triggered() {
                return Err(Error::Interrupted);
            }
        }

        if wait.is_no_wait() {
            return port.rx.try_recv().map_err(|_| Error::TimedOut);
        }

        let unkillable = never();
        let kill = wait.kill.map(Latch::receiver).unwrap_or(&unkillable);
        let timer = wait.timer();

        select! {
            recv(port.rx) -> msg => msg.map_err(|_| Error::BadPortId(id)),
            recv(port.closed.receiver()) -> _ => Err(Error::BadPortId(id)),
            recv(kill) -> _ => Err(Error::Interrupted),
            recv(timer) -> _ => Err(Error::TimedOut),
        }
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ThreadCommand;
    use std::thread;

    #[test]
    fn delete_wakes_blocked_reader() {
        let ports = Arc::new(PortTable::new());
        let id = ports.create(TeamId(1), 1, "test");

        let reader = {
            let ports = ports.clone();
            thread::spawn(move || ports.read(id, Wait::forever()))
        };

        thread::sleep(Duration::from_millis(20));
        ports.delete(id).unwrap();
        assert_eq!(reader.join().unwrap(), Err(Error::BadPortId(id)));
        assert!(!ports.exists(id));
    }

    #[test]
    fn kill_interrupts_blocked_writer() {
        let ports = Arc::new(PortTable::new());
        let id = ports.create(TeamId(1), 1, "full");
        ports
            .write(id, ThreadCommand::DebuggerChanged, Wait::no_wait())
            .unwrap();
        assert_eq!(
            ports.write(id, ThreadCommand::DebuggerChanged, Wait::no_wait()),
            Err(Error::TimedOut)
        );

        let kill = Arc::new(Latch::new());
        let writer = {
            let ports = ports.clone();
            let kill = kill.clone();
            thread::spawn(move || {
                ports.write(
                    id,
                    ThreadCommand::DebuggerChanged,
                    Wait::kill_interruptible(&kill),
                )
            })
        };

        thread::sleep(Duration::from_millis(20));
        kill.trigger();
        assert_eq!(writer.join().unwrap(), Err(Error::Interrupted));
    }

    #[test]
    fn read_times_out() {
        let ports = PortTable::new();
        let id = ports.create(TeamId(1), 4, "idle");
        assert_eq!(
            ports.read(id, Wait::timeout(Duration::from_millis(10))),
            Err(Error::TimedOut)
        );
    }

    #[test]
    fn delete_owned_ports() {
        let ports = PortTable::new();
        let a = ports.create(TeamId(1), 1, "a");
        let b = ports.create(TeamId(2), 1, "b");
        ports.set_owner(b, TeamId(1)).unwrap();
        let c = ports.create(TeamId(2), 1, "c");

        let mut deleted = ports.delete_owned_by(TeamId(1));
        deleted.sort_by_key(|p| p.0);
        assert_eq!(deleted, vec![a, b]);
        assert!(ports.exists(c));
    }
}
