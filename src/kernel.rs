use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap as HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::{AddressSpace, AreaId, SharedArea};
use crate::port::PortTable;
use crate::team::Team;
use crate::thread::Thread;

macro_rules! object_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub i32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

object_id!(TeamId);
object_id!(ThreadId);
object_id!(PortId);

/// Registry of every team, thread, port and shared area.
pub struct Kernel {
    config: Config,
    ports: PortTable,
    teams: RwLock<HashMap<TeamId, Arc<Team>>>,
    threads: RwLock<HashMap<ThreadId, Arc<Thread>>>,
    areas: RwLock<HashMap<AreaId, Arc<SharedArea>>>,
    next_id: AtomicI32,
    next_area: AtomicI32,
    default_debugger_port: Mutex<Option<PortId>>,
    kernel_team: Arc<Team>,
}

impl Kernel {
    pub fn new(config: Config) -> Arc<Self> {
        let kernel_team = Arc::new(Team::new(
            TeamId(1),
            "kernel_team",
            true,
            AddressSpace::new(&config.memory),
        ));

        let mut teams = HashMap::default();
        teams.insert(kernel_team.id(), kernel_team.clone());

        Arc::new(Self {
            config,
            ports: PortTable::new(),
            teams: RwLock::new(teams),
            threads: RwLock::new(HashMap::default()),
            areas: RwLock::new(HashMap::default()),
            next_id: AtomicI32::new(2),
            next_area: AtomicI32::new(1),
            default_debugger_port: Mutex::new(None),
            kernel_team,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    pub fn kernel_team(&self) -> &Arc<Team> {
        &self.kernel_team
    }

    fn next_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn create_team(&self, name: &str) -> Arc<Team> {
        let id = TeamId(self.next_id());
        let team = Arc::new(Team::new(id, name, false, AddressSpace::new(&self.config.memory)));
        self.teams.write().insert(id, team.clone());
        debug!(team = %id, name, "team created");
        team
    }

    pub fn team(&self, id: TeamId) -> Result<Arc<Team>> {
        self.teams
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::BadTeamId(id))
    }

    /// Looks up a team that is not on its way out.
    pub fn live_team(&self, id: TeamId) -> Result<Arc<Team>> {
        self.team(id)
            .and_then(|team| if team.is_dying() { Err(Error::BadTeamId(id)) } else { Ok(team) })
    }

    pub fn teams(&self) -> Vec<Arc<Team>> {
        let mut teams: Vec<_> = self.teams.read().values().cloned().collect();
        teams.sort_by_key(|t| t.id());
        teams
    }

    /// Unregisters a team, its threads and every port it owns.
    pub fn remove_team(&self, id: TeamId) -> Result<()> {
        let team = self.teams.write().remove(&id).ok_or(Error::BadTeamId(id))?;
        team.kill(0);

        let mut threads = self.threads.write();
        for thread in team.threads() {
            threads.remove(&thread.id());
            team.remove_thread(thread.id());
        }
        drop(threads);

        let ports = self.ports.delete_owned_by(id);
        self.areas.write().retain(|_, area| area.owner() != id);

        info!(team = %id, ports = ports.len(), "team removed");
        Ok(())
    }

    pub fn spawn_thread(&self, team: &Arc<Team>, name: &str) -> Result<Arc<Thread>> {
        if team.is_dying() {
            return Err(Error::BadTeamId(team.id()));
        }

        let id = ThreadId(self.next_id());
        let thread = Arc::new(Thread::new(id, name, team.clone()));
        team.add_thread(&thread);
        self.threads.write().insert(id, thread.clone());
        debug!(team = %team.id(), thread = %id, name, "thread created");
        Ok(thread)
    }

    pub fn thread(&self, id: ThreadId) -> Result<Arc<Thread>> {
        self.threads
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::BadThreadId(id))
    }

    pub fn remove_thread(&self, id: ThreadId) -> Result<Arc<Thread>> {
        let thread = self.threads.write().remove(&id).ok_or(Error::BadThreadId(id))?;
        thread.team().remove_thread(id);
        debug!(thread = %id, "thread removed");
        Ok(thread)
    }

    pub fn create_area(&self, owner: TeamId, size: usize) -> Result<AreaId> {
        if size == 0 {
            return Err(Error::BadValue);
        }
        let id = self.next_area.fetch_add(1, Ordering::Relaxed);
        self.areas
            .write()
            .insert(id, Arc::new(SharedArea::new(id, owner, size)));
        Ok(id)
    }

    /// Maps an existing area into the kernel; the clone shares its pages.
    pub fn clone_area(&self, id: AreaId) -> Result<Arc<SharedArea>> {
        self.areas.read().get(&id).cloned().ok_or(Error::BadValue)
    }

    pub fn delete_area(&self, id: AreaId) -> Result<()> {
        self.areas.write().remove(&id).map(|_| ()).ok_or(Error::BadValue)
    }

    pub fn default_debugger_port(&self) -> Option<PortId> {
        *self.default_debugger_port.lock()
    }

    pub(crate) fn set_default_debugger_port(&self, port: Option<PortId>) {
        *self.default_debugger_port.lock() = port;
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("teams", &self.teams.read().len())
            .field("threads", &self.threads.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_removal_drops_threads_and_ports() {
        let kernel = Kernel::new(Config::default());
        let team = kernel.create_team("app");
        let thread = kernel.spawn_thread(&team, "main").unwrap();
        let port = kernel.ports().create(team.id(), 4, "app port");

        assert_eq!(team.threads().len(), 1);
        kernel.remove_team(team.id()).unwrap();

        assert!(team.is_dying());
        assert!(team.kill_latch().is_triggered());
        assert_eq!(kernel.thread(thread.id()).unwrap_err(), Error::BadThreadId(thread.id()));
        assert!(!kernel.ports().exists(port));
        assert!(kernel.spawn_thread(&team, "late").is_err());
    }

    #[test]
    fn ids_are_unique_across_teams_and_threads() {
        let kernel = Kernel::new(Config::default());
        let a = kernel.create_team("a");
        let t = kernel.spawn_thread(&a, "t").unwrap();
        let b = kernel.create_team("b");
        assert_ne!(a.id().0, t.id().0);
        assert_ne!(t.id().0, b.id().0);
        assert!(kernel.kernel_team().is_kernel());
        assert_eq!(kernel.teams().len(), 3);
    }

    #[test]
    fn areas_are_shared_on_clone() {
        let kernel = Kernel::new(Config::default());
        let team = kernel.create_team("a");
        let id = kernel.create_area(team.id(), 64).unwrap();
        let clone = kernel.clone_area(id).unwrap();
        clone.write_word(0, 42);
        assert_eq!(kernel.clone_area(id).unwrap().read_word(0), Some(42));
        kernel.delete_area(id).unwrap();
        assert_eq!(kernel.clone_area(id).unwrap_err(), Error::BadValue);
    }
}
