//! Named agent slots per role.
//!
//! A phase borrows a named agent (e.g. `Alex`) before doing AI work and holds
//! it exclusively until the returned [`AgentLease`] is dropped. When a role is
//! exhausted, acquirers queue in FIFO order.

use apc_protocol::config_models::PoolConfig;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Unknown agent role: {0}")]
    UnknownRole(String),
    #[error("Agent pool closed while waiting for role '{0}'")]
    Closed(String),
}

struct Waiter {
    workflow_id: String,
    tx: oneshot::Sender<String>,
}

#[derive(Default)]
struct RoleSlots {
    free: VecDeque<String>,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct PoolState {
    roles: HashMap<String, RoleSlots>,
    /// agent name -> holding workflow id
    holders: HashMap<String, String>,
}

/// Shared pool of named agents. Cloning shares the same slots.
#[derive(Clone, Default)]
pub struct AgentPool {
    state: Arc<Mutex<PoolState>>,
}

impl AgentPool {
    pub fn new(roles: &BTreeMap<String, Vec<String>>) -> Self {
        let roles = roles
            .iter()
            .map(|(role, names)| {
                let slots = RoleSlots {
                    free: names.iter().cloned().collect(),
                    waiters: VecDeque::new(),
                };
                (role.clone(), slots)
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(PoolState {
                roles,
                holders: HashMap::new(),
            })),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(&config.roles)
    }

    /// Borrow an agent of `role` for `workflow_id`, waiting in line when every
    /// agent of the role is held.
    ///
    /// Dropping the returned future while it waits gives up the place in line;
    /// an agent handed over in that window goes back to the pool.
    pub async fn acquire(&self, role: &str, workflow_id: &str) -> Result<AgentLease, PoolError> {
        let rx = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let slots = state
                .roles
                .get_mut(role)
                .ok_or_else(|| PoolError::UnknownRole(role.to_string()))?;
            if let Some(name) = slots.free.pop_front() {
                state.holders.insert(name.clone(), workflow_id.to_string());
                debug!(role, agent = %name, workflow_id, "Agent acquired");
                return Ok(self.lease(role, name));
            }

            let (tx, rx) = oneshot::channel();
            slots.waiters.retain(|w| !w.tx.is_closed());
            slots.waiters.push_back(Waiter {
                workflow_id: workflow_id.to_string(),
                tx,
            });
            debug!(role, workflow_id, queued = slots.waiters.len(), "Waiting for agent");
            rx
        };

        let mut pending = PendingAcquire {
            pool: self.clone(),
            role: role.to_string(),
            rx,
            done: false,
        };
        let result = (&mut pending.rx).await;
        pending.done = true;
        match result {
            Ok(name) => {
                debug!(role, agent = %name, workflow_id, "Agent handed over");
                Ok(self.lease(role, name))
            }
            Err(_) => Err(PoolError::Closed(role.to_string())),
        }
    }

    /// Borrow an agent without waiting.
    pub fn try_acquire(&self, role: &str, workflow_id: &str) -> Result<Option<AgentLease>, PoolError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let slots = state
            .roles
            .get_mut(role)
            .ok_or_else(|| PoolError::UnknownRole(role.to_string()))?;
        Ok(slots.free.pop_front().map(|name| {
            state.holders.insert(name.clone(), workflow_id.to_string());
            self.lease(role, name)
        }))
    }

    /// Free agents of `role`, in hand-out order.
    pub fn available(&self, role: &str) -> Vec<String> {
        self.state
            .lock()
            .roles
            .get(role)
            .map(|slots| slots.free.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Workflows queued for `role`, oldest first.
    pub fn waiting(&self, role: &str) -> Vec<String> {
        self.state
            .lock()
            .roles
            .get(role)
            .map(|slots| {
                slots
                    .waiters
                    .iter()
                    .filter(|w| !w.tx.is_closed())
                    .map(|w| w.workflow_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Agent name -> holding workflow id.
    pub fn holders(&self) -> HashMap<String, String> {
        self.state.lock().holders.clone()
    }

    /// Agents held by one workflow, sorted.
    pub fn held_by(&self, workflow_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .holders
            .iter()
            .filter(|(_, holder)| holder.as_str() == workflow_id)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.state.lock().roles.keys().cloned().collect();
        roles.sort();
        roles
    }

    fn lease(&self, role: &str, name: String) -> AgentLease {
        AgentLease {
            pool: self.clone(),
            role: role.to_string(),
            name,
        }
    }

    /// Hand `name` to the first live waiter, or put it back on the free list.
    fn release(&self, role: &str, name: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.holders.remove(name);
        let Some(slots) = state.roles.get_mut(role) else {
            return;
        };

        while let Some(waiter) = slots.waiters.pop_front() {
            if waiter.tx.send(name.to_string()).is_ok() {
                // The receiver may still drop before reading; its guard returns the agent.
                state.holders.insert(name.to_string(), waiter.workflow_id);
                return;
            }
        }
        debug!(role, agent = %name, "Agent released");
        slots.free.push_back(name.to_string());
    }
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool")
            .field("roles", &self.roles())
            .field("holders", &self.holders())
            .finish()
    }
}

/// Exclusive hold on one named agent. Dropping it releases the agent.
#[derive(Debug)]
pub struct AgentLease {
    pool: AgentPool,
    role: String,
    name: String,
}

impl AgentLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &str {
        &self.role
    }
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        self.pool.release(&self.role, &self.name);
    }
}

/// Queue position of an in-flight `acquire`.
struct PendingAcquire {
    pool: AgentPool,
    role: String,
    rx: oneshot::Receiver<String>,
    done: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.rx.close();
        if let Ok(name) = self.rx.try_recv() {
            self.pool.release(&self.role, &name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool() -> AgentPool {
        AgentPool::new(&BTreeMap::from([
            ("engineer".to_string(), vec!["Alex".to_string(), "Betty".to_string()]),
            ("planner".to_string(), vec!["Paula".to_string()]),
        ]))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = pool();
        let lease = pool.acquire("engineer", "wf-1").await.unwrap();
        assert_eq!(lease.name(), "Alex");
        assert_eq!(lease.role(), "engineer");
        assert_eq!(pool.available("engineer"), vec!["Betty".to_string()]);
        assert_eq!(pool.held_by("wf-1"), vec!["Alex".to_string()]);

        drop(lease);
        assert_eq!(pool.available("engineer"), vec!["Betty".to_string(), "Alex".to_string()]);
        assert!(pool.holders().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_role() {
        let pool = pool();
        let err = pool.acquire("reviewer", "wf-1").await.unwrap_err();
        assert_eq!(err, PoolError::UnknownRole("reviewer".to_string()));
        assert!(pool.try_acquire("reviewer", "wf-1").is_err());
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let pool = pool();
        let held = pool.acquire("planner", "wf-1").await.unwrap();

        let first = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("planner", "wf-2").await })
        };
        while pool.waiting("planner").is_empty() {
            tokio::task::yield_now().await;
        }
        let second = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("planner", "wf-3").await })
        };
        while pool.waiting("planner").len() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.waiting("planner"), vec!["wf-2".to_string(), "wf-3".to_string()]);
        assert!(pool.try_acquire("planner", "wf-4").unwrap().is_none());

        drop(held);
        let lease = first.await.unwrap().unwrap();
        assert_eq!(lease.name(), "Paula");
        assert_eq!(pool.held_by("wf-2"), vec!["Paula".to_string()]);

        drop(lease);
        let lease = second.await.unwrap().unwrap();
        assert_eq!(pool.held_by("wf-3"), vec!["Paula".to_string()]);
        drop(lease);
        assert_eq!(pool.available("planner"), vec!["Paula".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_gives_up_its_place() {
        let pool = pool();
        let held = pool.acquire("planner", "wf-1").await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            pool.acquire("planner", "wf-2"),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(pool.waiting("planner").is_empty());

        drop(held);
        assert_eq!(pool.available("planner"), vec!["Paula".to_string()]);
        assert!(pool.holders().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_waiters_are_pruned_on_enqueue() {
        let pool = pool();
        let held = pool.acquire("planner", "wf-1").await.unwrap();

        for n in 0..10 {
            let abandoned = tokio::time::timeout(
                Duration::from_millis(1),
                pool.acquire("planner", &format!("wf-gone-{n}")),
            )
            .await;
            assert!(abandoned.is_err());
        }

        let next = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("planner", "wf-next").await })
        };
        while pool.waiting("planner").is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.state.lock().roles["planner"].waiters.len(), 1);

        drop(held);
        let lease = next.await.unwrap().unwrap();
        assert_eq!(pool.held_by("wf-next"), vec!["Paula".to_string()]);
        drop(lease);
    }

    #[tokio::test]
    async fn test_lease_released_on_task_failure() {
        let pool = pool();
        let task = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _lease = pool.acquire("engineer", "wf-1").await?;
                Err::<(), PoolError>(PoolError::Closed("engineer".to_string()))
            })
        };
        assert!(task.await.unwrap().is_err());
        assert_eq!(pool.available("engineer").len(), 2);
    }

    #[test]
    fn test_from_default_config() {
        let pool = AgentPool::from_config(&PoolConfig::default());
        assert_eq!(pool.roles(), vec!["engineer".to_string()]);
        assert_eq!(pool.available("engineer").len(), 5);
    }
}
