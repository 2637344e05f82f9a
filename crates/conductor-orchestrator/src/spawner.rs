use crate::agent::Agent;
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// A request handed to a spawn factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Factory key; also the worker's specialization.
    pub specialization: String,
    /// Id the new agent must use.
    pub agent_id: String,
    /// The agent this one replaces, when spawned by the supervisor.
    #[serde(default)]
    pub replaces: Option<String>,
}

/// Builds an agent for a request. The spawner starts it.
pub type SpawnFactory = Arc<dyn Fn(&SpawnRequest) -> ConductorResult<Arc<dyn Agent>> + Send + Sync>;

/// Registry of spawn factories by specialization, plus the live agent
/// handles it created.
pub struct AgentSpawner {
    factories: RwLock<HashMap<String, SpawnFactory>>,
    agents: RwLock<BTreeMap<String, Arc<dyn Agent>>>,
    next_id: AtomicU64,
}

impl AgentSpawner {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            agents: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, specialization: impl Into<String>, factory: SpawnFactory) {
        self.factories.write().insert(specialization.into(), factory);
    }

    pub fn has_factory(&self, specialization: &str) -> bool {
        self.factories.read().contains_key(specialization)
    }

    fn next_agent_id(&self, specialization: &str) -> String {
        loop {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            let id = format!("{specialization}-{n}");
            if !self.agents.read().contains_key(&id) {
                return id;
            }
        }
    }

    /// Build and start a new agent of `specialization`; returns its id.
    pub async fn spawn(
        &self,
        specialization: &str,
        replaces: Option<&str>,
    ) -> ConductorResult<String> {
        let factory = self
            .factories
            .read()
            .get(specialization)
            .cloned()
            .ok_or_else(|| {
                ConductorError::Orchestrator(format!(
                    "no spawn factory registered for '{specialization}'"
                ))
            })?;

        let request = SpawnRequest {
            specialization: specialization.to_string(),
            agent_id: self.next_agent_id(specialization),
            replaces: replaces.map(str::to_string),
        };
        let agent = factory(&request)?;
        let id = agent.id().to_string();
        self.agents.write().insert(id.clone(), Arc::clone(&agent));
        agent.start().await?;

        info!(agent_id = %id, specialization, replaces = ?request.replaces, "Agent spawned");
        Ok(id)
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.read().keys().cloned().collect()
    }

    /// Stop an agent and forget its handle. Returns false if unknown.
    pub async fn stop(&self, agent_id: &str) -> ConductorResult<bool> {
        let agent = self.agents.write().remove(agent_id);
        match agent {
            Some(agent) => {
                agent.stop().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn stop_all(&self) -> ConductorResult<()> {
        let agents: Vec<Arc<dyn Agent>> = std::mem::take(&mut *self.agents.write())
            .into_values()
            .collect();
        for agent in agents {
            agent.stop().await?;
        }
        Ok(())
    }
}

impl Default for AgentSpawner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::AgentKind;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct FakeAgent {
        id: String,
        running: AtomicBool,
    }

    #[async_trait]
    impl Agent for FakeAgent {
        fn id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> AgentKind {
            AgentKind::worker("fake")
        }
        async fn start(&self) -> ConductorResult<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> ConductorResult<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn pause(&self) -> ConductorResult<()> {
            Ok(())
        }
        async fn resume(&self) -> ConductorResult<()> {
            Ok(())
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    fn fake_factory() -> SpawnFactory {
        Arc::new(|req: &SpawnRequest| {
            Ok(Arc::new(FakeAgent {
                id: req.agent_id.clone(),
                running: AtomicBool::new(false),
            }) as Arc<dyn Agent>)
        })
    }

    #[tokio::test]
    async fn test_spawn_starts_agent() {
        let spawner = AgentSpawner::new();
        spawner.register("backend", fake_factory());
        let id = spawner.spawn("backend", None).await.unwrap();
        assert!(id.starts_with("backend-"));
        assert!(spawner.get(&id).unwrap().is_running());
    }

    #[tokio::test]
    async fn test_spawn_unknown_specialization() {
        let spawner = AgentSpawner::new();
        let err = spawner.spawn("frontend", None).await.unwrap_err();
        assert!(err.to_string().contains("no spawn factory"));
        assert!(!spawner.has_factory("frontend"));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let spawner = AgentSpawner::new();
        spawner.register("qa", fake_factory());
        let a = spawner.spawn("qa", None).await.unwrap();
        let b = spawner.spawn("qa", Some(&a)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(spawner.agent_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_forgets_handle() {
        let spawner = AgentSpawner::new();
        spawner.register("qa", fake_factory());
        let id = spawner.spawn("qa", None).await.unwrap();
        let handle = spawner.get(&id).unwrap();
        assert!(spawner.stop(&id).await.unwrap());
        assert!(!handle.is_running());
        assert!(spawner.get(&id).is_none());
        assert!(!spawner.stop(&id).await.unwrap());
    }
}
