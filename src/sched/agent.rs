use std::collections::{HashMap, HashSet};

use tracing::info;

use crate::error::{BatchdError, Result};
use crate::net::ConnId;

/// Scheduler-side view of one logged-in agent.
#[derive(Debug)]
pub struct AgentSession {
    pub node: String,
    /// Jobs dispatched to this agent and not yet reported finished.
    pub running: HashSet<u64>,
}

/// Roster of logged-in agents, keyed by connection id with a node-name
/// index. Queues address agents by node; completion reports and dispatch
/// ownership checks go by connection.
#[derive(Debug, Default)]
pub struct AgentRoster {
    agents: HashMap<ConnId, AgentSession>,
    by_node: HashMap<String, ConnId>,
}

impl AgentRoster {
    pub fn login(&mut self, conn: ConnId, node: &str) -> Result<()> {
        if self.by_node.contains_key(node) {
            return Err(BatchdError::AlreadyExists(format!(
                "agent for node {node} already logged in"
            )));
        }
        info!(conn, node, "agent logged in");
        self.agents.insert(
            conn,
            AgentSession {
                node: node.to_string(),
                running: HashSet::new(),
            },
        );
        self.by_node.insert(node.to_string(), conn);
        Ok(())
    }

    /// Drop an agent, returning its session so the caller can reconcile the
    /// jobs it owned.
    pub fn logout(&mut self, conn: ConnId) -> Option<AgentSession> {
        let session = self.agents.remove(&conn)?;
        self.by_node.remove(&session.node);
        info!(conn, node = %session.node, "agent logged out");
        Some(session)
    }

    pub fn conn_for_node(&self, node: &str) -> Option<ConnId> {
        self.by_node.get(node).copied()
    }

    pub fn node_of(&self, conn: ConnId) -> Option<&str> {
        self.agents.get(&conn).map(|a| a.node.as_str())
    }

    pub fn assign(&mut self, conn: ConnId, job_id: u64) {
        if let Some(agent) = self.agents.get_mut(&conn) {
            agent.running.insert(job_id);
        }
    }

    /// True if this connection owns the running job.
    pub fn owns(&self, conn: ConnId, job_id: u64) -> bool {
        self.agents
            .get(&conn)
            .is_some_and(|a| a.running.contains(&job_id))
    }

    /// The connection that owns a running job, if any agent does.
    pub fn owner_of(&self, job_id: u64) -> Option<ConnId> {
        self.agents
            .iter()
            .find(|(_, a)| a.running.contains(&job_id))
            .map(|(conn, _)| *conn)
    }

    pub fn unassign(&mut self, conn: ConnId, job_id: u64) {
        if let Some(agent) = self.agents.get_mut(&conn) {
            agent.running.remove(&job_id);
        }
    }
}
