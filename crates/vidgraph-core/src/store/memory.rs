//! In-memory [`GraphStore`] and [`JobStore`] implementations.
//!
//! Both use `HashMap`/`BTreeMap` behind `std::sync::RwLock`. A delta is
//! checked completely before the first mutation while the write lock is
//! held, which gives the same all-or-nothing behaviour as a transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::delta::{merge_properties, GraphDelta, Properties, WriteReport};
use crate::error::IngestError;
use crate::models::{JobStatus, JobUpdate, UploadJob};

use super::{GraphEdge, GraphNode, GraphSnapshot, GraphStats, GraphStore, JobStore};

type EdgeKey = (String, String, String);

#[derive(Default)]
struct GraphState {
    nodes: HashMap<String, GraphNode>,
    edges: BTreeMap<EdgeKey, Properties>,
}

/// In-memory graph for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryGraphStore {
    state: RwLock<GraphState>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, GraphState>, IngestError> {
        self.state
            .read()
            .map_err(|_| IngestError::Internal("graph lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, GraphState>, IngestError> {
        self.state
            .write()
            .map_err(|_| IngestError::Internal("graph lock poisoned".to_string()))
    }
}

fn edge(key: &EdgeKey, properties: &Properties) -> GraphEdge {
    GraphEdge {
        from_key: key.0.clone(),
        relation_type: key.1.clone(),
        to_key: key.2.clone(),
        properties: properties.clone(),
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn apply_delta(&self, delta: &GraphDelta) -> Result<WriteReport, IngestError> {
        let mut state = self.write()?;

        // Check everything first; nothing below may fail.
        for node in delta.nodes() {
            if let Some(existing) = state.nodes.get(&node.natural_key) {
                if existing.label != node.label {
                    return Err(IngestError::ConstraintViolation(format!(
                        "node {} already exists with label {}, not {}",
                        node.natural_key, existing.label, node.label
                    )));
                }
            }
        }
        let delta_keys: HashSet<&str> = delta
            .nodes()
            .iter()
            .map(|n| n.natural_key.as_str())
            .collect();
        for rel in delta.relationships() {
            for key in [&rel.from_key, &rel.to_key] {
                if !delta_keys.contains(key.as_str()) && !state.nodes.contains_key(key) {
                    return Err(IngestError::ConstraintViolation(format!(
                        "relationship {} references unknown node {}",
                        rel.relation_type, key
                    )));
                }
            }
        }

        let mut report = WriteReport {
            attempts: 1,
            ..Default::default()
        };
        for node in delta.nodes() {
            match state.nodes.get_mut(&node.natural_key) {
                Some(existing) => {
                    merge_properties(&mut existing.properties, &node.properties);
                    report.nodes_updated += 1;
                }
                None => {
                    state.nodes.insert(
                        node.natural_key.clone(),
                        GraphNode {
                            natural_key: node.natural_key.clone(),
                            label: node.label.clone(),
                            properties: node.properties.clone(),
                        },
                    );
                    report.nodes_created += 1;
                }
            }
        }
        for rel in delta.relationships() {
            let key = (
                rel.from_key.clone(),
                rel.relation_type.clone(),
                rel.to_key.clone(),
            );
            match state.edges.get_mut(&key) {
                Some(props) => {
                    merge_properties(props, &rel.properties);
                    report.relationships_updated += 1;
                }
                None => {
                    state.edges.insert(key, rel.properties.clone());
                    report.relationships_created += 1;
                }
            }
        }
        Ok(report)
    }

    async fn get_node(&self, natural_key: &str) -> Result<Option<GraphNode>, IngestError> {
        Ok(self.read()?.nodes.get(natural_key).cloned())
    }

    async fn neighbors(&self, natural_key: &str) -> Result<Vec<GraphEdge>, IngestError> {
        let state = self.read()?;
        Ok(state
            .edges
            .iter()
            .filter(|(k, _)| k.0 == natural_key || k.2 == natural_key)
            .map(|(k, p)| edge(k, p))
            .collect())
    }

    async fn nodes_by_label(
        &self,
        label: &str,
        limit: usize,
    ) -> Result<Vec<GraphNode>, IngestError> {
        let state = self.read()?;
        let mut nodes: Vec<GraphNode> = state
            .nodes
            .values()
            .filter(|n| n.label == label)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        nodes.truncate(limit);
        Ok(nodes)
    }

    async fn nodes_by_property(
        &self,
        label: &str,
        property: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<GraphNode>, IngestError> {
        let state = self.read()?;
        let mut nodes: Vec<GraphNode> = state
            .nodes
            .values()
            .filter(|n| n.label == label)
            .filter(|n| n.properties.get(property).is_some_and(|p| p.matches_text(value)))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        nodes.truncate(limit);
        Ok(nodes)
    }

    async fn snapshot(&self, limit: usize) -> Result<GraphSnapshot, IngestError> {
        let state = self.read()?;
        let mut nodes: Vec<GraphNode> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        nodes.truncate(limit);
        let keys: HashSet<&str> = nodes.iter().map(|n| n.natural_key.as_str()).collect();
        let relationships = state
            .edges
            .iter()
            .filter(|(k, _)| keys.contains(k.0.as_str()) && keys.contains(k.2.as_str()))
            .map(|(k, p)| edge(k, p))
            .collect();
        Ok(GraphSnapshot {
            nodes,
            relationships,
        })
    }

    async fn stats(&self) -> Result<GraphStats, IngestError> {
        let state = self.read()?;
        Ok(GraphStats {
            nodes: state.nodes.len() as u64,
            relationships: state.edges.len() as u64,
        })
    }
}

/// Bounded in-memory job table.
///
/// When full, inserting evicts the terminal job that finished longest ago;
/// if every job is still in flight the insert fails.
pub struct InMemoryJobStore {
    capacity: usize,
    jobs: RwLock<HashMap<String, UploadJob>>,
}

impl InMemoryJobStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, UploadJob>>> {
        self.jobs
            .read()
            .map_err(|_| anyhow::anyhow!("job table lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, UploadJob>>> {
        self.jobs
            .write()
            .map_err(|_| anyhow::anyhow!("job table lock poisoned"))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &UploadJob) -> Result<()> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            bail!("job {} already exists", job.id);
        }
        if jobs.len() >= self.capacity {
            let evict = jobs
                .values()
                .filter(|j| j.status.is_terminal())
                .min_by_key(|j| j.updated_at)
                .map(|j| j.id.clone());
            match evict {
                Some(id) => {
                    jobs.remove(&id);
                }
                None => bail!("job table is full ({} jobs in flight)", jobs.len()),
            }
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UploadJob>> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn transition(&self, id: &str, to: JobStatus, update: &JobUpdate) -> Result<UploadJob> {
        let mut jobs = self.write()?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("job not found: {}", id))?;
        job.apply(to, update)?;
        Ok(job.clone())
    }

    async fn record_attempt(&self, id: &str) -> Result<u32> {
        let mut jobs = self.write()?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("job not found: {}", id))?;
        job.attempts += 1;
        job.updated_at = chrono::Utc::now();
        Ok(job.attempts)
    }

    async fn find_active_by_hash(&self, content_hash: &str) -> Result<Option<UploadJob>> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .filter(|j| j.content_hash.as_deref() == Some(content_hash))
            .min_by_key(|j| j.created_at)
            .cloned())
    }

    async fn list_unfinished(&self) -> Result<Vec<UploadJob>> {
        let jobs = self.read()?;
        let mut unfinished: Vec<UploadJob> = jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        unfinished.sort_by_key(|j| j.created_at);
        Ok(unfinished)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<UploadJob>> {
        let jobs = self.read()?;
        let mut recent: Vec<UploadJob> = jobs.values().cloned().collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(limit);
        Ok(recent)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.write()?.remove(id);
        Ok(())
    }
}
