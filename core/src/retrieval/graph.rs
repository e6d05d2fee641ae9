//! Graph-memory adjacency cache over `entities`/`relations` (§3, SPEC_FULL supplement).
//!
//! Load-on-demand, compact-on-threshold (every 200 appends); in-memory is the source
//! of truth during a session, writes go to both memory and the append log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::error::CoreResult;
use crate::storage::record::{Entity, Relation};
use crate::storage::{Storage, Stream};

const COMPACT_EVERY: u64 = 200;
const HALF_LIFE_DAYS: f64 = 30.0;
const DECAY_FLOOR: f64 = 0.05;

fn time_decay(last_seen_ms: i64, now_ms: i64) -> f64 {
    let days_ago = ((now_ms - last_seen_ms).max(0) as f64) / 86_400_000.0;
    let decayed = (-std::f64::consts::LN_2 / HALF_LIFE_DAYS * days_ago).exp();
    decayed.max(DECAY_FLOOR)
}

pub struct GraphMemory {
    storage: Storage,
    entities: DashMap<String, Entity>,
    /// source_id -> list of relation ids, for BFS adjacency.
    adjacency: DashMap<String, Vec<String>>,
    relations: DashMap<String, Relation>,
    appends_since_compact: AtomicU64,
    loaded: std::sync::atomic::AtomicBool,
}

impl GraphMemory {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            entities: DashMap::new(),
            adjacency: DashMap::new(),
            relations: DashMap::new(),
            appends_since_compact: AtomicU64::new(0),
            loaded: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn ensure_loaded(&self) -> CoreResult<()> {
        if self.loaded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for entity in self.storage.read::<Entity>(Stream::Entities, None)? {
            self.entities.insert(entity.id.clone(), entity);
        }
        for relation in self.storage.read::<Relation>(Stream::Relations, None)? {
            self.adjacency
                .entry(relation.source_id.clone())
                .or_default()
                .push(relation.id.clone());
            self.relations.insert(relation.id.clone(), relation);
        }
        Ok(())
    }

    pub fn upsert_entity(&self, mut entity: Entity) -> CoreResult<()> {
        self.ensure_loaded()?;
        if let Some(mut existing) = self.entities.get_mut(&entity.id) {
            existing.mention_count += 1;
            existing.last_seen_ms = entity.last_seen_ms;
            for alias in entity.aliases.drain(..) {
                if !existing.aliases.contains(&alias) {
                    existing.aliases.push(alias);
                }
            }
        } else {
            self.entities.insert(entity.id.clone(), entity.clone());
        }
        let current = self.entities.get(&entity.id).unwrap().clone();
        self.storage.append(Stream::Entities, &current)?;
        self.maybe_compact()?;
        Ok(())
    }

    pub fn upsert_relation(&self, source_id: &str, target_id: &str, predicate: &str, now_ms: i64) -> CoreResult<()> {
        self.ensure_loaded()?;
        let id = Relation::id_for(source_id, target_id, predicate);
        let relation = if let Some(mut existing) = self.relations.get_mut(&id) {
            existing.strengthen(now_ms);
            existing.clone()
        } else {
            let fresh = Relation {
                id: id.clone(),
                source_id: source_id.to_string(),
                target_id: target_id.to_string(),
                predicate: predicate.to_string(),
                weight: 0.5,
                first_seen_ms: now_ms,
                last_seen_ms: now_ms,
                mention_count: 1,
            };
            self.relations.insert(id.clone(), fresh.clone());
            self.adjacency
                .entry(source_id.to_string())
                .or_default()
                .push(id.clone());
            fresh
        };
        self.storage.append(Stream::Relations, &relation)?;
        self.maybe_compact()?;
        Ok(())
    }

    fn maybe_compact(&self) -> CoreResult<()> {
        let count = self.appends_since_compact.fetch_add(1, Ordering::SeqCst) + 1;
        if count < COMPACT_EVERY {
            return Ok(());
        }
        self.appends_since_compact.store(0, Ordering::SeqCst);
        self.storage
            .compact::<Entity, String, _>(Stream::Entities, |e| e.id.clone())?;
        self.storage
            .compact::<Relation, String, _>(Stream::Relations, |r| r.id.clone())?;
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> CoreResult<Option<Entity>> {
        self.ensure_loaded()?;
        let id = Entity::id_for(name);
        Ok(self.entities.get(&id).map(|e| e.clone()))
    }

    /// Multi-hop BFS from seed entities. Beam width 10 per hop, default 2 hops,
    /// discards edges with score < 0.1.
    pub fn graph_context(&self, seed_names: &[String], now_ms: i64, hops: u32, limit: usize) -> CoreResult<Vec<(Entity, f64)>> {
        self.ensure_loaded()?;
        const BEAM_WIDTH: usize = 10;
        const MIN_SCORE: f64 = 0.1;

        let mut visited: HashMap<String, f64> = HashMap::new();
        let mut frontier: Vec<String> = Vec::new();
        for name in seed_names {
            if let Some(id) = self.entities.iter().find(|e| &e.name == name).map(|e| e.id.clone()) {
                visited.insert(id.clone(), 1.0);
                frontier.push(id);
            }
        }

        for _ in 0..hops {
            let mut next_frontier: Vec<(String, f64)> = Vec::new();
            for node_id in &frontier {
                let base_score = *visited.get(node_id).unwrap_or(&1.0);
                if let Some(relation_ids) = self.adjacency.get(node_id) {
                    for relation_id in relation_ids.iter() {
                        if let Some(relation) = self.relations.get(relation_id) {
                            let edge_score = relation.weight * time_decay(relation.last_seen_ms, now_ms);
                            if edge_score < MIN_SCORE {
                                continue;
                            }
                            let propagated = base_score * edge_score;
                            let entry = visited.entry(relation.target_id.clone()).or_insert(0.0);
                            if propagated > *entry {
                                *entry = propagated;
                            }
                            next_frontier.push((relation.target_id.clone(), propagated));
                        }
                    }
                }
            }
            next_frontier.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            next_frontier.truncate(BEAM_WIDTH);
            frontier = next_frontier.into_iter().map(|(id, _)| id).collect();
            if frontier.is_empty() {
                break;
            }
        }

        let mut results: Vec<(Entity, f64)> = visited
            .into_iter()
            .filter_map(|(id, score)| self.entities.get(&id).map(|e| (e.clone(), score)))
            .collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::EntityType;

    fn entity(name: &str, now: i64) -> Entity {
        Entity {
            id: Entity::id_for(name),
            name: name.to_string(),
            kind: EntityType::Concept,
            aliases: vec![],
            first_seen_ms: now,
            last_seen_ms: now,
            mention_count: 1,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn bfs_finds_one_hop_neighbor() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        let graph = GraphMemory::new(storage);
        let now = 1_000_000_000_000i64;
        graph.upsert_entity(entity("alice", now)).unwrap();
        graph.upsert_entity(entity("bob", now)).unwrap();
        let alice_id = Entity::id_for("alice");
        let bob_id = Entity::id_for("bob");
        graph.upsert_relation(&alice_id, &bob_id, "knows", now).unwrap();

        let hits = graph.graph_context(&["alice".to_string()], now, 2, 10).unwrap();
        assert!(hits.iter().any(|(e, _)| e.name == "bob"));
    }

    #[test]
    fn decayed_edge_below_floor_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        let graph = GraphMemory::new(storage);
        let now = 1_000_000_000_000i64;
        let old = now - 400 * 86_400_000;
        graph.upsert_entity(entity("alice", old)).unwrap();
        graph.upsert_entity(entity("carol", old)).unwrap();
        let alice_id = Entity::id_for("alice");
        let carol_id = Entity::id_for("carol");
        graph.upsert_relation(&alice_id, &carol_id, "knows", old).unwrap();

        let hits = graph.graph_context(&["alice".to_string()], now, 1, 10).unwrap();
        assert!(!hits.iter().any(|(e, _)| e.name == "carol"));
    }
}
