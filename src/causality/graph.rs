//! The causality graph: an in-memory DAG over streams, events and commands.
//!
//! Built once by replaying the log ([`CausalityGraph::populate`]) and kept
//! live as events and commands are appended. All access goes through the
//! [`GraphGate`], so readers never observe a half-applied update.
//!
//! # Invariants
//!
//! - The `Stream` edges of one physical stream form a simple path ordered by
//!   version, starting at the stream vertex.
//! - No edge may close a cycle; insertion checks reachability first.
//! - Every event occurrence stores the chain hash up to itself.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::causality::gate::{CancellationToken, GateState, GraphGate, PauseGuard};
use crate::causality::hash::{chain_all, chain_hash, stream_hash};
use crate::causality::vertex::{
    CommandVertex, Edge, EdgeKind, EventVertex, Occurrence, StreamVertex, Vertex, VertexId,
};
use crate::error::{CorruptionError, ExecutionError, KyroError, KyroResult};
use crate::message::{Command, ContentHash, Event, MessageId};
use crate::storage::CommandLog;
use crate::stream::{StreamFilter, StreamKey, StreamRef, StreamRegistry, StreamVersion, TimelineId};
use crate::time::LogicalTime;

/// Upper bound on ancestor hops before a chain is treated as corrupt.
const MAX_ANCESTRY: usize = 1024;

/// How often long traversals poll their cancellation token.
const CANCEL_POLL: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

/// Population summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PopulateStats {
    /// Streams registered.
    pub streams: usize,
    /// Event occurrences linked.
    pub events: usize,
    /// Commands linked.
    pub commands: usize,
}

/// Graph size summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphStats {
    /// Stream vertices.
    pub streams: usize,
    /// Event vertices.
    pub events: usize,
    /// Command vertices.
    pub commands: usize,
    /// Edges.
    pub edges: usize,
}

#[derive(Debug, Clone)]
struct StreamChain {
    parent: Option<StreamRef>,
    seed: ContentHash,
    events: Vec<MessageId>,
}

impl StreamChain {
    fn base(&self) -> u64 {
        self.parent.as_ref().map_or(0, |p| p.version.count())
    }

    fn count(&self) -> u64 {
        self.base() + self.events.len() as u64
    }
}

#[derive(Debug, Default)]
struct GraphData {
    vertices: HashMap<VertexId, Vertex>,
    outgoing: HashMap<VertexId, Vec<Edge>>,
    incoming: HashMap<VertexId, Vec<Edge>>,
    streams: HashMap<StreamKey, StreamChain>,
    // Dependents whose ancestor or command vertex has not arrived yet.
    waiting: HashMap<MessageId, Vec<(VertexId, EdgeKind)>>,
}

fn not_found(key: &StreamKey) -> KyroError {
    ExecutionError::StreamNotFound {
        key: key.to_string(),
    }
    .into()
}

fn hop_limit(key: &StreamKey) -> KyroError {
    KyroError::internal(format!("ancestor chain of {key} exceeded hop limit"))
}

impl GraphData {
    fn chain(&self, key: &StreamKey) -> KyroResult<&StreamChain> {
        self.streams.get(key).ok_or_else(|| not_found(key))
    }

    fn event(&self, id: MessageId) -> Option<&EventVertex> {
        match self.vertices.get(&VertexId::Message(id)) {
            Some(Vertex::Event(e)) => Some(e),
            _ => None,
        }
    }

    fn event_mut(&mut self, id: MessageId) -> Option<&mut EventVertex> {
        match self.vertices.get_mut(&VertexId::Message(id)) {
            Some(Vertex::Event(e)) => Some(e),
            _ => None,
        }
    }

    fn dangling(key: &StreamKey, id: MessageId) -> KyroError {
        CorruptionError::DanglingEvent {
            key: key.to_string(),
            message: id,
        }
        .into()
    }

    fn parent_chain(
        &self,
        key: &StreamKey,
        chain: &StreamChain,
    ) -> KyroResult<(StreamKey, &StreamChain)> {
        let parent = chain
            .parent
            .as_ref()
            .ok_or_else(|| KyroError::internal(format!("{key} has no parent to resolve")))?;
        let found = self.streams.get(&parent.key).ok_or_else(|| {
            KyroError::from(CorruptionError::DanglingParent {
                key: key.to_string(),
                parent: parent.key.to_string(),
            })
        })?;
        Ok((parent.key.clone(), found))
    }

    /// Chain hash after the first `count` logical events of `key`.
    fn chain_at(&self, key: &StreamKey, count: u64) -> KyroResult<ContentHash> {
        let mut key = key.clone();
        for _ in 0..MAX_ANCESTRY {
            if count == 0 {
                return Ok(ContentHash::ZERO);
            }
            let chain = self.chain(&key)?;
            let base = chain.base();
            if count > base {
                let index = usize::try_from(count - base - 1).unwrap_or(usize::MAX);
                let id = *chain
                    .events
                    .get(index)
                    .ok_or_else(|| {
                        KyroError::internal(format!("{key} holds fewer than {count} events"))
                    })?;
                let occurrence = self
                    .event(id)
                    .and_then(|e| e.occurrences.get(&key))
                    .ok_or_else(|| Self::dangling(&key, id))?;
                return Ok(occurrence.chain);
            }
            key = self.parent_chain(&key, chain)?.0;
        }
        Err(hop_limit(&key))
    }

    /// Message ids of the first `count` logical events of `key`.
    fn resolved_ids(&self, key: &StreamKey, count: u64) -> KyroResult<Vec<MessageId>> {
        let mut segments: Vec<&[MessageId]> = Vec::new();
        let mut key = key.clone();
        let mut count = count;
        for _ in 0..MAX_ANCESTRY {
            let chain = self.chain(&key)?;
            let base = chain.base();
            if count > base {
                let own = usize::try_from(count - base).unwrap_or(usize::MAX);
                let own = own.min(chain.events.len());
                segments.push(&chain.events[..own]);
                count = base;
            }
            if count == 0 {
                return Ok(segments.into_iter().rev().flatten().copied().collect());
            }
            key = self.parent_chain(&key, chain)?.0;
        }
        Err(hop_limit(&key))
    }

    /// Timestamps of the first `count` logical events of `key`, each taken
    /// from the physical stream that holds it.
    fn resolved_stamps(&self, key: &StreamKey, count: u64) -> KyroResult<Vec<LogicalTime>> {
        let mut segments: Vec<Vec<LogicalTime>> = Vec::new();
        let mut key = key.clone();
        let mut count = count;
        for _ in 0..MAX_ANCESTRY {
            let chain = self.chain(&key)?;
            let base = chain.base();
            if count > base {
                let own = usize::try_from(count - base).unwrap_or(usize::MAX);
                let stamps = chain.events[..own.min(chain.events.len())]
                    .iter()
                    .map(|id| {
                        self.event(*id)
                            .and_then(|e| e.occurrences.get(&key))
                            .map(|o| o.timestamp)
                            .ok_or_else(|| Self::dangling(&key, *id))
                    })
                    .collect::<KyroResult<Vec<_>>>()?;
                segments.push(stamps);
                count = base;
            }
            if count == 0 {
                return Ok(segments.into_iter().rev().flatten().collect());
            }
            key = self.parent_chain(&key, chain)?.0;
        }
        Err(hop_limit(&key))
    }

    fn timestamp_at(&self, key: &StreamKey, version: u64) -> KyroResult<Option<LogicalTime>> {
        let mut key = key.clone();
        for _ in 0..MAX_ANCESTRY {
            let Some(chain) = self.streams.get(&key) else {
                return Ok(None);
            };
            let base = chain.base();
            if version >= base {
                let index = usize::try_from(version - base).unwrap_or(usize::MAX);
                return Ok(chain
                    .events
                    .get(index)
                    .and_then(|id| self.event(*id))
                    .and_then(|e| e.occurrences.get(&key))
                    .map(|o| o.timestamp));
            }
            key = self.parent_chain(&key, chain)?.0;
        }
        Err(hop_limit(&key))
    }

    fn neighbours<'a>(
        &'a self,
        id: &VertexId,
        kind: EdgeKind,
        direction: Direction,
    ) -> impl Iterator<Item = &'a VertexId> + 'a {
        let edges = match direction {
            Direction::Forward => self.outgoing.get(id),
            Direction::Backward => self.incoming.get(id),
        };
        edges
            .into_iter()
            .flatten()
            .filter(move |e| e.kind == kind)
            .map(move |e| match direction {
                Direction::Forward => &e.to,
                Direction::Backward => &e.from,
            })
    }

    fn reachable(&self, start: &VertexId, target: &VertexId) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(v) = stack.pop() {
            if v == target {
                return true;
            }
            if !seen.insert(v) {
                continue;
            }
            if let Some(edges) = self.outgoing.get(v) {
                stack.extend(edges.iter().map(|e| &e.to));
            }
        }
        false
    }

    /// Rejects `from -> to` if it would close a cycle.
    fn check_acyclic(&self, from: &VertexId, to: &VertexId) -> KyroResult<()> {
        let has_outgoing = self.outgoing.get(to).is_some_and(|e| !e.is_empty());
        if from == to || (has_outgoing && self.reachable(to, from)) {
            return Err(CorruptionError::Cycle {
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn insert_edge(&mut self, edge: Edge) {
        let out = self.outgoing.entry(edge.from.clone()).or_default();
        if out.contains(&edge) {
            return;
        }
        out.push(edge.clone());
        self.incoming.entry(edge.to.clone()).or_default().push(edge);
    }

    fn remove_edge(&mut self, edge: &Edge) {
        if let Some(out) = self.outgoing.get_mut(&edge.from) {
            out.retain(|e| e != edge);
        }
        if let Some(inc) = self.incoming.get_mut(&edge.to) {
            inc.retain(|e| e != edge);
        }
    }

    fn link_or_wait(
        &mut self,
        source: MessageId,
        target: &VertexId,
        kind: EdgeKind,
    ) -> KyroResult<()> {
        let from = VertexId::Message(source);
        if self.vertices.contains_key(&from) {
            self.check_acyclic(&from, target)?;
            self.insert_edge(Edge {
                from,
                to: target.clone(),
                kind,
                stream: None,
            });
        } else {
            self.waiting
                .entry(source)
                .or_default()
                .push((target.clone(), kind));
        }
        Ok(())
    }

    /// Links dependents that arrived before `id`.
    fn release_waiting(&mut self, id: MessageId) -> KyroResult<()> {
        let from = VertexId::Message(id);
        for (to, kind) in self.waiting.remove(&id).unwrap_or_default() {
            if self.vertices.contains_key(&to) {
                self.check_acyclic(&from, &to)?;
                self.insert_edge(Edge {
                    from: from.clone(),
                    to,
                    kind,
                    stream: None,
                });
            }
        }
        Ok(())
    }

    fn remove_vertex(&mut self, id: &VertexId) {
        self.vertices.remove(id);
        for edge in self.outgoing.remove(id).unwrap_or_default() {
            if let Some(inc) = self.incoming.get_mut(&edge.to) {
                inc.retain(|e| e != &edge);
            }
            // A later re-append of this message must relink its dependents.
            if let (VertexId::Message(source), true) =
                (id, edge.kind != EdgeKind::Stream && self.vertices.contains_key(&edge.to))
            {
                self.waiting
                    .entry(*source)
                    .or_default()
                    .push((edge.to.clone(), edge.kind));
            }
        }
        for edge in self.incoming.remove(id).unwrap_or_default() {
            if let Some(out) = self.outgoing.get_mut(&edge.from) {
                out.retain(|e| e != &edge);
            }
        }
        for deps in self.waiting.values_mut() {
            deps.retain(|(v, _)| v != id);
        }
        self.waiting.retain(|_, deps| !deps.is_empty());
    }

    fn refresh_stream_vertex(&mut self, key: &StreamKey) -> KyroResult<()> {
        let chain = self.chain(key)?;
        let count = chain.count();
        let hash = match chain.events.last() {
            Some(id) => {
                self.event(*id)
                    .and_then(|e| e.occurrences.get(key))
                    .ok_or_else(|| Self::dangling(key, *id))?
                    .chain
            }
            None => chain.seed,
        };
        if let Some(Vertex::Stream(s)) = self.vertices.get_mut(&VertexId::Stream(key.clone())) {
            s.version = StreamVersion::from_count(count);
            s.hash = hash;
        }
        Ok(())
    }

    fn register_stream(&mut self, key: &StreamKey, parent: Option<StreamRef>) -> KyroResult<()> {
        if self.streams.contains_key(key) {
            return Ok(());
        }
        let seed = match &parent {
            Some(p) => {
                if !self.streams.contains_key(&p.key) {
                    return Err(CorruptionError::DanglingParent {
                        key: key.to_string(),
                        parent: p.key.to_string(),
                    }
                    .into());
                }
                self.chain_at(&p.key, p.version.count())?
            }
            None => ContentHash::ZERO,
        };
        let chain = StreamChain {
            parent,
            seed,
            events: Vec::new(),
        };
        self.vertices.insert(
            VertexId::Stream(key.clone()),
            Vertex::Stream(StreamVertex {
                key: key.clone(),
                version: StreamVersion::from_count(chain.count()),
                hash: seed,
            }),
        );
        self.streams.insert(key.clone(), chain);
        Ok(())
    }

    fn append(&mut self, event: &Event) -> KyroResult<()> {
        let key = &event.stream;
        let id = VertexId::Message(event.message_id);
        let chain = self.chain(key)?;
        let next = chain.count();

        if let Some(existing) = self.event(event.message_id) {
            if existing.occurrences.get(key).is_some_and(|o| o.version == event.version) {
                return Ok(());
            }
            if existing.leaf != event.content_hash {
                return Err(CorruptionError::HashMismatch {
                    key: key.to_string(),
                    stored: existing.leaf.to_string(),
                    recomputed: event.content_hash.to_string(),
                }
                .into());
            }
        } else if self.vertices.contains_key(&id) {
            return Err(KyroError::internal(format!(
                "message {} is already recorded as a command",
                event.message_id
            )));
        }
        let own = Some(event.message_id);
        if event.ancestor_id == own || event.command_id == own {
            return Err(CorruptionError::Cycle {
                from: id.to_string(),
                to: id.to_string(),
            }
            .into());
        }
        if event.version != next {
            return Err(CorruptionError::VersionGap {
                key: key.to_string(),
                expected: next,
                found: event.version,
            }
            .into());
        }

        let (prev_vertex, prev_chain) = match chain.events.last() {
            Some(last) => {
                let occurrence = self
                    .event(*last)
                    .and_then(|e| e.occurrences.get(key))
                    .ok_or_else(|| Self::dangling(key, *last))?;
                (VertexId::Message(*last), occurrence.chain)
            }
            None => (VertexId::Stream(key.clone()), chain.seed),
        };
        self.check_acyclic(&prev_vertex, &id)?;

        let is_new = !self.vertices.contains_key(&id);
        if is_new {
            if let Some(ancestor) = event.ancestor_id {
                if let Some(cause) = self.vertices.get(&VertexId::Message(ancestor)) {
                    if cause.timestamp().is_some_and(|t| t > event.timestamp) {
                        warn!(
                            event = %event.message_id,
                            ancestor = %ancestor,
                            "causal ancestor is stamped after its dependent"
                        );
                    }
                }
            }
            self.vertices
                .insert(id.clone(), Vertex::Event(EventVertex::from_event(event)));
        }

        let occurrence = Occurrence {
            version: event.version,
            chain: chain_hash(&prev_chain, &event.content_hash),
            timestamp: event.timestamp,
        };
        if let Some(vertex) = self.event_mut(event.message_id) {
            vertex.occurrences.insert(key.clone(), occurrence);
        }
        self.insert_edge(Edge {
            from: prev_vertex,
            to: id.clone(),
            kind: EdgeKind::Stream,
            stream: Some(key.clone()),
        });
        if let Some(chain) = self.streams.get_mut(key) {
            chain.events.push(event.message_id);
        }

        if is_new {
            if let Some(ancestor) = event.ancestor_id {
                self.link_or_wait(ancestor, &id, EdgeKind::Causality)?;
            }
            if let Some(command) = event.command_id {
                self.link_or_wait(command, &id, EdgeKind::Command)?;
            }
            self.release_waiting(event.message_id)?;
        }
        self.refresh_stream_vertex(key)
    }

    /// Appends a batch in order. If any event is refused, every stream the
    /// batch touched is trimmed back to where it started.
    fn append_all(&mut self, events: &[Event]) -> KyroResult<()> {
        let mut started: Vec<(StreamKey, u64)> = Vec::new();
        for event in events {
            if !started.iter().any(|(key, _)| key == &event.stream) {
                if let Some(chain) = self.streams.get(&event.stream) {
                    started.push((event.stream.clone(), chain.count()));
                }
            }
            if let Err(e) = self.append(event) {
                for (key, count) in &started {
                    self.trim(key, StreamVersion::from_count(*count))?;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn add_command(&mut self, command: &Command) -> KyroResult<()> {
        let id = VertexId::Message(command.message_id);
        if self.vertices.contains_key(&id) {
            return Ok(());
        }
        self.vertices
            .insert(id.clone(), Vertex::Command(CommandVertex::from_command(command)));
        if let Some(ancestor) = command.ancestor_id {
            self.link_or_wait(ancestor, &id, EdgeKind::Causality)?;
        }
        self.release_waiting(command.message_id)
    }

    /// Drops the occurrence of `id` in `key`; removes the vertex once no
    /// stream holds it.
    fn unlink_occurrence(&mut self, key: &StreamKey, id: MessageId) {
        let vertex = VertexId::Message(id);
        let doomed: Vec<Edge> = self
            .incoming
            .get(&vertex)
            .into_iter()
            .flatten()
            .chain(self.outgoing.get(&vertex).into_iter().flatten())
            .filter(|e| e.kind == EdgeKind::Stream && e.stream.as_ref() == Some(key))
            .cloned()
            .collect();
        for edge in &doomed {
            self.remove_edge(edge);
        }
        let orphaned = self.event_mut(id).is_some_and(|e| {
            e.occurrences.remove(key);
            e.occurrences.is_empty()
        });
        if orphaned {
            self.remove_vertex(&vertex);
        }
    }

    fn trim(&mut self, key: &StreamKey, keep: StreamVersion) -> KyroResult<Vec<MessageId>> {
        let chain = self.streams.get_mut(key).ok_or_else(|| not_found(key))?;
        let base = chain.base();
        let keep_count = keep.count();
        let keep_own = usize::try_from(keep_count.saturating_sub(base)).unwrap_or(usize::MAX);
        let removed = if keep_own < chain.events.len() {
            chain.events.split_off(keep_own)
        } else {
            Vec::new()
        };
        let lowered = keep_count < base;
        if lowered {
            if let Some(parent) = chain.parent.as_mut() {
                parent.version = keep.max(StreamVersion::Empty);
            }
        }
        for id in removed.iter().rev() {
            self.unlink_occurrence(key, *id);
        }
        if lowered {
            let parent = self.chain(key)?.parent.clone();
            if let Some(parent) = parent {
                let seed = self.chain_at(&parent.key, parent.version.count())?;
                if let Some(chain) = self.streams.get_mut(key) {
                    chain.seed = seed;
                }
            }
        }
        self.refresh_stream_vertex(key)?;
        Ok(removed)
    }

    fn delete_stream(&mut self, key: &StreamKey) -> KyroResult<()> {
        let chain = self.streams.remove(key).ok_or_else(|| not_found(key))?;
        for id in chain.events.iter().rev() {
            self.unlink_occurrence(key, *id);
        }
        self.remove_vertex(&VertexId::Stream(key.clone()));
        Ok(())
    }

    fn traverse(
        &self,
        start: &VertexId,
        kind: EdgeKind,
        direction: Direction,
        cancel: Option<&CancellationToken>,
    ) -> KyroResult<Vec<Vertex>> {
        if !self.vertices.contains_key(start) {
            return Ok(Vec::new());
        }
        let mut color: HashMap<VertexId, Color> = HashMap::new();
        let mut visited = Vec::new();
        let mut stack: Vec<(VertexId, usize)> = vec![(start.clone(), 0)];
        color.insert(start.clone(), Color::Gray);
        let mut steps = 0usize;
        while let Some((v, i)) = stack.last().cloned() {
            steps += 1;
            if steps % CANCEL_POLL == 0 {
                if let Some(token) = cancel {
                    token.check("graph traversal")?;
                }
            }
            let Some(next) = self.neighbours(&v, kind, direction).nth(i).cloned() else {
                color.insert(v, Color::Black);
                stack.pop();
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            match color.get(&next) {
                Some(Color::Gray) => {
                    let (from, to) = match direction {
                        Direction::Forward => (v, next),
                        Direction::Backward => (next, v),
                    };
                    return Err(CorruptionError::Cycle {
                        from: from.to_string(),
                        to: to.to_string(),
                    }
                    .into());
                }
                Some(Color::Black) => {}
                None => {
                    color.insert(next.clone(), Color::Gray);
                    visited.push(next.clone());
                    stack.push((next, 0));
                }
            }
        }
        Ok(visited
            .iter()
            .filter_map(|id| self.vertices.get(id).cloned())
            .collect())
    }

    fn verify(&self, key: &StreamKey) -> KyroResult<ContentHash> {
        let chain = self.chain(key)?;
        let base = chain.base();
        let mut leaves = Vec::with_capacity(chain.events.len());
        let mut stored = Vec::with_capacity(chain.events.len());
        for (expected, id) in (base..).zip(&chain.events) {
            let occurrence = self
                .event(*id)
                .and_then(|e| e.occurrences.get(key).map(|o| (e.leaf, *o)))
                .ok_or_else(|| Self::dangling(key, *id))?;
            if occurrence.1.version != expected {
                return Err(CorruptionError::VersionGap {
                    key: key.to_string(),
                    expected,
                    found: occurrence.1.version,
                }
                .into());
            }
            leaves.push(occurrence.0);
            stored.push(occurrence.1.chain);
        }
        let seed = match &chain.parent {
            Some(p) => self.recompute(&p.key, p.version.count())?,
            None => ContentHash::ZERO,
        };
        let recomputed = chain_all(seed, &leaves);
        let mismatch = |stored: &ContentHash, recomputed: &ContentHash| {
            CorruptionError::HashMismatch {
                key: key.to_string(),
                stored: stored.to_string(),
                recomputed: recomputed.to_string(),
            }
        };
        if chain.seed != seed {
            return Err(mismatch(&chain.seed, &seed).into());
        }
        for (s, r) in stored.iter().zip(&recomputed) {
            if s != r {
                return Err(mismatch(s, r).into());
            }
        }
        let hash = recomputed.last().copied().unwrap_or(seed);
        if let Some(Vertex::Stream(s)) = self.vertices.get(&VertexId::Stream(key.clone())) {
            if s.hash != hash {
                return Err(mismatch(&s.hash, &hash).into());
            }
        }
        Ok(hash)
    }

    /// Re-derives the hash of the first `count` events from leaves alone.
    fn recompute(&self, key: &StreamKey, count: u64) -> KyroResult<ContentHash> {
        let ids = self.resolved_ids(key, count)?;
        let leaves = ids
            .iter()
            .map(|id| self.event(*id).map(|e| e.leaf).ok_or_else(|| Self::dangling(key, *id)))
            .collect::<KyroResult<Vec<_>>>()?;
        Ok(stream_hash(ContentHash::ZERO, &leaves))
    }
}

/// The causality graph.
pub struct CausalityGraph {
    gate: GraphGate,
    data: RwLock<GraphData>,
    timeout: Duration,
}

impl std::fmt::Debug for CausalityGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CausalityGraph")
            .field("gate", &self.gate)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn poisoned(context: &str) -> KyroError {
    KyroError::internal(format!("poisoned lock: {context}"))
}

impl CausalityGraph {
    /// Creates an empty graph.
    ///
    /// `timeout` bounds read and update admission; `max_pause` caps pauses.
    #[must_use]
    pub fn new(timeout: Duration, max_pause: Duration) -> Self {
        Self {
            gate: GraphGate::new(max_pause),
            data: RwLock::new(GraphData::default()),
            timeout,
        }
    }

    fn read<T>(&self, f: impl FnOnce(&GraphData) -> KyroResult<T>) -> KyroResult<T> {
        let _admitted = self.gate.read(self.timeout)?;
        let data = self.data.read().map_err(|_| poisoned("graph.read"))?;
        f(&*data)
    }

    fn update<T>(&self, f: impl FnOnce(&mut GraphData) -> KyroResult<T>) -> KyroResult<T> {
        let _admitted = self.gate.update(self.timeout)?;
        let mut data = self.data.write().map_err(|_| poisoned("graph.update"))?;
        let result = f(&mut *data);
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(error = %e, "causality graph corruption");
            }
        }
        result
    }

    /// Current gate state.
    pub fn state(&self) -> GateState {
        self.gate.state()
    }

    /// Pauses the graph for the calling thread. See [`GraphGate::pause`].
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the graph cannot be paused in time.
    pub fn pause(&self, duration: Duration) -> KyroResult<PauseGuard<'_>> {
        self.gate.pause(duration, self.timeout)
    }

    /// Rebuilds the graph by replaying every stream and command log.
    ///
    /// The new graph is built off to the side and swapped in atomically, so
    /// readers keep seeing the previous graph while this runs.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` past `timeout`, `Cancelled` if `cancel` fires, or a
    /// corruption error for inconsistent logs.
    pub fn populate(
        &self,
        registry: &StreamRegistry,
        commands: &dyn CommandLog,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> KyroResult<PopulateStats> {
        let started = Instant::now();
        let check = |started: Instant| -> KyroResult<()> {
            cancel.check("populate")?;
            if started.elapsed() > timeout {
                return Err(ExecutionError::Timeout {
                    duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
                .into());
            }
            Ok(())
        };

        let mut ordered = Vec::new();
        for stream in registry.list(None, &StreamFilter::All)? {
            let depth = registry.ancestors(&stream)?.len();
            ordered.push((depth, stream));
        }
        ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.key.cmp(&b.1.key)));

        let mut timelines: BTreeSet<TimelineId> =
            ordered.iter().map(|(_, s)| s.key.timeline().clone()).collect();
        timelines.extend(commands.timelines()?);

        let mut fresh = GraphData::default();
        let mut stats = PopulateStats::default();
        for timeline in &timelines {
            for command in commands.list(timeline)? {
                check(started)?;
                fresh.add_command(&command)?;
                stats.commands += 1;
            }
        }
        for (_, stream) in &ordered {
            check(started)?;
            fresh.register_stream(&stream.key, stream.parent.clone())?;
            for event in registry.read(stream, stream.base(), stream.own_count())? {
                fresh.append(&event)?;
                stats.events += 1;
            }
            stats.streams += 1;
        }

        self.update(|data| {
            *data = fresh;
            Ok(())
        })?;
        info!(
            streams = stats.streams,
            events = stats.events,
            commands = stats.commands,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "causality graph populated"
        );
        Ok(stats)
    }

    /// Registers a stream vertex. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `DanglingParent` if the parent stream is not registered.
    pub fn register_stream(&self, key: &StreamKey, parent: Option<StreamRef>) -> KyroResult<()> {
        self.update(|data| data.register_stream(key, parent))
    }

    /// Links a newly appended event into its stream. A refused event
    /// leaves the graph unchanged.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for version gaps, cycles or conflicting
    /// content under one message id.
    pub fn add_event(&self, event: &Event) -> KyroResult<()> {
        self.update(|data| data.append_all(std::slice::from_ref(event)))
    }

    /// Links a batch of events in order, all or nothing.
    ///
    /// # Errors
    ///
    /// See [`CausalityGraph::add_event`].
    pub fn add_events(&self, events: &[Event]) -> KyroResult<()> {
        self.update(|data| data.append_all(events))
    }

    /// Records a command vertex.
    ///
    /// # Errors
    ///
    /// Returns `Cycle` if its ancestry would close a cycle.
    pub fn add_command(&self, command: &Command) -> KyroResult<()> {
        self.update(|data| data.add_command(command))
    }

    /// Removes command vertices.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if update admission times out.
    pub fn remove_commands(&self, ids: &[MessageId]) -> KyroResult<()> {
        self.update(|data| {
            for id in ids {
                let vertex = VertexId::Message(*id);
                if matches!(data.vertices.get(&vertex), Some(Vertex::Command(_))) {
                    data.remove_vertex(&vertex);
                }
            }
            Ok(())
        })
    }

    /// Removes everything after `keep` from a stream and re-hashes it.
    ///
    /// Returns the ids whose occurrence in this stream was removed.
    ///
    /// # Errors
    ///
    /// Returns `StreamNotFound` for unknown streams.
    pub fn trim_stream(&self, key: &StreamKey, keep: StreamVersion) -> KyroResult<Vec<MessageId>> {
        self.update(|data| data.trim(key, keep))
    }

    /// Removes a stream vertex and every vertex only it held.
    ///
    /// # Errors
    ///
    /// Returns `StreamNotFound` for unknown streams.
    pub fn delete_stream(&self, key: &StreamKey) -> KyroResult<()> {
        self.update(|data| data.delete_stream(key))
    }

    /// Removes every stream and command of a timeline.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if update admission times out.
    pub fn delete_timeline(&self, timeline: &TimelineId) -> KyroResult<()> {
        self.update(|data| {
            let keys: Vec<StreamKey> = data
                .streams
                .keys()
                .filter(|k| k.timeline() == timeline)
                .cloned()
                .collect();
            for key in keys {
                data.delete_stream(&key)?;
            }
            let commands: Vec<VertexId> = data
                .vertices
                .iter()
                .filter(|(_, v)| matches!(v, Vertex::Command(c) if &c.timeline == timeline))
                .map(|(id, _)| id.clone())
                .collect();
            for id in commands {
                data.remove_vertex(&id);
            }
            Ok(())
        })
    }

    /// Looks up a vertex.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if read admission times out.
    pub fn vertex(&self, id: &VertexId) -> KyroResult<Option<Vertex>> {
        self.read(|data| Ok(data.vertices.get(id).cloned()))
    }

    /// Transitive dependents of `id` over one edge kind, in DFS order.
    ///
    /// # Errors
    ///
    /// Returns `Cycle` if the traversal meets a back edge.
    pub fn get_dependents(&self, id: &VertexId, kind: EdgeKind) -> KyroResult<Vec<Vertex>> {
        self.read(|data| data.traverse(id, kind, Direction::Forward, None))
    }

    /// Like [`CausalityGraph::get_dependents`], polling `cancel`.
    ///
    /// # Errors
    ///
    /// Also returns `Cancelled`.
    pub fn get_dependents_cancellable(
        &self,
        id: &VertexId,
        kind: EdgeKind,
        cancel: &CancellationToken,
    ) -> KyroResult<Vec<Vertex>> {
        self.read(|data| data.traverse(id, kind, Direction::Forward, Some(cancel)))
    }

    /// Transitive causes of `id` over one edge kind, in DFS order.
    ///
    /// # Errors
    ///
    /// Returns `Cycle` if the traversal meets a back edge.
    pub fn get_causes(&self, id: &VertexId, kind: EdgeKind) -> KyroResult<Vec<Vertex>> {
        self.read(|data| data.traverse(id, kind, Direction::Backward, None))
    }

    /// Events produced by a command.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if read admission times out.
    pub fn events_of_command(&self, command: MessageId) -> KyroResult<Vec<EventVertex>> {
        self.read(|data| {
            Ok(data
                .neighbours(&VertexId::Message(command), EdgeKind::Command, Direction::Forward)
                .filter_map(|id| match data.vertices.get(id) {
                    Some(Vertex::Event(e)) => Some(e.clone()),
                    _ => None,
                })
                .collect())
        })
    }

    /// Timestamp of `version` in `key`, resolving through ancestors.
    ///
    /// Returns `None` if the stream or the version is absent.
    ///
    /// # Errors
    ///
    /// Returns `DanglingParent` for a broken ancestor chain.
    pub fn get_timestamp(&self, key: &StreamKey, version: u64) -> KyroResult<Option<LogicalTime>> {
        self.read(|data| data.timestamp_at(key, version))
    }

    /// Logical version of `key`, or `None` if it is not registered.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if read admission times out.
    pub fn get_stream_version(&self, key: &StreamKey) -> KyroResult<Option<StreamVersion>> {
        self.read(|data| {
            Ok(data
                .streams
                .get(key)
                .map(|c| StreamVersion::from_count(c.count())))
        })
    }

    /// Greatest version of `key` stamped at or before `at`.
    ///
    /// `Some(Empty)` if no event qualifies, `None` if the stream is unknown.
    ///
    /// # Errors
    ///
    /// Returns `DanglingParent` for a broken ancestor chain.
    pub fn version_at(
        &self,
        key: &StreamKey,
        at: LogicalTime,
    ) -> KyroResult<Option<StreamVersion>> {
        self.read(|data| {
            let Some(chain) = data.streams.get(key) else {
                return Ok(None);
            };
            let stamps = data.resolved_stamps(key, chain.count())?;
            let n = stamps.partition_point(|t| *t <= at);
            Ok(Some(StreamVersion::from_count(n as u64)))
        })
    }

    /// Message ids of `key` in version order, ancestors included.
    ///
    /// # Errors
    ///
    /// Returns `StreamNotFound` for unknown streams.
    pub fn stream_event_ids(&self, key: &StreamKey) -> KyroResult<Vec<MessageId>> {
        self.read(|data| data.resolved_ids(key, data.chain(key)?.count()))
    }

    /// Stored stream hash.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if read admission times out.
    pub fn stream_hash(&self, key: &StreamKey) -> KyroResult<Option<ContentHash>> {
        self.read(|data| {
            Ok(match data.vertices.get(&VertexId::Stream(key.clone())) {
                Some(Vertex::Stream(s)) => Some(s.hash),
                _ => None,
            })
        })
    }

    /// Re-derives the stream hash from leaf hashes alone.
    ///
    /// # Errors
    ///
    /// Returns `StreamNotFound` for unknown streams.
    pub fn recompute_stream_hash(&self, key: &StreamKey) -> KyroResult<ContentHash> {
        self.read(|data| data.recompute(key, data.chain(key)?.count()))
    }

    /// Checks version contiguity and every stored chain value of `key`.
    ///
    /// # Errors
    ///
    /// Returns `VersionGap` or `HashMismatch` on corruption.
    pub fn verify_stream(&self, key: &StreamKey) -> KyroResult<ContentHash> {
        let result = self.read(|data| data.verify(key));
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(stream = %key, error = %e, "stream failed verification");
            }
        }
        result
    }

    /// Size summary.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if read admission times out.
    pub fn stats(&self) -> KyroResult<GraphStats> {
        self.read(|data| {
            let mut stats = GraphStats {
                edges: data.outgoing.values().map(Vec::len).sum(),
                ..GraphStats::default()
            };
            for vertex in data.vertices.values() {
                match vertex {
                    Vertex::Stream(_) => stats.streams += 1,
                    Vertex::Event(_) => stats.events += 1,
                    Vertex::Command(_) => stats.commands += 1,
                }
            }
            Ok(stats)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CommandDraft, EventDraft};
    use serde_json::json;

    const T: Duration = Duration::from_secs(1);

    fn graph() -> CausalityGraph {
        CausalityGraph::new(T, T)
    }

    fn key(s: &str) -> StreamKey {
        StreamKey::parse(s).unwrap()
    }

    fn event(key: &StreamKey, version: u64, n: u64) -> Event {
        EventDraft::new("E", json!({ "n": n })).into_event(key, version, LogicalTime::new(n, 0))
    }

    fn seeded(g: &CausalityGraph, k: &StreamKey, n: u64) -> Vec<Event> {
        g.register_stream(k, None).unwrap();
        let events: Vec<Event> = (0..n).map(|v| event(k, v, (v + 1) * 10)).collect();
        g.add_events(&events).unwrap();
        events
    }

    #[test]
    fn test_stream_edges_form_a_path() {
        let g = graph();
        let k = key("master:Root:1");
        let events = seeded(&g, &k, 3);
        let after = g
            .get_dependents(&VertexId::Stream(k.clone()), EdgeKind::Stream)
            .unwrap();
        let ids: Vec<VertexId> = after.iter().map(Vertex::id).collect();
        let expected: Vec<VertexId> = events.iter().map(|e| e.message_id.into()).collect();
        assert_eq!(ids, expected);
        assert_eq!(g.get_stream_version(&k).unwrap(), Some(StreamVersion::At(2)));
    }

    #[test]
    fn test_version_gap_is_rejected() {
        let g = graph();
        let k = key("master:Root:1");
        seeded(&g, &k, 1);
        let err = g.add_event(&event(&k, 5, 99)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_refused_batch_leaves_graph_unchanged() {
        let g = graph();
        let k = key("master:Root:1");
        seeded(&g, &k, 1);
        let before = (g.stats().unwrap(), g.stream_hash(&k).unwrap());

        let good = event(&k, 1, 20);
        let id = MessageId::new();
        let looped = EventDraft::new("E", json!({}))
            .with_id(id)
            .caused_by(id)
            .into_event(&k, 2, LogicalTime::new(30, 0));
        let err = g.add_events(&[good.clone(), looped]).unwrap_err();
        assert!(matches!(err, KyroError::Corruption(CorruptionError::Cycle { .. })));

        assert_eq!((g.stats().unwrap(), g.stream_hash(&k).unwrap()), before);
        assert_eq!(g.get_stream_version(&k).unwrap(), Some(StreamVersion::At(0)));
        assert!(g.vertex(&VertexId::Message(good.message_id)).unwrap().is_none());
        g.add_event(&good).unwrap();
        g.verify_stream(&k).unwrap();
    }

    #[test]
    fn test_causality_and_command_edges() {
        let g = graph();
        let a = key("master:A:1");
        let b = key("master:B:1");
        g.register_stream(&a, None).unwrap();
        g.register_stream(&b, None).unwrap();
        let master = TimelineId::new("master").unwrap();
        let cmd =
            CommandDraft::new("1", "Do", json!({})).into_command(&master, LogicalTime::new(1, 0));
        g.add_command(&cmd).unwrap();

        let cause = EventDraft::new("A", json!({}))
            .from_command(cmd.message_id)
            .into_event(&a, 0, LogicalTime::new(2, 0));
        let effect = EventDraft::new("B", json!({}))
            .caused_by(cause.message_id)
            .into_event(&b, 0, LogicalTime::new(3, 0));
        g.add_event(&cause).unwrap();
        g.add_event(&effect).unwrap();

        let deps = g
            .get_dependents(&cause.message_id.into(), EdgeKind::Causality)
            .unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].id(), VertexId::Message(effect.message_id));

        let causes = g.get_causes(&effect.message_id.into(), EdgeKind::Causality).unwrap();
        assert_eq!(causes[0].id(), VertexId::Message(cause.message_id));

        let produced = g.events_of_command(cmd.message_id).unwrap();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].id, cause.message_id);
    }

    #[test]
    fn test_late_ancestor_is_linked_on_arrival() {
        let g = graph();
        let a = key("master:A:1");
        let b = key("master:B:1");
        g.register_stream(&a, None).unwrap();
        g.register_stream(&b, None).unwrap();
        let cause = EventDraft::new("A", json!({})).into_event(&a, 0, LogicalTime::new(1, 0));
        let effect = EventDraft::new("B", json!({}))
            .caused_by(cause.message_id)
            .into_event(&b, 0, LogicalTime::new(2, 0));
        g.add_event(&effect).unwrap();
        g.add_event(&cause).unwrap();
        let deps = g
            .get_dependents(&cause.message_id.into(), EdgeKind::Causality)
            .unwrap();
        assert_eq!(deps.len(), 1);
    }

    #[test]
    fn test_cycle_is_rejected_on_insertion() {
        let g = graph();
        let a = key("master:A:1");
        g.register_stream(&a, None).unwrap();
        let first = EventDraft::new("A", json!(1)).into_event(&a, 0, LogicalTime::new(1, 0));
        // Second event names itself as its own ancestor.
        let id = MessageId::new();
        let second = EventDraft::new("A", json!(2))
            .with_id(id)
            .caused_by(id)
            .into_event(&a, 1, LogicalTime::new(2, 0));
        g.add_event(&first).unwrap();
        let err = g.add_event(&second).unwrap_err();
        assert!(matches!(err, KyroError::Corruption(CorruptionError::Cycle { .. })));
    }

    #[test]
    fn test_traversal_detects_planted_cycle() {
        let g = graph();
        let a = key("master:A:1");
        let events = seeded(&g, &a, 2);
        {
            let mut data = g.data.write().unwrap();
            data.insert_edge(Edge {
                from: events[1].message_id.into(),
                to: events[0].message_id.into(),
                kind: EdgeKind::Stream,
                stream: Some(a.clone()),
            });
        }
        let err = g
            .get_dependents(&VertexId::Stream(a), EdgeKind::Stream)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_timestamps_resolve_through_parent() {
        let g = graph();
        let master = key("master:Root:1");
        seeded(&g, &master, 3);
        let child = key("test:Root:1");
        g.register_stream(
            &child,
            Some(StreamRef {
                key: master.clone(),
                version: StreamVersion::At(1),
            }),
        )
        .unwrap();
        g.add_event(&event(&child, 2, 25)).unwrap();

        assert_eq!(g.get_timestamp(&child, 0).unwrap(), Some(LogicalTime::new(10, 0)));
        assert_eq!(g.get_timestamp(&child, 2).unwrap(), Some(LogicalTime::new(25, 0)));
        assert_eq!(g.get_timestamp(&child, 3).unwrap(), None);
        assert_eq!(g.get_timestamp(&key("x:Root:1"), 0).unwrap(), None);
        assert_eq!(g.get_stream_version(&child).unwrap(), Some(StreamVersion::At(2)));
        assert_eq!(
            g.version_at(&child, LogicalTime::new(20, 0)).unwrap(),
            Some(StreamVersion::At(1))
        );
        assert_eq!(
            g.version_at(&child, LogicalTime::new(5, 0)).unwrap(),
            Some(StreamVersion::Empty)
        );
    }

    #[test]
    fn test_equal_histories_hash_equally_across_timelines() {
        let g = graph();
        let master = key("master:Root:1");
        let events = seeded(&g, &master, 2);
        let child = key("test:Root:1");
        g.register_stream(
            &child,
            Some(StreamRef {
                key: master.clone(),
                version: StreamVersion::At(0),
            }),
        )
        .unwrap();
        assert_ne!(g.stream_hash(&child).unwrap(), g.stream_hash(&master).unwrap());
        g.add_event(&events[1].relocated(&child, 1)).unwrap();
        assert_eq!(g.stream_hash(&child).unwrap(), g.stream_hash(&master).unwrap());
        assert_eq!(
            g.recompute_stream_hash(&child).unwrap(),
            g.stream_hash(&child).unwrap().unwrap()
        );
        g.verify_stream(&child).unwrap();
    }

    #[test]
    fn test_trim_orphans_and_rehashes() {
        let g = graph();
        let k = key("master:Root:1");
        let events = seeded(&g, &k, 3);
        let original = g.stream_hash(&k).unwrap();
        let before = g.stats().unwrap();
        let removed = g.trim_stream(&k, StreamVersion::At(0)).unwrap();
        assert_eq!(removed, vec![events[1].message_id, events[2].message_id]);
        assert!(g.vertex(&events[2].message_id.into()).unwrap().is_none());
        assert_eq!(g.get_stream_version(&k).unwrap(), Some(StreamVersion::At(0)));
        assert_eq!(g.stats().unwrap().events, before.events - 2);
        g.verify_stream(&k).unwrap();

        // Re-appending the same history reproduces the original hash.
        g.add_events(&events[1..]).unwrap();
        assert_eq!(g.stream_hash(&k).unwrap(), original);
    }

    #[test]
    fn test_trim_keeps_events_held_elsewhere() {
        let g = graph();
        let master = key("master:Root:1");
        let events = seeded(&g, &master, 2);
        let other = key("test:Root:1");
        g.register_stream(&other, None).unwrap();
        g.add_events(&[events[0].relocated(&other, 0), events[1].relocated(&other, 1)])
            .unwrap();
        g.trim_stream(&master, StreamVersion::Empty).unwrap();
        assert!(g.vertex(&events[1].message_id.into()).unwrap().is_some());
        g.delete_stream(&other).unwrap();
        assert!(g.vertex(&events[1].message_id.into()).unwrap().is_none());
        assert!(g.vertex(&VertexId::Stream(other)).unwrap().is_none());
    }

    #[test]
    fn test_conflicting_content_under_one_id_is_corruption() {
        let g = graph();
        let a = key("master:A:1");
        let b = key("master:B:1");
        g.register_stream(&a, None).unwrap();
        g.register_stream(&b, None).unwrap();
        let e = event(&a, 0, 1);
        g.add_event(&e).unwrap();
        let mut forged = e.relocated(&b, 0);
        forged.content_hash = ContentHash::ZERO;
        assert!(g.add_event(&forged).unwrap_err().is_fatal());
    }

    #[test]
    fn test_verify_detects_tampered_chain() {
        let g = graph();
        let k = key("master:Root:1");
        let events = seeded(&g, &k, 2);
        {
            let mut data = g.data.write().unwrap();
            let vertex = data.event_mut(events[0].message_id).unwrap();
            vertex.leaf = ContentHash::ZERO;
        }
        let err = g.verify_stream(&k).unwrap_err();
        assert!(matches!(err, KyroError::Corruption(CorruptionError::HashMismatch { .. })));
    }

    #[test]
    fn test_delete_timeline_removes_streams_and_commands() {
        let g = graph();
        let master = key("master:Root:1");
        seeded(&g, &master, 1);
        let test = TimelineId::new("test").unwrap();
        let child = master.with_timeline(&test);
        g.register_stream(
            &child,
            Some(StreamRef {
                key: master.clone(),
                version: StreamVersion::At(0),
            }),
        )
        .unwrap();
        g.add_event(&event(&child, 1, 50)).unwrap();
        let cmd =
            CommandDraft::new("1", "Do", json!({})).into_command(&test, LogicalTime::new(40, 0));
        g.add_command(&cmd).unwrap();

        g.delete_timeline(&test).unwrap();
        let stats = g.stats().unwrap();
        assert_eq!(stats.streams, 1);
        assert_eq!(stats.events, 1);
        assert_eq!(stats.commands, 0);
    }

    #[test]
    fn test_cancelled_traversal() {
        let g = graph();
        let k = key("master:Root:1");
        seeded(&g, &k, 600);
        let token = CancellationToken::new();
        token.cancel();
        let err = g
            .get_dependents_cancellable(&VertexId::Stream(k), EdgeKind::Stream, &token)
            .unwrap_err();
        assert!(matches!(err, KyroError::Execution(ExecutionError::Cancelled { .. })));
    }
}
