use std::collections::HashMap;
use std::path::Path;

use qnet_core::engine::{Engine, EngineConfig};
use qnet_core::event::{EventKind, SimEvent};
use qnet_core::id::{LinkId, NodeId};
use qnet_core::sim::AdvanceResult;
use qnet_core::topology::{LinkSpec, NodeKind};
use tracing::{debug, info};

use crate::error::SceneError;
use crate::scene_schema::{SceneData, to_fixed};

/// Metadata about a node in the active scene, for rendering.
#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub node_id: NodeId,
    pub scene_id: String,
    pub label: String,
    pub kind: NodeKind,
    pub position: (f32, f32),
}

/// Metadata about a link in the active scene, for rendering.
#[derive(Debug, Clone)]
pub struct LinkMeta {
    pub link_id: LinkId,
    pub a: String,
    pub b: String,
    pub label: Option<String>,
}

/// A scripted client action with its node names resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledAction {
    Send {
        from: NodeId,
        to: NodeId,
        data: Vec<u8>,
    },
    RequestKey {
        initiator: NodeId,
        responder: NodeId,
    },
}

/// A fully constructed scene, started and ready to tick.
pub struct ActiveScene {
    pub engine: Engine,
    pub scene_data: SceneData,
    pub node_meta: Vec<NodeMeta>,
    pub link_meta: Vec<LinkMeta>,
    pub node_id_map: HashMap<String, NodeId>,
    /// (tick, action), ordered by tick then script order.
    schedule: Vec<(u64, ScheduledAction)>,
    next_action: usize,
    pub tick_limit: u64,
}

/// Build an active scene from a `.ron` or `.json` file.
pub fn build_scene(path: &Path) -> Result<ActiveScene, SceneError> {
    let data = SceneData::load(path)?;
    info!(scene = %data.title, file = %path.display(), "scene loaded");
    build_scene_data(data)
}

/// Build an active scene from already parsed scene data.
pub fn build_scene_data(data: SceneData) -> Result<ActiveScene, SceneError> {
    let config = EngineConfig {
        seed: data.simulation.seed,
        qkd: data.simulation.qkd.to_config()?,
        event_capacity: data.simulation.event_capacity,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(config)?;
    for name in &data.simulation.suppress {
        let kind = EventKind::from_name(name)
            .ok_or_else(|| SceneError::UnknownEventKind { name: name.clone() })?;
        engine.events_mut().suppress(kind);
    }

    // 1. Nodes
    let mut node_id_map = HashMap::new();
    let mut node_meta = Vec::with_capacity(data.nodes.len());
    for node in &data.nodes {
        if node_id_map.contains_key(&node.id) {
            return Err(SceneError::DuplicateNode {
                id: node.id.clone(),
            });
        }
        let node_id = engine.add_node(node.id.clone(), node.kind, node.address.clone())?;
        node_id_map.insert(node.id.clone(), node_id);
        node_meta.push(NodeMeta {
            node_id,
            scene_id: node.id.clone(),
            label: node.label.clone().unwrap_or_else(|| node.id.clone()),
            kind: node.kind,
            position: node.position,
        });
    }
    let resolve = |id: &str| {
        node_id_map
            .get(id)
            .copied()
            .ok_or_else(|| SceneError::NodeNotFound { id: id.to_string() })
    };

    // 2. Links
    let mut link_meta = Vec::with_capacity(data.links.len());
    for link in &data.links {
        let a = resolve(&link.a)?;
        let b = resolve(&link.b)?;
        let spec = LinkSpec {
            domain: link.domain,
            error_probability: to_fixed("error_probability", link.error_probability)?,
            latency: link.latency,
        };
        let link_id = engine.add_link(a, b, spec)?;
        link_meta.push(LinkMeta {
            link_id,
            a: link.a.clone(),
            b: link.b.clone(),
            label: link.label.clone(),
        });
    }

    // 3. Script
    let mut schedule = Vec::with_capacity(data.messages.len() + data.key_requests.len());
    for request in &data.key_requests {
        schedule.push((
            request.tick,
            ScheduledAction::RequestKey {
                initiator: resolve(&request.initiator)?,
                responder: resolve(&request.responder)?,
            },
        ));
    }
    for message in &data.messages {
        schedule.push((
            message.tick,
            ScheduledAction::Send {
                from: resolve(&message.from)?,
                to: resolve(&message.to)?,
                data: message.data.as_bytes().to_vec(),
            },
        ));
    }
    // Stable: key requests precede sends scheduled for the same tick.
    schedule.sort_by_key(|(tick, _)| *tick);

    engine.start();
    debug!(
        nodes = node_meta.len(),
        links = link_meta.len(),
        actions = schedule.len(),
        "scene built"
    );

    Ok(ActiveScene {
        engine,
        tick_limit: data.simulation.tick_limit,
        scene_data: data,
        node_meta,
        link_meta,
        node_id_map,
        schedule,
        next_action: 0,
    })
}

impl ActiveScene {
    pub fn node(&self, scene_id: &str) -> Option<NodeId> {
        self.node_id_map.get(scene_id).copied()
    }

    /// Scripted actions not yet submitted.
    pub fn remaining_actions(&self) -> usize {
        self.schedule.len() - self.next_action
    }

    /// Submit every scripted action due at the current tick, then step.
    pub fn tick(&mut self) -> Result<AdvanceResult, SceneError> {
        let now = self.engine.tick();
        while let Some((due, action)) = self.schedule.get(self.next_action) {
            if *due > now {
                break;
            }
            match action {
                ScheduledAction::Send { from, to, data } => {
                    self.engine.send_message(*from, *to, data.clone())?;
                }
                ScheduledAction::RequestKey {
                    initiator,
                    responder,
                } => self.engine.request_key(*initiator, *responder)?,
            }
            self.next_action += 1;
        }
        Ok(self.engine.step())
    }

    /// The script is exhausted and the engine has nothing left to do.
    pub fn is_finished(&self) -> bool {
        self.remaining_actions() == 0 && self.engine.is_idle()
    }

    /// Tick until finished or `max_ticks` have run, collecting events.
    pub fn run(&mut self, max_ticks: u64) -> Result<Vec<SimEvent>, SceneError> {
        let mut events = self.engine.drain_events();
        let mut ran = 0;
        while ran < max_ticks && !self.is_finished() {
            self.tick()?;
            events.extend(self.engine.drain_events());
            ran += 1;
        }
        Ok(events)
    }

    /// [`ActiveScene::run`] bounded by the scene's own tick limit.
    pub fn run_to_completion(&mut self) -> Result<Vec<SimEvent>, SceneError> {
        self.run(self.tick_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene_schema::{SceneLink, SceneNode, ScriptedMessage, SimulationConfig};
    use qnet_core::event::EventPayload;
    use qnet_core::topology::LinkDomain;

    fn node(id: &str, kind: NodeKind) -> SceneNode {
        SceneNode {
            id: id.into(),
            kind,
            address: String::new(),
            position: (0.0, 0.0),
            label: None,
        }
    }

    fn link(a: &str, b: &str) -> SceneLink {
        SceneLink {
            a: a.into(),
            b: b.into(),
            domain: LinkDomain::Classical,
            error_probability: 0.0,
            latency: 1,
            label: None,
        }
    }

    fn pair_scene(messages: Vec<ScriptedMessage>) -> SceneData {
        SceneData {
            title: "pair".into(),
            description: String::new(),
            nodes: vec![
                node("H1", NodeKind::ClassicalHost),
                node("H2", NodeKind::ClassicalHost),
            ],
            links: vec![link("H1", "H2")],
            simulation: SimulationConfig::default(),
            messages,
            key_requests: Vec::new(),
        }
    }

    fn message(tick: u64, data: &str) -> ScriptedMessage {
        ScriptedMessage {
            tick,
            from: "H1".into(),
            to: "H2".into(),
            data: data.into(),
        }
    }

    #[test]
    fn builds_and_delivers() {
        let mut scene = build_scene_data(pair_scene(vec![message(0, "hi")])).unwrap();
        assert_eq!(scene.node_meta.len(), 2);
        assert_eq!(scene.link_meta.len(), 1);
        assert!(scene.engine.is_running());

        let events = scene.run_to_completion().unwrap();
        let delivered: Vec<&[u8]> = events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::DataReceived { data, .. } => Some(data.as_slice()),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![b"hi".as_slice()]);
        assert!(scene.is_finished());
    }

    #[test]
    fn scripted_ticks_are_respected() {
        let mut scene = build_scene_data(pair_scene(vec![message(5, "late")])).unwrap();
        let events = scene.run_to_completion().unwrap();
        let sent = events
            .iter()
            .find(|e| e.kind() == EventKind::DataSent)
            .unwrap();
        assert_eq!(sent.tick, 5);
    }

    #[test]
    fn unknown_link_endpoint() {
        let mut data = pair_scene(Vec::new());
        data.links.push(link("H1", "H9"));
        assert!(matches!(
            build_scene_data(data),
            Err(SceneError::NodeNotFound { id }) if id == "H9"
        ));
    }

    #[test]
    fn duplicate_node_rejected() {
        let mut data = pair_scene(Vec::new());
        data.nodes.push(node("H1", NodeKind::ClassicalRouter));
        assert!(matches!(
            build_scene_data(data),
            Err(SceneError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn domain_mismatch_surfaces_engine_error() {
        let mut data = pair_scene(Vec::new());
        data.links[0].domain = LinkDomain::Quantum;
        assert!(matches!(build_scene_data(data), Err(SceneError::Engine(_))));
    }

    #[test]
    fn suppression_applies() {
        let mut data = pair_scene(vec![message(0, "hi")]);
        data.simulation.suppress = vec!["packet_received".into()];
        let mut scene = build_scene_data(data).unwrap();
        let events = scene.run_to_completion().unwrap();
        assert!(!events.iter().any(|e| e.kind() == EventKind::PacketReceived));

        let mut data = pair_scene(Vec::new());
        data.simulation.suppress = vec!["nonsense".into()];
        assert!(matches!(
            build_scene_data(data),
            Err(SceneError::UnknownEventKind { .. })
        ));
    }
}
