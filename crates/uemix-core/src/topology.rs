//! Declarative topology and its compiled plan
//!
//! A [`Topology`] names the sources, the mixes, the weighted edges feeding
//! each mix, and the sinks publishing nodes. [`Topology::validate`] checks it
//! once, before any thread starts, and compiles a [`MixPlan`] whose mixes are
//! stored in evaluation order.
//!
//! Default wiring:
//!
//! ```text
//!  s0 ──[throttle]──[×0.8]──┐
//!  s1 ──────────────[×0.6]──┼──(+)── mix_a ──> out_a
//!  s2 ──────────────[×0.4]──┘
//!
//!  s3 ──┬──[×0.8]── mix_b ──> out_b
//!       ├──[×0.4]── mix_c ──> out_c
//!       └──[×0.6]── mix_d ──> out_d
//! ```

use crate::combiner::{validate_weight, WeightedCombiner};
use crate::error::{MixerError, MixerResult};
use crate::types::{SampleBlock, Weight};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;

/// Topology validation failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("topology has no sources")]
    NoSources,

    #[error("topology has no sinks")]
    NoSinks,

    #[error("duplicate node name '{0}'")]
    DuplicateName(String),

    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    UnknownNode {
        from: String,
        to: String,
        missing: String,
    },

    #[error("edge {from} -> {to} must target a mix")]
    TargetNotMix { from: String, to: String },

    #[error("duplicate edge {from} -> {to}")]
    DuplicateEdge { from: String, to: String },

    #[error("edge {from} -> {to} has invalid weight {weight} (must be in (0, 1])")]
    InvalidWeight { from: String, to: String, weight: Weight },

    #[error("mix '{0}' has no inputs")]
    EmptyMix(String),

    #[error("sink '{sink}' reads unknown node '{from}'")]
    UnknownSinkInput { sink: String, from: String },

    #[error("no edge {from} -> {to}")]
    UnknownEdge { from: String, to: String },

    #[error("cycle through mixes: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Requester feeding the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    /// `scheme://host:port` to dial; required when endpoints are opened from config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Pace this stream through the rate limiter
    #[serde(default)]
    pub throttle: bool,
    /// Overrides the transport timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Overrides the transport high-water mark
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_water_mark: Option<i32>,
}

impl SourceSpec {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: Some(address.to_string()),
            throttle: false,
            timeout_ms: None,
            high_water_mark: None,
        }
    }

    pub fn throttled(mut self) -> Self {
        self.throttle = true;
        self
    }
}

/// Weighted sum node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixSpec {
    pub name: String,
}

/// `from` feeds mix `to`, scaled by `weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    pub weight: Weight,
}

/// Replier publishing one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSpec {
    pub name: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_water_mark: Option<i32>,
}

impl SinkSpec {
    pub fn new(name: &str, from: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            from: from.to_string(),
            address: Some(address.to_string()),
            timeout_ms: None,
            high_water_mark: None,
        }
    }
}

/// Static description of the sample-flow network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub sources: Vec<SourceSpec>,
    pub mixes: Vec<MixSpec>,
    pub edges: Vec<EdgeSpec>,
    pub sinks: Vec<SinkSpec>,
}

fn edge(from: &str, to: &str, weight: Weight) -> EdgeSpec {
    EdgeSpec {
        from: from.to_string(),
        to: to.to_string(),
        weight,
    }
}

fn mix(name: &str) -> MixSpec {
    MixSpec {
        name: name.to_string(),
    }
}

impl Default for Topology {
    /// Four sources, one three-way mix and three single-input mixes.
    fn default() -> Self {
        Self {
            sources: vec![
                SourceSpec::new("s0", "tcp://192.168.60.3:2000").throttled(),
                SourceSpec::new("s1", "tcp://192.168.60.2:2101"),
                SourceSpec::new("s2", "tcp://192.168.60.4:2201"),
                SourceSpec::new("s3", "tcp://192.168.60.5:2301"),
            ],
            mixes: vec![mix("mix_a"), mix("mix_b"), mix("mix_c"), mix("mix_d")],
            edges: vec![
                edge("s0", "mix_a", 0.8),
                edge("s1", "mix_a", 0.6),
                edge("s2", "mix_a", 0.4),
                edge("s3", "mix_b", 0.8),
                edge("s3", "mix_c", 0.4),
                edge("s3", "mix_d", 0.6),
            ],
            sinks: vec![
                SinkSpec::new("out_a", "mix_a", "tcp://0.0.0.0:2001"),
                SinkSpec::new("out_b", "mix_b", "tcp://0.0.0.0:2100"),
                SinkSpec::new("out_c", "mix_c", "tcp://0.0.0.0:2200"),
                SinkSpec::new("out_d", "mix_d", "tcp://0.0.0.0:2300"),
            ],
        }
    }
}

impl Topology {
    /// srsRAN multi-UE channel: the throttled eNB downlink is fanned out to
    /// three UEs and the three UE uplinks are summed back to the eNB.
    pub fn multi_ue() -> Self {
        Self {
            sources: vec![
                SourceSpec::new("enb_dl", "tcp://192.168.60.3:2000").throttled(),
                SourceSpec::new("ue1_ul", "tcp://192.168.60.2:2101"),
                SourceSpec::new("ue2_ul", "tcp://192.168.60.4:2201"),
                SourceSpec::new("ue3_ul", "tcp://192.168.60.5:2301"),
            ],
            mixes: vec![mix("ul_sum"), mix("dl_ue1"), mix("dl_ue2"), mix("dl_ue3")],
            edges: vec![
                edge("ue1_ul", "ul_sum", 0.8),
                edge("ue2_ul", "ul_sum", 0.6),
                edge("ue3_ul", "ul_sum", 0.4),
                edge("enb_dl", "dl_ue1", 0.8),
                edge("enb_dl", "dl_ue2", 0.6),
                edge("enb_dl", "dl_ue3", 0.4),
            ],
            sinks: vec![
                SinkSpec::new("enb_ul", "ul_sum", "tcp://0.0.0.0:2001"),
                SinkSpec::new("ue1_dl", "dl_ue1", "tcp://0.0.0.0:2100"),
                SinkSpec::new("ue2_dl", "dl_ue2", "tcp://0.0.0.0:2200"),
                SinkSpec::new("ue3_dl", "dl_ue3", "tcp://0.0.0.0:2300"),
            ],
        }
    }

    /// Check the descriptor and compile it into a [`MixPlan`].
    pub fn validate(&self) -> Result<MixPlan, TopologyError> {
        if self.sources.is_empty() {
            return Err(TopologyError::NoSources);
        }
        if self.sinks.is_empty() {
            return Err(TopologyError::NoSinks);
        }

        let mut nodes: HashMap<&str, NodeRef> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, source) in self.sources.iter().enumerate() {
            if !seen.insert(&source.name) {
                return Err(TopologyError::DuplicateName(source.name.clone()));
            }
            nodes.insert(&source.name, NodeRef::Source(i));
        }
        for (i, m) in self.mixes.iter().enumerate() {
            if !seen.insert(&m.name) {
                return Err(TopologyError::DuplicateName(m.name.clone()));
            }
            nodes.insert(&m.name, NodeRef::Mix(i));
        }
        for sink in &self.sinks {
            if !seen.insert(&sink.name) {
                return Err(TopologyError::DuplicateName(sink.name.clone()));
            }
        }

        // Inputs per mix, in edge declaration order
        let mut inputs: Vec<Vec<(NodeRef, &EdgeSpec)>> = vec![Vec::new(); self.mixes.len()];
        let mut pairs: HashSet<(&str, &str)> = HashSet::new();
        for e in &self.edges {
            let unknown = |missing: &str| TopologyError::UnknownNode {
                from: e.from.clone(),
                to: e.to.clone(),
                missing: missing.to_string(),
            };
            let from = *nodes.get(e.from.as_str()).ok_or_else(|| unknown(&e.from))?;
            let to = match nodes.get(e.to.as_str()) {
                Some(NodeRef::Mix(j)) => *j,
                Some(NodeRef::Source(_)) => {
                    return Err(TopologyError::TargetNotMix {
                        from: e.from.clone(),
                        to: e.to.clone(),
                    })
                }
                None if seen.contains(e.to.as_str()) => {
                    return Err(TopologyError::TargetNotMix {
                        from: e.from.clone(),
                        to: e.to.clone(),
                    })
                }
                None => return Err(unknown(&e.to)),
            };
            if !pairs.insert((&e.from, &e.to)) {
                return Err(TopologyError::DuplicateEdge {
                    from: e.from.clone(),
                    to: e.to.clone(),
                });
            }
            if validate_weight(&e.from, &e.to, e.weight).is_err() {
                return Err(TopologyError::InvalidWeight {
                    from: e.from.clone(),
                    to: e.to.clone(),
                    weight: e.weight,
                });
            }
            inputs[to].push((from, e));
        }

        if let Some((i, _)) = inputs.iter().enumerate().find(|(_, ins)| ins.is_empty()) {
            return Err(TopologyError::EmptyMix(self.mixes[i].name.clone()));
        }

        let order = self.evaluation_order(&inputs)?;
        let mut position = vec![0usize; self.mixes.len()];
        for (pos, &mix_index) in order.iter().enumerate() {
            position[mix_index] = pos;
        }
        let remap = |node: NodeRef| match node {
            NodeRef::Mix(j) => NodeRef::Mix(position[j]),
            source => source,
        };

        let mut mixes = Vec::with_capacity(order.len());
        for &mix_index in &order {
            let name = &self.mixes[mix_index].name;
            let weighted: Vec<(&str, Weight)> = inputs[mix_index]
                .iter()
                .map(|(_, e)| (e.from.as_str(), e.weight))
                .collect();
            let combiner = WeightedCombiner::new(name.clone(), &weighted).map_err(|e| match e {
                MixerError::InvalidWeight { from, to, weight } => {
                    TopologyError::InvalidWeight { from, to, weight }
                }
                _ => TopologyError::EmptyMix(name.clone()),
            })?;
            mixes.push(PlannedMix {
                name: name.clone(),
                inputs: inputs[mix_index]
                    .iter()
                    .map(|(node, e)| (remap(*node), e.from.clone()))
                    .collect(),
                combiner,
            });
        }

        let mut sinks = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            let from = nodes
                .get(sink.from.as_str())
                .copied()
                .ok_or_else(|| TopologyError::UnknownSinkInput {
                    sink: sink.name.clone(),
                    from: sink.from.clone(),
                })?;
            sinks.push(PlannedSink {
                name: sink.name.clone(),
                from: remap(from),
                from_name: sink.from.clone(),
            });
        }

        Ok(MixPlan {
            sources: self.sources.clone(),
            mixes,
            sinks,
        })
    }

    /// Kahn ordering over mix-to-mix edges, declaration order on ties.
    fn evaluation_order(
        &self,
        inputs: &[Vec<(NodeRef, &EdgeSpec)>],
    ) -> Result<Vec<usize>, TopologyError> {
        let n = self.mixes.len();
        let mut in_degree = vec![0usize; n];
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (to, ins) in inputs.iter().enumerate() {
            for (node, _) in ins {
                if let NodeRef::Mix(from) = node {
                    in_degree[to] += 1;
                    downstream[*from].push(to);
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &next in &downstream[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() < n {
            let stuck = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.mixes[i].name.clone())
                .collect();
            return Err(TopologyError::Cycle(stuck));
        }
        Ok(order)
    }
}

/// Reference to a node's value within one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    /// Index into [`MixPlan::sources`]
    Source(usize),
    /// Index into [`MixPlan::mixes`] (evaluation order)
    Mix(usize),
}

/// Compiled mix node.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMix {
    pub name: String,
    /// Input node and its name, aligned with the combiner's weights
    pub inputs: Vec<(NodeRef, String)>,
    pub combiner: WeightedCombiner,
}

/// Compiled sink binding.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSink {
    pub name: String,
    pub from: NodeRef,
    pub from_name: String,
}

/// Result of evaluating one mix for a tick.
#[derive(Debug, Clone)]
pub enum MixOutcome {
    Ready(SampleBlock),
    /// An input had no block this tick
    Skipped { missing: String },
    Failed(MixerError),
}

impl MixOutcome {
    pub fn block(&self) -> Option<&SampleBlock> {
        match self {
            MixOutcome::Ready(block) => Some(block),
            _ => None,
        }
    }
}

/// Validated topology with mixes in evaluation order.
#[derive(Debug, Clone, PartialEq)]
pub struct MixPlan {
    pub sources: Vec<SourceSpec>,
    pub mixes: Vec<PlannedMix>,
    pub sinks: Vec<PlannedSink>,
}

impl MixPlan {
    pub fn mix_index(&self, name: &str) -> Option<usize> {
        self.mixes.iter().position(|m| m.name == name)
    }

    /// Copy of the plan with one edge weight replaced.
    pub fn with_weight(&self, mix: &str, from: &str, weight: Weight) -> MixerResult<MixPlan> {
        validate_weight(from, mix, weight)?;
        let unknown = || {
            MixerError::Topology(TopologyError::UnknownEdge {
                from: from.to_string(),
                to: mix.to_string(),
            })
        };
        let index = self.mix_index(mix).ok_or_else(unknown)?;
        let slot = self.mixes[index]
            .inputs
            .iter()
            .position(|(_, name)| name == from)
            .ok_or_else(unknown)?;

        let planned = &self.mixes[index];
        let mut weighted: Vec<(&str, Weight)> = planned
            .inputs
            .iter()
            .map(|(_, name)| name.as_str())
            .zip(planned.combiner.weights().iter().copied())
            .collect();
        weighted[slot].1 = weight;

        let mut plan = self.clone();
        plan.mixes[index].combiner = WeightedCombiner::new(mix, &weighted)?;
        Ok(plan)
    }

    /// Evaluate every mix from this tick's source blocks.
    ///
    /// `sources[i]` is `None` when source `i` delivered nothing. A mix with a
    /// missing input is skipped; its dependents are skipped in turn.
    pub fn evaluate(&self, sources: &[Option<SampleBlock>]) -> Vec<MixOutcome> {
        let mut outcomes: Vec<MixOutcome> = Vec::with_capacity(self.mixes.len());
        for planned in &self.mixes {
            let mut blocks = Vec::with_capacity(planned.inputs.len());
            let mut missing = None;
            for (node, name) in &planned.inputs {
                let block = match node {
                    NodeRef::Source(i) => sources.get(*i).and_then(|b| b.as_ref()),
                    NodeRef::Mix(j) => outcomes.get(*j).and_then(|o| o.block()),
                };
                match block {
                    Some(block) => blocks.push(block.as_slice()),
                    None => {
                        missing = Some(name.clone());
                        break;
                    }
                }
            }

            let outcome = match missing {
                Some(missing) => MixOutcome::Skipped { missing },
                None => match planned.combiner.combine(&blocks) {
                    Ok(block) => MixOutcome::Ready(block),
                    Err(e) => MixOutcome::Failed(e),
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Block a sink publishes this tick, if its node produced one.
    pub fn sink_block<'a>(
        &self,
        sink: &PlannedSink,
        sources: &'a [Option<SampleBlock>],
        outcomes: &'a [MixOutcome],
    ) -> Option<&'a SampleBlock> {
        match sink.from {
            NodeRef::Source(i) => sources.get(i).and_then(|b| b.as_ref()),
            NodeRef::Mix(j) => outcomes.get(j).and_then(|o| o.block()),
        }
    }
}

impl fmt::Display for MixPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for source in &self.sources {
            write!(f, "source {}", source.name)?;
            if let Some(address) = &source.address {
                write!(f, " <- {}", address)?;
            }
            if source.throttle {
                write!(f, " [throttled]")?;
            }
            writeln!(f)?;
        }
        for planned in &self.mixes {
            let terms: Vec<String> = planned
                .inputs
                .iter()
                .zip(planned.combiner.weights())
                .map(|((_, name), w)| format!("{}*{}", w, name))
                .collect();
            writeln!(f, "mix {} = {}", planned.name, terms.join(" + "))?;
        }
        for sink in &self.sinks {
            writeln!(f, "sink {} <- {}", sink.name, sink.from_name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{constant_block, max_abs_diff, Sample};

    fn ones(n: usize) -> Option<SampleBlock> {
        Some(constant_block(Sample::new(1.0, 0.0), n))
    }

    #[test]
    fn test_default_topology_is_valid() {
        let plan = Topology::default().validate().unwrap();
        assert_eq!(plan.sources.len(), 4);
        assert_eq!(plan.mixes.len(), 4);
        assert_eq!(plan.sinks.len(), 4);
        assert!(plan.sources[0].throttle);
        assert!(!plan.sources[1].throttle);
        assert_eq!(plan.mixes[0].combiner.weights(), &[0.8, 0.6, 0.4]);
    }

    fn fed_by<'a>(plan: &'a MixPlan, source: &str) -> Vec<(&'a str, Weight)> {
        let mut fed: Vec<(&str, Weight)> = plan
            .mixes
            .iter()
            .flat_map(|m| {
                m.inputs
                    .iter()
                    .zip(m.combiner.weights())
                    .filter(|((_, from), _)| from == source)
                    .map(move |(_, w)| (m.name.as_str(), *w))
            })
            .collect();
        fed.sort_by(|a, b| a.0.cmp(b.0));
        fed
    }

    #[test]
    fn test_multi_ue_wiring() {
        let plan = Topology::multi_ue().validate().unwrap();
        assert!(plan.sources[0].throttle);
        assert_eq!(plan.sources[0].name, "enb_dl");

        // Throttled eNB fanned out to the three UEs
        assert_eq!(
            fed_by(&plan, "enb_dl"),
            vec![("dl_ue1", 0.8), ("dl_ue2", 0.6), ("dl_ue3", 0.4)]
        );

        // UE uplinks summed back into the eNB
        let ul = plan.mix_index("ul_sum").unwrap();
        let inputs: Vec<&str> = plan.mixes[ul].inputs.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(inputs, ["ue1_ul", "ue2_ul", "ue3_ul"]);
        assert_eq!(plan.mixes[ul].combiner.weights(), &[0.8, 0.6, 0.4]);
        assert_eq!(plan.sinks[0].from_name, "ul_sum");
    }

    #[test]
    fn test_default_wiring_differs_from_multi_ue() {
        let plan = Topology::default().validate().unwrap();
        // The throttled source is summed, the last one is fanned out
        assert_eq!(fed_by(&plan, "s0"), vec![("mix_a", 0.8)]);
        assert_eq!(
            fed_by(&plan, "s3"),
            vec![("mix_b", 0.8), ("mix_c", 0.4), ("mix_d", 0.6)]
        );
    }

    #[test]
    fn test_evaluate_default_topology() {
        let plan = Topology::default().validate().unwrap();
        let sources = vec![ones(4), ones(4), ones(4), ones(4)];
        let outcomes = plan.evaluate(&sources);

        let expect = [1.8f32, 0.8, 0.4, 0.6];
        for (outcome, value) in outcomes.iter().zip(expect) {
            let block = outcome.block().unwrap();
            let reference = constant_block(Sample::new(value, 0.0), 4);
            assert!(max_abs_diff(block, &reference).unwrap() < 1e-6);
        }
    }

    #[test]
    fn test_missing_source_skips_dependents_only() {
        let plan = Topology::default().validate().unwrap();
        let sources = vec![ones(4), None, ones(4), ones(4)];
        let outcomes = plan.evaluate(&sources);

        assert!(matches!(&outcomes[0], MixOutcome::Skipped { missing } if missing == "s1"));
        assert!(outcomes[1..].iter().all(|o| o.block().is_some()));
    }

    #[test]
    fn test_chained_mixes_are_ordered() {
        let topology = Topology {
            sources: vec![SourceSpec::new("a", "tcp://127.0.0.1:1")],
            mixes: vec![mix("late"), mix("early")],
            edges: vec![edge("early", "late", 0.5), edge("a", "early", 1.0)],
            sinks: vec![SinkSpec::new("out", "late", "tcp://127.0.0.1:2")],
        };
        let plan = topology.validate().unwrap();
        assert_eq!(plan.mixes[0].name, "early");
        assert_eq!(plan.mixes[1].inputs[0].0, NodeRef::Mix(0));
        assert_eq!(plan.sinks[0].from, NodeRef::Mix(1));

        let outcomes = plan.evaluate(&[ones(2)]);
        assert_eq!(outcomes[1].block().unwrap()[0], Sample::new(0.5, 0.0));
    }

    #[test]
    fn test_validation_failures() {
        let mut t = Topology::default();
        t.mixes.push(mix("s0"));
        assert_eq!(t.validate(), Err(TopologyError::DuplicateName("s0".into())));

        let mut t = Topology::default();
        t.edges.push(edge("s9", "mix_a", 0.5));
        assert!(matches!(t.validate(), Err(TopologyError::UnknownNode { missing, .. }) if missing == "s9"));

        let mut t = Topology::default();
        t.edges.push(edge("s3", "s1", 0.5));
        assert!(matches!(t.validate(), Err(TopologyError::TargetNotMix { .. })));

        let mut t = Topology::default();
        t.edges.push(edge("s3", "out_a", 0.5));
        assert!(matches!(t.validate(), Err(TopologyError::TargetNotMix { .. })));

        let mut t = Topology::default();
        t.edges[0].weight = 1.5;
        assert!(matches!(t.validate(), Err(TopologyError::InvalidWeight { .. })));

        let mut t = Topology::default();
        t.edges.push(edge("s0", "mix_a", 0.5));
        assert!(matches!(t.validate(), Err(TopologyError::DuplicateEdge { .. })));

        let mut t = Topology::default();
        t.mixes.push(mix("idle"));
        assert_eq!(t.validate(), Err(TopologyError::EmptyMix("idle".into())));

        let mut t = Topology::default();
        t.sinks[0].from = "nowhere".into();
        assert!(matches!(t.validate(), Err(TopologyError::UnknownSinkInput { .. })));

        let mut t = Topology::default();
        t.sinks.clear();
        assert_eq!(t.validate(), Err(TopologyError::NoSinks));
    }

    #[test]
    fn test_cycle_detected() {
        let topology = Topology {
            sources: vec![SourceSpec::new("a", "tcp://127.0.0.1:1")],
            mixes: vec![mix("m1"), mix("m2")],
            edges: vec![
                edge("a", "m1", 0.5),
                edge("m2", "m1", 0.5),
                edge("m1", "m2", 0.5),
            ],
            sinks: vec![SinkSpec::new("out", "m1", "tcp://127.0.0.1:2")],
        };
        match topology.validate() {
            Err(TopologyError::Cycle(names)) => assert_eq!(names, vec!["m1", "m2"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_with_weight() {
        let plan = Topology::default().validate().unwrap();
        let updated = plan.with_weight("mix_a", "s1", 0.2).unwrap();
        assert_eq!(updated.mixes[0].combiner.weights(), &[0.8, 0.2, 0.4]);
        assert_eq!(plan.mixes[0].combiner.weights(), &[0.8, 0.6, 0.4]);

        assert!(matches!(
            plan.with_weight("mix_a", "s1", 0.0),
            Err(MixerError::InvalidWeight { .. })
        ));
        assert!(matches!(
            plan.with_weight("mix_b", "s0", 0.5),
            Err(MixerError::Topology(TopologyError::UnknownEdge { .. }))
        ));
    }

    #[test]
    fn test_yaml_descriptor() {
        let yaml = r#"
sources:
  - name: rx
    address: tcp://127.0.0.1:5000
    throttle: true
mixes:
  - name: half
edges:
  - { from: rx, to: half, weight: 0.5 }
sinks:
  - name: tx
    from: half
    address: tcp://0.0.0.0:5001
    timeout_ms: 250
"#;
        let topology: Topology = serde_yaml::from_str(yaml).unwrap();
        assert!(topology.sources[0].throttle);
        assert_eq!(topology.sinks[0].timeout_ms, Some(250));
        let plan = topology.validate().unwrap();
        assert_eq!(plan.to_string().lines().nth(1), Some("mix half = 0.5*rx"));
    }
}
