//! Stage 5: goal-threshold sensitivity.
//!
//! Each option is scored by the probability that the goal clears its
//! threshold under a normal approximation of the causal model. The stated
//! threshold is then perturbed to see whether the winning option holds.
//! Everything here is advisory; the driver isolates failures.

use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{SweepError, SweepResult};
use crate::graph::{Graph, Node, NodeKind};

/// Variance below which a value is treated as certain.
const CERTAIN: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Robustness {
    /// Same winner at every explored threshold.
    Robust,
    Fragile,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionProbability {
    pub option_id: String,
    /// P(goal >= threshold) when this option is chosen.
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPoint {
    pub offset: f64,
    pub threshold: f64,
    pub winner: String,
    pub probabilities: Vec<OptionProbability>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdSweepResult {
    pub goal_node_id: String,
    pub threshold: f64,
    pub baseline_winner: String,
    pub baseline_probabilities: Vec<OptionProbability>,
    pub points: Vec<SweepPoint>,
    pub stable: bool,
    pub robustness: Robustness,
}

/// Scores options against perturbed goal thresholds.
///
/// `Ok(None)` means there was nothing to sweep.
pub trait ThresholdAnalyzer: Send + Sync {
    fn sweep(&self, graph: &Graph, offsets: &[f64]) -> SweepResult<Option<ThresholdSweepResult>>;
}

/// Linear-Gaussian propagation over the causal edges.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalApproxSweep;

impl ThresholdAnalyzer for NormalApproxSweep {
    fn sweep(&self, graph: &Graph, offsets: &[f64]) -> SweepResult<Option<ThresholdSweepResult>> {
        let Some(goal) = graph.goal() else {
            return Ok(None);
        };
        let Some(threshold) = goal.goal_data().and_then(|d| d.goal_threshold) else {
            return Ok(None);
        };

        let options: Vec<&Node> = graph.nodes_of_kind(NodeKind::Option).collect();
        if options.is_empty() {
            return Err(SweepError::NoOptions);
        }
        let order = causal_order(graph)?;
        if !reachable_from_options(graph, &options, &goal.id) {
            return Err(SweepError::Unreachable {
                goal: goal.id.clone(),
            });
        }

        let outcomes: Vec<(&str, Moments)> = options
            .iter()
            .map(|o| (o.id.as_str(), propagate(graph, &order, o, &goal.id)))
            .collect();

        let (baseline_winner, baseline_probabilities) = score(&outcomes, threshold);
        let points: Vec<SweepPoint> = offsets
            .iter()
            .map(|&offset| {
                let perturbed = perturb(threshold, offset);
                let (winner, probabilities) = score(&outcomes, perturbed);
                SweepPoint {
                    offset,
                    threshold: perturbed,
                    winner,
                    probabilities,
                }
            })
            .collect();

        let stable = points.iter().all(|p| p.winner == baseline_winner);
        Ok(Some(ThresholdSweepResult {
            goal_node_id: goal.id.clone(),
            threshold,
            baseline_winner,
            baseline_probabilities,
            points,
            stable,
            robustness: if stable {
                Robustness::Robust
            } else {
                Robustness::Fragile
            },
        }))
    }
}

pub fn run(
    analyzer: &dyn ThresholdAnalyzer,
    graph: &Graph,
    offsets: &[f64],
) -> SweepResult<Option<ThresholdSweepResult>> {
    analyzer.sweep(graph, offsets)
}

/// Relative perturbation, absolute when the threshold is zero.
fn perturb(threshold: f64, offset: f64) -> f64 {
    if threshold == 0.0 {
        offset
    } else {
        threshold * (1.0 + offset)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Moments {
    mean: f64,
    variance: f64,
}

/// Topological order of all nodes over causal edges (Kahn).
fn causal_order(graph: &Graph) -> SweepResult<Vec<&str>> {
    let mut indegree: HashMap<&str, usize> = graph.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in graph.edges.iter().filter(|e| graph.is_causal(e)) {
        *indegree.entry(edge.to.as_str()).or_insert(0) += 1;
        children.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }

    let mut ready: VecDeque<&str> = graph
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| indegree.get(id) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(graph.nodes.len());
    while let Some(id) = ready.pop_front() {
        order.push(id);
        for &child in children.get(id).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(child) {
                *d -= 1;
                if *d == 0 {
                    ready.push_back(child);
                }
            }
        }
    }

    if order.len() < graph.nodes.len() {
        let placed: HashSet<&str> = order.iter().copied().collect();
        let node = graph
            .nodes
            .iter()
            .find(|n| !placed.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .unwrap_or_default();
        return Err(SweepError::Cycle { node });
    }
    Ok(order)
}

/// Factors any option sets, by intervention or by an option→factor edge.
fn levers<'a>(graph: &'a Graph, options: &[&'a Node]) -> HashSet<&'a str> {
    let mut set: HashSet<&str> = HashSet::new();
    for option in options {
        if let Some(interventions) = option.option_data().and_then(|d| d.interventions.as_ref()) {
            set.extend(interventions.keys().map(String::as_str));
        }
        for edge in graph.outgoing(&option.id) {
            if graph.kind_of(&edge.to) == Some(NodeKind::Factor) {
                set.insert(edge.to.as_str());
            }
        }
    }
    set
}

fn reachable_from_options(graph: &Graph, options: &[&Node], goal: &str) -> bool {
    let mut seen = levers(graph, options);
    let mut frontier: Vec<&str> = seen.iter().copied().collect();
    while let Some(id) = frontier.pop() {
        if id == goal {
            return true;
        }
        for edge in graph.outgoing(id).filter(|e| graph.is_causal(e)) {
            if seen.insert(edge.to.as_str()) {
                frontier.push(edge.to.as_str());
            }
        }
    }
    false
}

/// Goal moments when `option` is chosen.
///
/// Intervened factors are fixed. Other nodes with causal parents sum
/// `belief * strength * parent` terms, treated as independent. Sources take
/// their own `value`, else `baseline`, else zero.
fn propagate(graph: &Graph, order: &[&str], option: &Node, goal: &str) -> Moments {
    let interventions = option.interventions();
    let mut moments: HashMap<&str, Moments> = HashMap::with_capacity(order.len());

    for &id in order {
        let fixed = interventions.get(id).copied();
        let parents: Vec<_> = graph.incoming(id).filter(|e| graph.is_causal(e)).collect();

        let m = match fixed {
            Some(value) => Moments {
                mean: value,
                variance: 0.0,
            },
            None if parents.is_empty() => Moments {
                mean: own_value(graph, id),
                variance: 0.0,
            },
            None => parents.iter().fold(Moments::default(), |acc, edge| {
                let src = moments.get(edge.from.as_str()).copied().unwrap_or_default();
                let b = edge.belief_exists.unwrap_or(1.0).clamp(0.0, 1.0);
                let w = edge.strength_mean.unwrap_or_else(|| edge.signed_weight());
                let s = edge.strength_std.unwrap_or(0.0);
                // X = B * W * S with B ~ Bernoulli(b), W ~ N(w, s^2)
                let mean = b * w * src.mean;
                let second = b * (w * w + s * s) * (src.mean * src.mean + src.variance);
                Moments {
                    mean: acc.mean + mean,
                    variance: acc.variance + (second - mean * mean).max(0.0),
                }
            }),
        };
        moments.insert(id, m);
    }

    moments.get(goal).copied().unwrap_or_default()
}

fn own_value(graph: &Graph, id: &str) -> f64 {
    graph
        .node(id)
        .and_then(Node::factor_data)
        .and_then(|d| d.value.or(d.baseline))
        .unwrap_or(0.0)
}

/// Winner and per-option probabilities at `threshold`. Ties keep the
/// earlier option.
fn score(outcomes: &[(&str, Moments)], threshold: f64) -> (String, Vec<OptionProbability>) {
    let probabilities: Vec<OptionProbability> = outcomes
        .iter()
        .map(|(id, m)| OptionProbability {
            option_id: id.to_string(),
            probability: round4(exceedance(*m, threshold)),
        })
        .collect();

    let mut winner = 0;
    for (i, p) in probabilities.iter().enumerate() {
        if p.probability > probabilities[winner].probability {
            winner = i;
        }
    }
    let winner_id = probabilities
        .get(winner)
        .map(|p| p.option_id.clone())
        .unwrap_or_default();
    (winner_id, probabilities)
}

/// P(X >= t) for X ~ N(mean, variance).
fn exceedance(m: Moments, t: f64) -> f64 {
    if m.variance < CERTAIN {
        return if m.mean >= t { 1.0 } else { 0.0 };
    }
    let z = (t - m.mean) / (m.variance.sqrt() * std::f64::consts::SQRT_2);
    0.5 * erfc(z)
}

/// Complementary error function (Numerical Recipes `erfcc`, |error| < 1.2e-7).
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let r = t * poly.exp();
    if x >= 0.0 {
        r
    } else {
        2.0 - r
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
