//! Layer graphs with per-call activation traces
//!
//! A [`Graph`] is a DAG whose nodes are either a layer applied to an earlier
//! node or the elementwise sum of two earlier nodes. Nodes are appended in
//! topological order, so the node list is its own schedule.
//!
//! [`Graph::forward`] returns a [`Trace`] holding every node activation of
//! that call. [`Graph::backward`] consumes a trace, so one graph can be run
//! on several inputs (the three image slices) and each run back-propagated
//! separately while the parameter gradients accumulate in the shared layers.

use crate::error::{ModelError, Result};
use crate::layers::{FeatureShape, Layer, LayerState};
use crate::optimizers::Optimizer;
use log::trace;
use std::collections::{BTreeMap, HashSet};

/// Index of a node within its graph.
pub type NodeId = usize;

enum Op {
    Input,
    Layer { layer: Box<dyn Layer>, input: NodeId },
    Add { lhs: NodeId, rhs: NodeId },
}

struct Node {
    op: Op,
    shape: FeatureShape,
}

/// Named DAG of layers.
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    layer_names: HashSet<String>,
}

/// Activations recorded by one [`Graph::forward`] call.
pub struct Trace {
    batch_size: usize,
    activations: Vec<Vec<f32>>,
}

impl Trace {
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Activation of the graph's output node.
    pub fn output(&self) -> &[f32] {
        self.activations.last().map(|a| a.as_slice()).unwrap_or(&[])
    }

    pub fn into_output(mut self) -> Vec<f32> {
        self.activations.pop().unwrap_or_default()
    }

    pub fn activation(&self, node: NodeId) -> Option<&[f32]> {
        self.activations.get(node).map(|a| a.as_slice())
    }
}

impl Graph {
    /// Creates a graph holding only its input node (id 0).
    pub fn new(name: &str, input_shape: FeatureShape) -> Self {
        Self {
            name: name.to_string(),
            nodes: vec![Node {
                op: Op::Input,
                shape: input_shape,
            }],
            layer_names: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> NodeId {
        0
    }

    /// Most recently added node; the graph's output.
    pub fn output(&self) -> NodeId {
        self.nodes.len() - 1
    }

    pub fn input_shape(&self) -> FeatureShape {
        self.nodes[0].shape
    }

    pub fn output_shape(&self) -> FeatureShape {
        self.node_shape(self.output())
    }

    pub fn node_shape(&self, node: NodeId) -> FeatureShape {
        self.nodes[node].shape
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Appends `layer` fed by `input`.
    ///
    /// # Errors
    ///
    /// Fails if `input` does not exist, if the layer expects a different
    /// input shape, or if the layer name is already taken.
    pub fn add_layer(&mut self, input: NodeId, layer: Box<dyn Layer>) -> Result<NodeId> {
        let source = self.checked_shape(input)?;
        if layer.input_shape() != source {
            return Err(ModelError::Shape {
                expected: layer.input_shape().dims(),
                actual: source.dims(),
            });
        }
        if !self.layer_names.insert(layer.name().to_string()) {
            return Err(ModelError::Config(format!(
                "duplicate layer name '{}' in graph '{}'",
                layer.name(),
                self.name
            )));
        }
        let shape = layer.output_shape();
        self.nodes.push(Node {
            op: Op::Layer { layer, input },
            shape,
        });
        Ok(self.output())
    }

    /// Appends the elementwise sum of two nodes of identical shape.
    pub fn add_sum(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        let left = self.checked_shape(lhs)?;
        let right = self.checked_shape(rhs)?;
        if left != right {
            return Err(ModelError::Shape {
                expected: left.dims(),
                actual: right.dims(),
            });
        }
        self.nodes.push(Node {
            op: Op::Add { lhs, rhs },
            shape: left,
        });
        Ok(self.output())
    }

    fn checked_shape(&self, node: NodeId) -> Result<FeatureShape> {
        self.nodes
            .get(node)
            .map(|n| n.shape)
            .ok_or_else(|| ModelError::Config(format!("graph '{}' has no node {}", self.name, node)))
    }

    fn layers(&self) -> impl Iterator<Item = &dyn Layer> {
        self.nodes.iter().filter_map(|node| match &node.op {
            Op::Layer { layer, .. } => Some(layer.as_ref()),
            _ => None,
        })
    }

    fn layers_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Layer>> {
        self.nodes.iter_mut().filter_map(|node| match &mut node.op {
            Op::Layer { layer, .. } => Some(layer),
            _ => None,
        })
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers().map(|l| l.name().to_string()).collect()
    }

    pub fn layer(&self, name: &str) -> Option<&dyn Layer> {
        self.layers().find(|l| l.name() == name)
    }

    /// Runs the graph on `batch_size` samples laid out back to back.
    pub fn forward(&self, input: &[f32], batch_size: usize) -> Result<Trace> {
        let expected = batch_size * self.input_shape().len();
        if input.len() != expected {
            return Err(ModelError::Shape {
                expected: vec![batch_size, self.input_shape().len()],
                actual: vec![input.len()],
            });
        }

        let mut activations: Vec<Vec<f32>> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let value = match &node.op {
                Op::Input => input.to_vec(),
                Op::Layer { layer, input } => {
                    let mut out = vec![0.0f32; batch_size * node.shape.len()];
                    layer.forward(&activations[*input], &mut out, batch_size);
                    out
                }
                Op::Add { lhs, rhs } => activations[*lhs]
                    .iter()
                    .zip(activations[*rhs].iter())
                    .map(|(a, b)| a + b)
                    .collect(),
            };
            activations.push(value);
        }
        trace!("{}: forward over {} nodes", self.name, self.nodes.len());

        Ok(Trace {
            batch_size,
            activations,
        })
    }

    /// Back-propagates `grad_output` through the call recorded in `trace`.
    ///
    /// Returns the gradient w.r.t. the graph input. Parameter gradients are
    /// added to the layers' accumulators.
    pub fn backward(&self, trace: &Trace, grad_output: &[f32]) -> Result<Vec<f32>> {
        if trace.activations.len() != self.nodes.len() {
            return Err(ModelError::Config(format!(
                "trace does not belong to graph '{}'",
                self.name
            )));
        }
        let batch_size = trace.batch_size;
        let out_len = batch_size * self.output_shape().len();
        if grad_output.len() != out_len {
            return Err(ModelError::Shape {
                expected: vec![out_len],
                actual: vec![grad_output.len()],
            });
        }

        let mut grads: Vec<Option<Vec<f32>>> = (0..self.nodes.len()).map(|_| None).collect();
        grads[self.output()] = Some(grad_output.to_vec());

        for id in (1..self.nodes.len()).rev() {
            // Nodes that do not reach the output contribute nothing
            let Some(grad) = grads[id].take() else {
                continue;
            };
            match &self.nodes[id].op {
                Op::Input => {}
                Op::Layer { layer, input } => {
                    let mut grad_input = vec![0.0f32; trace.activations[*input].len()];
                    layer.backward(&trace.activations[*input], &grad, &mut grad_input, batch_size);
                    accumulate(&mut grads[*input], grad_input);
                }
                Op::Add { lhs, rhs } => {
                    accumulate(&mut grads[*lhs], grad.clone());
                    accumulate(&mut grads[*rhs], grad);
                }
            }
        }

        Ok(grads[0]
            .take()
            .unwrap_or_else(|| vec![0.0; trace.activations[0].len()]))
    }

    pub fn set_training(&mut self, training: bool) {
        for layer in self.layers_mut() {
            layer.set_training(training);
        }
    }

    pub fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) {
        for layer in self.layers_mut() {
            layer.update_with_optimizer(optimizer);
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.layers().map(|l| l.parameter_count()).sum()
    }

    pub fn state(&self) -> LayerState {
        self.layers().flat_map(|l| l.state()).collect()
    }

    pub fn load_state(&mut self, state: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        for layer in self.layers_mut() {
            layer.load_state(state)?;
        }
        Ok(())
    }
}

fn accumulate(slot: &mut Option<Vec<f32>>, grad: Vec<f32>) {
    match slot {
        Some(existing) => existing.iter_mut().zip(grad).for_each(|(e, g)| *e += g),
        None => *slot = Some(grad),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Activation, ActivationLayer, DenseLayer};
    use crate::optimizers::SGD;
    use crate::utils::SimpleRng;

    fn residual_graph() -> Graph {
        let mut rng = SimpleRng::new(3);
        let mut graph = Graph::new("residual", FeatureShape::Vector(4));
        let input = graph.input();
        let dense = graph
            .add_layer(input, Box::new(DenseLayer::new("dense", FeatureShape::Vector(4), 4, &mut rng)))
            .unwrap();
        let relu = graph
            .add_layer(
                dense,
                Box::new(ActivationLayer::new("relu", FeatureShape::Vector(4), Activation::Relu)),
            )
            .unwrap();
        graph.add_sum(relu, input).unwrap();
        graph
    }

    #[test]
    fn test_graph_shapes_and_names() {
        let graph = residual_graph();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.output_shape(), FeatureShape::Vector(4));
        assert_eq!(graph.layer_names(), vec!["dense", "relu"]);
        assert_eq!(graph.parameter_count(), 20);
        assert!(graph.layer("dense").is_some());
    }

    #[test]
    fn test_graph_rejects_shape_mismatch_and_duplicates() {
        let mut rng = SimpleRng::new(3);
        let mut graph = residual_graph();
        let wrong = DenseLayer::new("other", FeatureShape::Vector(3), 2, &mut rng);
        assert!(graph.add_layer(0, Box::new(wrong)).is_err());

        let duplicate = DenseLayer::new("dense", FeatureShape::Vector(4), 2, &mut rng);
        assert!(graph.add_layer(0, Box::new(duplicate)).is_err());

        let mut rng = SimpleRng::new(3);
        let head = graph
            .add_layer(0, Box::new(DenseLayer::new("narrow", FeatureShape::Vector(4), 2, &mut rng)))
            .unwrap();
        assert!(graph.add_sum(head, 0).is_err());
    }

    #[test]
    fn test_identity_shortcut_passes_gradient() {
        let graph = residual_graph();
        let input = vec![0.5, -0.5, 1.0, -1.0];
        let trace = graph.forward(&input, 1).unwrap();
        let grad = graph.backward(&trace, &[1.0, 1.0, 1.0, 1.0]).unwrap();
        assert_eq!(grad.len(), 4);
        // Shortcut contributes exactly 1 to every input gradient; dense path adds the rest
        let dense = graph.layer("dense").unwrap();
        assert_eq!(dense.input_size(), 4);
        assert!(grad.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn test_traces_are_independent_and_gradients_accumulate() {
        let mut graph = residual_graph();
        let a = graph.forward(&[1.0, 2.0, 3.0, 4.0], 1).unwrap();
        // Negated input flips every dense pre-activation, so ReLU lets each unit through once
        let b = graph.forward(&[-1.0, -2.0, -3.0, -4.0], 1).unwrap();
        assert_ne!(a.output(), b.output());

        graph.backward(&a, &[1.0; 4]).unwrap();
        graph.backward(&b, &[1.0; 4]).unwrap();

        let before = graph.state();
        graph.update_with_optimizer(&mut SGD::new(0.1));
        let after = graph.state();
        assert_ne!(before, after);
    }

    #[test]
    fn test_forward_checks_input_length() {
        let graph = residual_graph();
        assert!(graph.forward(&[1.0, 2.0], 1).is_err());
    }
}
