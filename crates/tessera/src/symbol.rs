// Symbol — Declarative computation graphs over a closed operator set
//
// A Symbol is an immutable DAG of operator nodes. Leaves are named
// Variables; every other node applies one Operator to its inputs. Building a
// graph does no computation: `bind` pairs the graph with concrete arrays on
// one device and returns an Executor, and `Executor::forward` walks the graph
// in topological order and submits one NDArray operation per node.
//
// OPERATORS
//
//   Variable                       -> no inputs
//   FullyConnected { num_hidden }  -> data, weight, bias (unless no_bias)
//   Activation { act_type }        -> data
//   ElemwiseAdd / ElemwiseMul      -> lhs, rhs
//   Softmax                        -> data
//
// `fully_connected` creates its parameter variables itself, named
// `{name}_weight` and `{name}_bias`, so that `list_arguments` of
//
//   fc1 = FullyConnected(data, num_hidden=4, name="fc1")
//
// is `["data", "fc1_weight", "fc1_bias"]`.
//
// SHAPE INFERENCE
//
//   Shapes flow forward from whatever argument shapes are known. The weight
//   and bias of a dense layer follow from its data shape; an unknown operand
//   of an elementwise op takes the shape of the other. Every argument of
//   `bind` is checked against the inferred shape before anything is queued.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tessera_core::{bail, Device, Error, Result, Shape};
use tessera_engine::Engine;

use crate::ndarray::NDArray;

/// Nonlinearity of an `Activation` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActType {
    Relu,
    Sigmoid,
    Tanh,
}

/// The closed set of graph operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Variable,
    FullyConnected { num_hidden: usize, no_bias: bool },
    Activation { act_type: ActType },
    ElemwiseAdd,
    ElemwiseMul,
    Softmax,
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Variable => "Variable",
            Operator::FullyConnected { .. } => "FullyConnected",
            Operator::Activation { .. } => "Activation",
            Operator::ElemwiseAdd => "elemwise_add",
            Operator::ElemwiseMul => "elemwise_mul",
            Operator::Softmax => "softmax",
        }
    }

    /// Names of the operator's inputs, in order.
    pub fn input_names(&self) -> &'static [&'static str] {
        match self {
            Operator::Variable => &[],
            Operator::FullyConnected { no_bias: false, .. } => &["data", "weight", "bias"],
            Operator::FullyConnected { no_bias: true, .. } => &["data", "weight"],
            Operator::Activation { .. } | Operator::Softmax => &["data"],
            Operator::ElemwiseAdd | Operator::ElemwiseMul => &["lhs", "rhs"],
        }
    }
}

#[derive(Debug)]
struct SymNode {
    name: String,
    op: Operator,
    inputs: Vec<Symbol>,
}

/// Handle to a node of a computation graph.
#[derive(Debug, Clone)]
pub struct Symbol {
    node: Arc<SymNode>,
}

/// Result of [`Symbol::infer_shape`].
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeInfo {
    /// Every argument, in `list_arguments` order.
    pub arguments: Vec<(String, Shape)>,
    pub output: Shape,
}

impl Symbol {
    fn build(name: impl Into<String>, op: Operator, inputs: Vec<Symbol>) -> Symbol {
        debug_assert_eq!(inputs.len(), op.input_names().len());
        Symbol {
            node: Arc::new(SymNode {
                name: name.into(),
                op,
                inputs,
            }),
        }
    }

    /// A named graph input.
    pub fn variable(name: impl Into<String>) -> Symbol {
        Self::build(name, Operator::Variable, Vec::new())
    }

    /// Dense layer over `data`, creating `{name}_weight` (and `{name}_bias`
    /// unless `no_bias`).
    pub fn fully_connected(
        name: impl Into<String>,
        data: &Symbol,
        num_hidden: usize,
        no_bias: bool,
    ) -> Symbol {
        let name = name.into();
        let mut inputs = vec![data.clone(), Symbol::variable(format!("{name}_weight"))];
        if !no_bias {
            inputs.push(Symbol::variable(format!("{name}_bias")));
        }
        Self::build(
            name,
            Operator::FullyConnected {
                num_hidden,
                no_bias,
            },
            inputs,
        )
    }

    pub fn activation(name: impl Into<String>, data: &Symbol, act_type: ActType) -> Symbol {
        Self::build(name, Operator::Activation { act_type }, vec![data.clone()])
    }

    pub fn elemwise_add(name: impl Into<String>, lhs: &Symbol, rhs: &Symbol) -> Symbol {
        Self::build(name, Operator::ElemwiseAdd, vec![lhs.clone(), rhs.clone()])
    }

    pub fn elemwise_mul(name: impl Into<String>, lhs: &Symbol, rhs: &Symbol) -> Symbol {
        Self::build(name, Operator::ElemwiseMul, vec![lhs.clone(), rhs.clone()])
    }

    pub fn softmax(name: impl Into<String>, data: &Symbol) -> Symbol {
        Self::build(name, Operator::Softmax, vec![data.clone()])
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn op(&self) -> Operator {
        self.node.op
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.node) as usize
    }

    /// All nodes reachable from `self`, inputs before consumers.
    fn topo_order(&self) -> Vec<Symbol> {
        fn visit(s: &Symbol, seen: &mut HashSet<usize>, order: &mut Vec<Symbol>) {
            if !seen.insert(s.key()) {
                return;
            }
            for input in &s.node.inputs {
                visit(input, seen, order);
            }
            order.push(s.clone());
        }
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        visit(self, &mut seen, &mut order);
        order
    }

    /// Names of the graph's variables, in first-use order.
    pub fn list_arguments(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for s in self.topo_order() {
            if s.op() == Operator::Variable && !names.iter().any(|n| n == s.name()) {
                names.push(s.name().to_string());
            }
        }
        names
    }

    /// Infer every argument shape and the output shape from the shapes in
    /// `known`.
    pub fn infer_shape(&self, known: &HashMap<String, Shape>) -> Result<ShapeInfo> {
        let order = self.topo_order();
        let mut vars: HashMap<String, Shape> = known.clone();
        // Parameter shapes implied by consumers are only known once the
        // consumer is reached, so iterate until nothing changes.
        let mut outputs: HashMap<usize, Shape> = HashMap::new();
        loop {
            let before = (vars.len(), outputs.len());
            for s in &order {
                if outputs.contains_key(&s.key()) {
                    continue;
                }
                if let Some(shape) = infer_node(s, &mut vars, &outputs)? {
                    outputs.insert(s.key(), shape);
                }
            }
            if (vars.len(), outputs.len()) == before {
                break;
            }
        }

        let mut arguments = Vec::new();
        for name in self.list_arguments() {
            match vars.get(&name) {
                Some(shape) => arguments.push((name, shape.clone())),
                None => {
                    return Err(Error::msg(format!(
                        "cannot infer the shape of argument '{name}'"
                    )))
                }
            }
        }
        let output = outputs.get(&self.key()).cloned().ok_or_else(|| {
            Error::msg(format!("cannot infer the output shape of '{}'", self.name()))
        })?;
        Ok(ShapeInfo { arguments, output })
    }

    /// Bind the graph to concrete arrays. Every argument must be present,
    /// on `device` of `engine`, with the inferred shape.
    pub fn bind(
        &self,
        engine: &Engine,
        device: Device,
        args: &HashMap<String, NDArray>,
    ) -> Result<Executor> {
        let arguments = self.list_arguments();
        for (name, array) in args {
            if !array.engine().same_engine(engine) {
                return Err(Error::EngineMismatch);
            }
            if array.device() != device {
                return Err(Error::DeviceMismatch {
                    expected: device,
                    got: array.device(),
                });
            }
            if !arguments.contains(name) {
                let symbol = self.name();
                bail!("'{name}' is not an argument of '{symbol}'");
            }
        }
        let missing: Vec<String> = arguments
            .into_iter()
            .filter(|n| !args.contains_key(n))
            .collect();
        if !missing.is_empty() {
            return Err(Error::msg(format!("missing arguments: {}", missing.join(", "))));
        }

        // Data drives inference; every other argument is then checked.
        let data_shapes: HashMap<String, Shape> = args
            .iter()
            .filter(|(name, _)| !self.is_parameter(name))
            .map(|(name, a)| (name.clone(), a.shape().clone()))
            .collect();
        let info = self.infer_shape(&data_shapes)?;
        for (name, expected) in &info.arguments {
            if let Some(array) = args.get(name) {
                array.shape().expect_eq(expected)?;
            }
        }

        log::debug!(
            "bound '{}' on {device}: {} nodes, output {}",
            self.name(),
            self.topo_order().len(),
            info.output
        );
        Ok(Executor {
            order: self.topo_order(),
            output: self.key(),
            args: args.clone(),
            output_shape: info.output,
        })
    }

    /// Whether `name` is a parameter created by a dense layer.
    fn is_parameter(&self, name: &str) -> bool {
        self.topo_order().iter().any(|s| match s.op() {
            Operator::FullyConnected { .. } => s.node.inputs[1..].iter().any(|p| p.name() == name),
            _ => false,
        })
    }
}

fn shape_of(
    s: &Symbol,
    vars: &HashMap<String, Shape>,
    outputs: &HashMap<usize, Shape>,
) -> Option<Shape> {
    match s.op() {
        Operator::Variable => vars.get(s.name()).cloned(),
        _ => outputs.get(&s.key()).cloned(),
    }
}

/// Set an unknown variable's shape, or check a known one.
fn unify(s: &Symbol, shape: Shape, vars: &mut HashMap<String, Shape>) -> Result<()> {
    if s.op() != Operator::Variable {
        return Ok(());
    }
    match vars.get(s.name()) {
        Some(known) => known.expect_eq(&shape),
        None => {
            vars.insert(s.name().to_string(), shape);
            Ok(())
        }
    }
}

/// Output shape of one node, or `None` while its inputs are still unknown.
fn infer_node(
    s: &Symbol,
    vars: &mut HashMap<String, Shape>,
    outputs: &HashMap<usize, Shape>,
) -> Result<Option<Shape>> {
    let inputs = &s.node.inputs;
    match s.op() {
        Operator::Variable => Ok(vars.get(s.name()).cloned()),
        Operator::FullyConnected { num_hidden, no_bias } => {
            let Some(data) = shape_of(&inputs[0], vars, outputs) else {
                return Ok(None);
            };
            if !data.is_matrix() {
                return Err(Error::RankMismatch {
                    expected: 2,
                    got: data.rank(),
                });
            }
            let (batch, input) = (data.dims()[0], data.dims()[1]);
            unify(&inputs[1], Shape::from((num_hidden, input)), vars)?;
            if !no_bias {
                unify(&inputs[2], Shape::from(num_hidden), vars)?;
            }
            Ok(Some(Shape::from((batch, num_hidden))))
        }
        Operator::Activation { .. } | Operator::Softmax => {
            Ok(shape_of(&inputs[0], vars, outputs))
        }
        Operator::ElemwiseAdd | Operator::ElemwiseMul => {
            let lhs = shape_of(&inputs[0], vars, outputs);
            let rhs = shape_of(&inputs[1], vars, outputs);
            match (lhs, rhs) {
                (Some(l), Some(r)) => {
                    r.expect_eq(&l)?;
                    Ok(Some(l))
                }
                (Some(l), None) => {
                    unify(&inputs[1], l.clone(), vars)?;
                    Ok(Some(l))
                }
                (None, Some(r)) => {
                    unify(&inputs[0], r.clone(), vars)?;
                    Ok(Some(r))
                }
                (None, None) => Ok(None),
            }
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in self.topo_order() {
            let inputs: Vec<&str> = s.node.inputs.iter().map(|i| i.name()).collect();
            writeln!(f, "{} = {}({})", s.name(), s.op().name(), inputs.join(", "))?;
        }
        Ok(())
    }
}

fn computed<'a>(values: &'a HashMap<usize, NDArray>, s: &Symbol, i: usize) -> Result<&'a NDArray> {
    values
        .get(&s.node.inputs[i].key())
        .ok_or_else(|| Error::msg(format!("input {i} of '{}' not computed", s.name())))
}

/// A graph bound to concrete arguments.
///
/// Arguments are shared with the caller: updating a bound array (with
/// `assign`, `copy_to` or an in-place op) affects the next `forward`.
pub struct Executor {
    order: Vec<Symbol>,
    output: usize,
    args: HashMap<String, NDArray>,
    output_shape: Shape,
}

impl Executor {
    /// Queue the whole graph and return its output. Does not block.
    pub fn forward(&self) -> Result<NDArray> {
        let mut values: HashMap<usize, NDArray> = HashMap::with_capacity(self.order.len());
        for s in &self.order {
            let input = |i: usize| computed(&values, s, i);
            let value = match s.op() {
                Operator::Variable => self
                    .args
                    .get(s.name())
                    .cloned()
                    .ok_or_else(|| Error::msg(format!("unbound argument '{}'", s.name())))?,
                Operator::FullyConnected { no_bias, .. } => {
                    let bias = if no_bias { None } else { Some(input(2)?) };
                    input(0)?.fully_connected(input(1)?, bias)?
                }
                Operator::Activation { act_type } => match act_type {
                    ActType::Relu => input(0)?.relu()?,
                    ActType::Sigmoid => input(0)?.sigmoid()?,
                    ActType::Tanh => input(0)?.tanh()?,
                },
                Operator::ElemwiseAdd => input(0)?.add(input(1)?)?,
                Operator::ElemwiseMul => input(0)?.mul(input(1)?)?,
                Operator::Softmax => input(0)?.softmax()?,
            };
            values.insert(s.key(), value);
        }
        values
            .remove(&self.output)
            .ok_or_else(|| Error::msg("graph output was not computed"))
    }

    pub fn arg(&self, name: &str) -> Option<&NDArray> {
        self.args.get(name)
    }

    /// Bound arguments by name, sorted for stable iteration.
    pub fn arg_arrays(&self) -> Vec<(String, NDArray)> {
        let mut args: Vec<(String, NDArray)> = self
            .args
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        args.sort_by(|a, b| a.0.cmp(&b.0));
        args
    }

    pub fn output_shape(&self) -> &Shape {
        &self.output_shape
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mlp() -> Symbol {
        let data = Symbol::variable("data");
        let fc1 = Symbol::fully_connected("fc1", &data, 8, false);
        let act = Symbol::activation("relu1", &fc1, ActType::Relu);
        let fc2 = Symbol::fully_connected("fc2", &act, 3, true);
        Symbol::softmax("out", &fc2)
    }

    #[test]
    fn test_list_arguments() {
        assert_eq!(
            mlp().list_arguments(),
            vec!["data", "fc1_weight", "fc1_bias", "fc2_weight"]
        );
    }

    #[test]
    fn test_infer_shape_from_data() {
        let known = HashMap::from([("data".to_string(), Shape::from((5, 4)))]);
        let info = mlp().infer_shape(&known).unwrap();
        assert_eq!(info.output, Shape::from((5, 3)));
        assert_eq!(
            info.arguments,
            vec![
                ("data".to_string(), Shape::from((5, 4))),
                ("fc1_weight".to_string(), Shape::from((8, 4))),
                ("fc1_bias".to_string(), Shape::from(8)),
                ("fc2_weight".to_string(), Shape::from((3, 8))),
            ]
        );
    }

    #[test]
    fn test_infer_shape_unknown_data() {
        assert!(mlp().infer_shape(&HashMap::new()).is_err());
    }

    #[test]
    fn test_elemwise_unifies_operands() {
        let a = Symbol::variable("a");
        let b = Symbol::variable("b");
        let sum = Symbol::elemwise_add("sum", &a, &b);
        let known = HashMap::from([("b".to_string(), Shape::from((2, 2)))]);
        let info = sum.infer_shape(&known).unwrap();
        assert_eq!(info.arguments[0], ("a".to_string(), Shape::from((2, 2))));

        let known = HashMap::from([
            ("a".to_string(), Shape::from(3)),
            ("b".to_string(), Shape::from(4)),
        ]);
        assert!(matches!(
            sum.infer_shape(&known),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_display_lists_nodes() {
        let text = mlp().to_string();
        assert!(text.contains("fc1 = FullyConnected(data, fc1_weight, fc1_bias)"));
        assert!(text.ends_with("out = softmax(fc2)\n"));
    }
}
