//! Sea-of-Nodes graph storage.
//!
//! The graph provides:
//! - **Arena-based storage**: nodes are addressed by [`NodeId`]
//! - **Use-def chains**: one use entry per input edge, kept in sync by every
//!   mutator
//! - **Cheap snapshots**: `Graph` is `Clone`, which is what rollback uses
//!
//! Nodes are never physically removed; [`Graph::kill`] marks them dead and
//! detaches them from their inputs' use lists.

use super::arena::{Arena, SecondaryMap};
use super::node::{Node, NodeFlags, NodeId};
use super::operators::{ControlOp, Operator};
use super::types::ValueType;

// =============================================================================
// Graph Structure
// =============================================================================

#[derive(Clone)]
pub struct Graph {
    nodes: Arena<Node>,
    uses: SecondaryMap<Node, Vec<NodeId>>,
    /// Control entry.
    pub start: NodeId,
}

impl Graph {
    pub fn new() -> Self {
        let mut nodes = Arena::with_capacity(256);
        let start = nodes.alloc(Node::new(
            Operator::Control(ControlOp::Start),
            &[],
            ValueType::Control,
        ));
        Graph {
            nodes,
            uses: SecondaryMap::new(),
            start,
        }
    }

    // =========================================================================
    // Node Access
    // =========================================================================

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    #[inline]
    pub fn op(&self, id: NodeId) -> Operator {
        self.nodes[id].op
    }

    /// Input `index` of `id`.
    #[inline]
    pub fn input(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.nodes[id].input(index)
    }

    /// Number of allocated nodes, dead ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Live nodes in allocation order.
    pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .filter(|(_, n)| !n.is_dead())
            .map(|(id, _)| id)
    }

    /// Add or clear a flag.
    pub fn set_flag(&mut self, id: NodeId, flag: NodeFlags, on: bool) {
        self.nodes[id].flags.set(flag, on);
    }

    // =========================================================================
    // Node Creation
    // =========================================================================

    /// Add a node, inferring its type from the operator and inputs.
    pub fn add_node(&mut self, op: Operator, inputs: &[NodeId]) -> NodeId {
        let input_types: Vec<ValueType> = inputs.iter().map(|&i| self.nodes[i].ty).collect();
        let ty = op.result_type(&input_types);
        self.add_node_with_type(op, inputs, ty)
    }

    /// Add a node with an explicit type.
    pub fn add_node_with_type(&mut self, op: Operator, inputs: &[NodeId], ty: ValueType) -> NodeId {
        let id = self.nodes.alloc(Node::new(op, inputs, ty));
        for &input in inputs {
            self.add_use(input, id);
        }
        id
    }

    /// Integer constant of type `ty` (`INT` or `LONG`).
    pub fn const_int(&mut self, value: i64, ty: ValueType) -> NodeId {
        self.add_node_with_type(Operator::ConstInt(value), &[], ty)
    }

    // =========================================================================
    // Use-Def Chains
    // =========================================================================

    /// Users of `id`, one entry per input edge.
    pub fn uses(&self, id: NodeId) -> &[NodeId] {
        self.uses.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Number of input edges that reference `id`.
    pub fn use_count(&self, id: NodeId) -> usize {
        self.uses.get(id).map_or(0, |v| v.len())
    }

    /// Distinct users of `id`, in first-use order.
    pub fn distinct_uses(&self, id: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = Vec::with_capacity(self.use_count(id));
        for &u in self.uses(id) {
            if !out.contains(&u) {
                out.push(u);
            }
        }
        out
    }

    fn add_use(&mut self, def: NodeId, user: NodeId) {
        self.uses[def].push(user);
    }

    fn remove_use(&mut self, def: NodeId, user: NodeId) {
        if let Some(list) = self.uses.get_mut(def) {
            if let Some(pos) = list.iter().position(|&u| u == user) {
                list.remove(pos);
            }
        }
    }

    // =========================================================================
    // Node Modification
    // =========================================================================

    /// Point input `index` of `node` at `new_input`.
    pub fn replace_input(&mut self, node: NodeId, index: usize, new_input: NodeId) {
        let old = self.nodes[node].inputs[index];
        if old == new_input {
            return;
        }
        self.remove_use(old, node);
        self.nodes[node].inputs[index] = new_input;
        self.add_use(new_input, node);
    }

    /// Append an input to `node` (closing loop heads after the fact).
    pub fn add_input(&mut self, node: NodeId, input: NodeId) {
        self.nodes[node].inputs.push(input);
        self.add_use(input, node);
    }

    /// Exchange two inputs of `node`. Use lists are unaffected.
    pub fn swap_inputs(&mut self, node: NodeId, a: usize, b: usize) {
        self.nodes[node].inputs.swap(a, b);
    }

    /// Redirect every edge that reads `old` to read `new`.
    pub fn replace_all_uses(&mut self, old: NodeId, new: NodeId) {
        let users = self.uses.get_mut(old).map(std::mem::take).unwrap_or_default();
        for user in users {
            for slot in self.nodes[user].inputs.iter_mut() {
                if *slot == old {
                    *slot = new;
                }
            }
        }
        // Rebuild `new`'s uses from scratch for the affected users.
        let mut fixed: Vec<NodeId> = Vec::new();
        for (id, node) in self.nodes.iter() {
            if node.is_dead() {
                continue;
            }
            for &input in node.inputs.iter() {
                if input == new {
                    fixed.push(id);
                }
            }
        }
        self.uses.set(new, fixed);
    }

    /// Mark `id` dead and detach it from its inputs.
    pub fn kill(&mut self, id: NodeId) {
        if self.nodes[id].is_dead() {
            return;
        }
        self.nodes[id].mark_dead();
        let inputs = self.nodes[id].inputs.clone();
        for input in inputs {
            self.remove_use(input, id);
        }
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Check that use lists mirror input lists exactly.
    pub fn verify(&self) -> Result<(), String> {
        for (id, node) in self.nodes.iter() {
            if node.is_dead() {
                continue;
            }
            for &input in node.inputs.iter() {
                if self.get(input).is_none() {
                    return Err(format!("{:?} reads unknown node {:?}", id, input));
                }
                if self.node(input).is_dead() {
                    return Err(format!("{:?} reads dead node {:?}", id, input));
                }
                let edges = node.inputs.iter().filter(|&&i| i == input).count();
                let recorded = self.uses(input).iter().filter(|&&u| u == id).count();
                if edges != recorded {
                    return Err(format!(
                        "use list of {:?} has {} entries for {:?}, expected {}",
                        input, recorded, id, edges
                    ));
                }
            }
        }
        Ok(())
    }

    /// Same live nodes with the same operators, inputs and types.
    pub fn structurally_equal(&self, other: &Graph) -> bool {
        if self.nodes.len() != other.nodes.len() {
            return false;
        }
        self.nodes.iter().zip(other.nodes.iter()).all(|((_, a), (_, b))| {
            a.is_dead() == b.is_dead()
                && (a.is_dead() || (a.op == b.op && a.inputs == b.inputs && a.ty == b.ty))
        })
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Graph ({} nodes):", self.nodes.len())?;
        for (id, node) in self.nodes.iter() {
            if !node.is_dead() {
                writeln!(f, "  {:?}: {:?}", id, node)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::operators::BinaryOp;
    use crate::ir::types::BasicType;

    fn add(g: &mut Graph, a: NodeId, b: NodeId) -> NodeId {
        g.add_node(Operator::Binary(BinaryOp::Add, BasicType::Int), &[a, b])
    }

    #[test]
    fn test_add_node_records_uses() {
        let mut g = Graph::new();
        let a = g.const_int(1, ValueType::INT);
        let b = g.const_int(2, ValueType::INT);
        let s = add(&mut g, a, b);
        assert_eq!(g.uses(a), &[s]);
        assert_eq!(g.node(s).ty, ValueType::INT);
        assert!(g.verify().is_ok());
    }

    #[test]
    fn test_duplicate_input_counts_twice() {
        let mut g = Graph::new();
        let a = g.const_int(3, ValueType::INT);
        let s = add(&mut g, a, a);
        assert_eq!(g.use_count(a), 2);
        assert_eq!(g.distinct_uses(a), vec![s]);
        assert!(g.verify().is_ok());
    }

    #[test]
    fn test_replace_input_and_swap() {
        let mut g = Graph::new();
        let a = g.const_int(1, ValueType::INT);
        let b = g.const_int(2, ValueType::INT);
        let c = g.const_int(3, ValueType::INT);
        let s = add(&mut g, a, b);
        g.replace_input(s, 1, c);
        assert_eq!(g.use_count(b), 0);
        assert_eq!(g.uses(c), &[s]);
        g.swap_inputs(s, 0, 1);
        assert_eq!(g.input(s, 0), Some(c));
        assert!(g.verify().is_ok());
    }

    #[test]
    fn test_replace_all_uses() {
        let mut g = Graph::new();
        let a = g.const_int(1, ValueType::INT);
        let b = g.const_int(2, ValueType::INT);
        let s1 = add(&mut g, a, a);
        let s2 = add(&mut g, a, b);
        g.replace_all_uses(a, b);
        assert_eq!(g.use_count(a), 0);
        assert_eq!(g.use_count(b), 3);
        assert_eq!(g.input(s1, 0), Some(b));
        assert_eq!(g.input(s2, 0), Some(b));
        assert!(g.verify().is_ok());
    }

    #[test]
    fn test_kill_detaches() {
        let mut g = Graph::new();
        let a = g.const_int(1, ValueType::INT);
        let s = add(&mut g, a, a);
        g.kill(s);
        assert!(g.node(s).is_dead());
        assert_eq!(g.use_count(a), 0);
        assert_eq!(g.live_nodes().count(), 2);
        assert!(g.verify().is_ok());
    }

    #[test]
    fn test_snapshot_equality() {
        let mut g = Graph::new();
        let a = g.const_int(1, ValueType::INT);
        let snapshot = g.clone();
        assert!(g.structurally_equal(&snapshot));
        add(&mut g, a, a);
        assert!(!g.structurally_equal(&snapshot));
    }
}
