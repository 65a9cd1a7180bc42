//! Static checks over a classified tree, run before anything is spawned.
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::error::{BraidError, ReferenceFailure, Result};
use crate::node::{Group, Node};

/// Checks every reference in `node` against the groups enclosing it.
///
/// A reference must name a branch of some enclosing group, must not name the
/// branch it sits in, and the "waits on" relation between the branches of a
/// group must be acyclic. Any of these would otherwise only surface as a
/// timeout once the braid is running.
pub fn validate(node: &Node) -> Result<()> {
    Validator { frames: Vec::new() }.visit(node)
}

struct Frame<'a> {
    group: &'a Group,
    /// Branch currently being visited.
    own: &'a str,
    waits: Vec<(&'a str, &'a str)>,
}

struct Validator<'a> {
    frames: Vec<Frame<'a>>,
}

impl<'a> Validator<'a> {
    fn visit(&mut self, node: &'a Node) -> Result<()> {
        match node {
            Node::Leaf(_) => Ok(()),
            Node::Reference(keys) => keys.iter().try_for_each(|key| self.wait_on(key)),
            Node::Chain(steps) => steps.iter().try_for_each(|step| self.visit(step)),
            Node::ParallelGroup(group) => self.visit_group(group),
        }
    }

    fn visit_group(&mut self, group: &'a Group) -> Result<()> {
        self.frames.push(Frame {
            group,
            own: "",
            waits: Vec::new(),
        });

        let depth = self.frames.len() - 1;
        for (key, child) in &group.entries {
            self.frames[depth].own = key.as_str();
            self.visit(child).map_err(|err| err.in_branch(key))?;
        }

        let Some(frame) = self.frames.pop() else {
            return Ok(());
        };

        let mut graph = DiGraphMap::<&str, ()>::new();
        for (key, _) in &group.entries {
            graph.add_node(key.as_str());
        }
        for (from, to) in frame.waits {
            graph.add_edge(from, to, ());
        }

        toposort(&graph, None)
            .map(|_| ())
            .map_err(|cycle| BraidError::UnresolvedReference {
                key: cycle.node_id().to_string(),
                reason: ReferenceFailure::Cycle,
            })
    }

    fn wait_on(&mut self, key: &'a str) -> Result<()> {
        let unresolved = |reason| BraidError::UnresolvedReference {
            key: key.to_string(),
            reason,
        };

        for frame in self.frames.iter_mut().rev() {
            if frame.group.entries.iter().any(|(k, _)| k == key) {
                if frame.own == key {
                    return Err(unresolved(ReferenceFailure::SelfReference));
                }
                frame.waits.push((frame.own, key));
                return Ok(());
            }
        }

        Err(unresolved(ReferenceFailure::Undeclared))
    }
}
