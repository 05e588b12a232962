use smallvec::SmallVec;

use crate::foundation::core::{Affine, DrawState, Rect};
use crate::foundation::error::{ZoetropeError, ZoetropeResult};
use crate::scene::node::{Node, NodeId, NodeKind};
use crate::scene::source::{SheetId, SourceId, SourceStore, SpriteSheet};
use crate::tween::props::{TargetId, TweenHost, TweenTarget};

impl From<NodeId> for TargetId {
    fn from(id: NodeId) -> Self {
        TargetId(u64::from(id.0))
    }
}

/// Slab-allocated display list. Slot 0 is the root container and always
/// present; freed slots are recycled.
#[derive(Debug)]
pub struct Scene {
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
    root: NodeId,
    sheets: Vec<SpriteSheet>,
    sources: SourceStore,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(Node::new(NodeKind::Container))],
            free: Vec::new(),
            root: NodeId(0),
            sheets: Vec::new(),
            sources: SourceStore::new(),
        }
    }

    pub fn sources(&self) -> &SourceStore {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut SourceStore {
        &mut self.sources
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(|slot| slot.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(|slot| slot.as_mut())
    }

    /// Live node count, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn new_container(&mut self) -> NodeId {
        self.insert(Node::new(NodeKind::Container))
    }

    pub fn new_bitmap(&mut self, source: SourceId) -> NodeId {
        self.insert(Node::new(NodeKind::Bitmap {
            source,
            source_rect: None,
        }))
    }

    pub fn new_bitmap_rect(&mut self, source: SourceId, source_rect: Rect) -> NodeId {
        self.insert(Node::new(NodeKind::Bitmap {
            source,
            source_rect: Some(source_rect),
        }))
    }

    pub fn new_sprite(&mut self, sheet: SheetId, frame: usize) -> NodeId {
        self.insert(Node::new(NodeKind::Sprite {
            sheet,
            frame: frame as f64,
        }))
    }

    pub fn new_drawn(&mut self, surface: SourceId) -> NodeId {
        self.insert(Node::new(NodeKind::Drawn { surface }))
    }

    fn insert(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                let id = NodeId(self.nodes.len() as u32);
                self.nodes.push(Some(node));
                id
            }
        }
    }

    /// Append `child` to `parent`'s display list. A child already attached
    /// elsewhere is reparented; attaching a node under its own descendant is
    /// rejected.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> ZoetropeResult<()> {
        let index = self
            .node(parent)
            .map(|p| p.children.len())
            .unwrap_or_default();
        self.add_child_at(parent, child, index)
    }

    pub fn add_child_at(
        &mut self,
        parent: NodeId,
        child: NodeId,
        index: usize,
    ) -> ZoetropeResult<()> {
        if self.node(child).is_none() || self.node(parent).is_none() {
            return Err(ZoetropeError::validation("unknown node id"));
        }
        if child == self.root {
            return Err(ZoetropeError::validation("the root cannot be reparented"));
        }
        if child == parent || self.is_ancestor(child, parent) {
            return Err(ZoetropeError::validation(
                "a node cannot contain its own ancestor",
            ));
        }

        // Reparenting from the same parent shifts later siblings down one.
        let mut index = index;
        if let Some(old) = self.node(child).and_then(|n| n.parent) {
            if old == parent
                && let Some(pos) = self.child_position(old, child)
                && pos < index
            {
                index -= 1;
            }
            self.detach(old, child);
        }

        let p = self
            .node_mut(parent)
            .ok_or_else(|| ZoetropeError::validation("unknown node id"))?;
        let index = index.min(p.children.len());
        p.children.insert(index, child);
        if let Some(c) = self.node_mut(child) {
            c.parent = Some(parent);
        }
        Ok(())
    }

    /// Detach `child` from `parent`. The node stays allocated and can be
    /// re-attached. Returns whether anything was removed.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        let attached = self.node(child).and_then(|n| n.parent) == Some(parent);
        if !attached {
            return false;
        }
        self.detach(parent, child);
        true
    }

    pub fn remove_from_parent(&mut self, child: NodeId) -> bool {
        match self.node(child).and_then(|n| n.parent) {
            Some(parent) => self.remove_child(parent, child),
            None => false,
        }
    }

    /// Free a node and its whole subtree. The root is not removable.
    pub fn remove_subtree(&mut self, id: NodeId) -> ZoetropeResult<()> {
        if id == self.root {
            return Err(ZoetropeError::validation("the root cannot be removed"));
        }
        if self.node(id).is_none() {
            return Err(ZoetropeError::validation("unknown node id"));
        }
        self.remove_from_parent(id);

        let mut stack: SmallVec<[NodeId; 16]> = SmallVec::new();
        stack.push(id);
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.nodes[cur.index()].take() {
                stack.extend(node.children.iter().copied());
                self.free.push(cur.0);
            }
        }
        Ok(())
    }

    pub fn add_sheet(&mut self, sheet: SpriteSheet) -> SheetId {
        let id = SheetId(self.sheets.len() as u32);
        self.sheets.push(sheet);
        id
    }

    pub fn sheet(&self, id: SheetId) -> Option<&SpriteSheet> {
        self.sheets.get(id.index())
    }

    /// Transform and alpha of `id` concatenated from the root down.
    pub fn concatenated_state(&self, id: NodeId) -> Option<DrawState> {
        let mut chain: SmallVec<[NodeId; 8]> = SmallVec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            chain.push(c);
            cur = self.node(c)?.parent;
        }
        let mut state = DrawState::identity();
        for nid in chain.iter().rev() {
            let n = self.node(*nid)?;
            state = state.child(n.local_matrix(), n.alpha);
        }
        Some(state)
    }

    pub fn concatenated_matrix(&self, id: NodeId) -> Option<Affine> {
        self.concatenated_state(id).map(|s| s.matrix)
    }

    fn is_ancestor(&self, candidate: NodeId, of: NodeId) -> bool {
        let mut cur = self.node(of).and_then(|n| n.parent);
        while let Some(c) = cur {
            if c == candidate {
                return true;
            }
            cur = self.node(c).and_then(|n| n.parent);
        }
        false
    }

    fn child_position(&self, parent: NodeId, child: NodeId) -> Option<usize> {
        self.node(parent)?.children.iter().position(|c| *c == child)
    }

    fn detach(&mut self, parent: NodeId, child: NodeId) {
        if let Some(p) = self.node_mut(parent) {
            p.children.retain(|c| *c != child);
        }
        if let Some(c) = self.node_mut(child) {
            c.parent = None;
        }
    }
}

impl TweenHost for Scene {
    fn target_mut(&mut self, id: TargetId) -> Option<&mut dyn TweenTarget> {
        let idx = usize::try_from(id.0).ok()?;
        match self.nodes.get_mut(idx) {
            Some(Some(node)) => Some(node as &mut dyn TweenTarget),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tween::props::PropValue;

    #[test]
    fn add_child_reparents_and_keeps_order() {
        let mut scene = Scene::new();
        let a = scene.new_container();
        let b = scene.new_container();
        let leaf = scene.new_container();

        scene.add_child(scene.root(), a).unwrap();
        scene.add_child(scene.root(), b).unwrap();
        scene.add_child(a, leaf).unwrap();
        assert_eq!(scene.node(leaf).unwrap().parent(), Some(a));

        scene.add_child(b, leaf).unwrap();
        assert_eq!(scene.node(leaf).unwrap().parent(), Some(b));
        assert!(scene.node(a).unwrap().children().is_empty());
        assert_eq!(scene.node(b).unwrap().children(), &[leaf]);
    }

    #[test]
    fn add_child_at_same_parent_accounts_for_shift() {
        let mut scene = Scene::new();
        let a = scene.new_container();
        let b = scene.new_container();
        let c = scene.new_container();
        for id in [a, b, c] {
            scene.add_child(scene.root(), id).unwrap();
        }

        // Move the first child to the end.
        scene.add_child_at(scene.root(), a, 3).unwrap();
        assert_eq!(scene.node(scene.root()).unwrap().children(), &[b, c, a]);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut scene = Scene::new();
        let a = scene.new_container();
        let b = scene.new_container();
        scene.add_child(scene.root(), a).unwrap();
        scene.add_child(a, b).unwrap();

        assert!(scene.add_child(b, a).is_err());
        assert!(scene.add_child(a, a).is_err());
        assert!(scene.add_child(b, scene.root()).is_err());
    }

    #[test]
    fn remove_subtree_frees_slots_for_reuse() {
        let mut scene = Scene::new();
        let a = scene.new_container();
        let b = scene.new_container();
        scene.add_child(scene.root(), a).unwrap();
        scene.add_child(a, b).unwrap();
        assert_eq!(scene.node_count(), 3);

        scene.remove_subtree(a).unwrap();
        assert_eq!(scene.node_count(), 1);
        assert!(scene.node(a).is_none());
        assert!(scene.node(b).is_none());

        let again = scene.new_container();
        assert!(again.index() <= 2, "freed slots should be recycled");
        assert!(scene.remove_subtree(scene.root()).is_err());
    }

    #[test]
    fn concatenated_state_multiplies_down_the_chain() {
        let mut scene = Scene::new();
        let a = scene.new_container();
        let b = scene.new_container();
        scene.add_child(scene.root(), a).unwrap();
        scene.add_child(a, b).unwrap();

        scene.node_mut(a).unwrap().transform.x = 10.0;
        scene.node_mut(b).unwrap().transform.x = 5.0;
        scene.node_mut(a).unwrap().alpha = 0.5;
        scene.node_mut(b).unwrap().alpha = 0.5;

        let state = scene.concatenated_state(b).unwrap();
        let p = state.matrix * crate::foundation::core::Point::new(0.0, 0.0);
        assert!((p.x - 15.0).abs() < 1e-9);
        assert!((state.alpha - 0.25).abs() < 1e-12);
    }

    #[test]
    fn scene_resolves_tween_targets() {
        let mut scene = Scene::new();
        let a = scene.new_container();
        scene.add_child(scene.root(), a).unwrap();

        let target_id = TargetId::from(a);
        let target = scene.target_mut(target_id).unwrap();
        target.set_prop("x", &PropValue::Number(42.0));
        assert_eq!(scene.node(a).unwrap().transform.x, 42.0);

        assert!(scene.target_mut(TargetId(999)).is_none());
    }
}
