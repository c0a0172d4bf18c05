//! QuadTree implementation.

use std::collections::HashMap;

use crate::bounding_box::BoundingBox;
use crate::cache_types::{CacheError, CacheResult};

use super::qt_types::{IndexEntry, NodeId, QuadNode};

/// Name of the root node; children append their quadrant digit.
const ROOT_NAME: &str = "r";

/// Quad-tree over tile coordinates.
///
/// Nodes live in an arena and refer to each other by [`NodeId`]. The tree
/// only ever grows: a node that is split becomes internal and keeps its
/// slot, so ids handed out stay valid until the tree is dropped.
pub struct QuadTree {
    nodes: Vec<QuadNode>,
    max_items: usize,
    /// Node boundaries changed since the structure was last persisted
    structure_dirty: bool,
    /// Names of nodes that became internal; their entry files are obsolete
    retired: Vec<String>,
}

impl QuadTree {
    /// Creates an empty tree whose root covers the whole coordinate space.
    pub fn new(max_items: usize) -> Self {
        let root = QuadNode::new(BoundingBox::world(), ROOT_NAME.to_string(), true);
        Self {
            nodes: vec![root],
            max_items: max_items.max(1),
            structure_dirty: true,
            retired: Vec::new(),
        }
    }

    /// Rebuilds the node structure from persisted boundaries. No entries
    /// are loaded; every leaf starts unloaded.
    pub fn from_boundaries(
        boundaries: Vec<(BoundingBox, String)>,
        max_items: usize,
    ) -> CacheResult<Self> {
        let mut sorted = boundaries;
        sorted.sort_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| a.1.cmp(&b.1)));

        let mut iter = sorted.into_iter();
        let (root_bbox, root_name) = iter
            .next()
            .ok_or_else(|| CacheError::corrupt("quad-tree structure has no nodes"))?;
        if root_name != ROOT_NAME || root_bbox != BoundingBox::world() {
            return Err(CacheError::corrupt(format!(
                "invalid quad-tree root {} {}",
                root_name, root_bbox
            )));
        }

        let mut nodes = vec![QuadNode::new(root_bbox, root_name.clone(), false)];
        let mut by_name: HashMap<String, NodeId> = HashMap::new();
        by_name.insert(root_name, 0);

        for (bbox, name) in iter {
            if name.len() < 2 || !name.is_char_boundary(name.len() - 1) {
                return Err(CacheError::corrupt(format!("invalid node name {:?}", name)));
            }
            let (parent_name, digit) = name.split_at(name.len() - 1);
            let quadrant = match digit {
                "0" => 0,
                "1" => 1,
                "2" => 2,
                "3" => 3,
                _ => {
                    return Err(CacheError::corrupt(format!("invalid node name {}", name)));
                }
            };
            let parent = *by_name
                .get(parent_name)
                .ok_or_else(|| CacheError::corrupt(format!("orphan node {}", name)))?;
            if nodes[parent].bbox.quadrant(quadrant) != bbox {
                return Err(CacheError::corrupt(format!(
                    "node {} has boundary {} outside its parent quadrant",
                    name, bbox
                )));
            }
            if by_name.contains_key(&name) {
                return Err(CacheError::corrupt(format!("duplicate node {}", name)));
            }

            let id = nodes.len();
            nodes.push(QuadNode::new(bbox, name.clone(), false));
            by_name.insert(name, id);

            let parent_node = &mut nodes[parent];
            let children = parent_node.children.get_or_insert([usize::MAX; 4]);
            children[quadrant] = id;
            // internal nodes carry no entry file
            parent_node.loaded = true;
        }

        for node in &nodes {
            if let Some(children) = node.children {
                if children.contains(&usize::MAX) {
                    return Err(CacheError::corrupt(format!(
                        "node {} is missing children",
                        node.name
                    )));
                }
            }
        }

        Ok(Self {
            nodes,
            max_items: max_items.max(1),
            structure_dirty: false,
            retired: Vec::new(),
        })
    }

    /// Node boundaries and names, parents before children.
    pub fn boundaries(&self) -> Vec<(BoundingBox, String)> {
        self.nodes
            .iter()
            .map(|n| (n.bbox, n.name.clone()))
            .collect()
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node(&self, id: NodeId) -> &QuadNode {
        &self.nodes[id]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The unique leaf whose box contains the coordinate.
    pub fn get_node(&self, lat: i32, lon: i32) -> NodeId {
        let mut id = self.root();
        while let Some(children) = self.nodes[id].children {
            id = children[self.nodes[id].bbox.quadrant_of(lat, lon)];
        }
        id
    }

    /// All leaves, loaded or not.
    pub fn all_nodes(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter(|&id| self.nodes[id].is_leaf())
            .collect()
    }

    /// Leaves whose entries are currently in memory.
    pub fn all_loaded_nodes(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter(|&id| self.nodes[id].is_leaf() && self.nodes[id].loaded)
            .collect()
    }

    /// Loaded leaves with unsaved changes.
    pub fn dirty_nodes(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter(|&id| {
                let n = &self.nodes[id];
                n.is_leaf() && n.loaded && n.dirty
            })
            .collect()
    }

    pub fn loaded_entry_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf() && n.loaded)
            .map(|n| n.entries.len())
            .sum()
    }

    fn loaded_leaf(&self, lat: i32, lon: i32) -> CacheResult<NodeId> {
        let id = self.get_node(lat, lon);
        if !self.nodes[id].loaded {
            return Err(CacheError::InvalidOperation(format!(
                "quad-tree node {} is not loaded",
                self.nodes[id].name
            )));
        }
        Ok(id)
    }

    /// Appends an entry to its leaf and splits the leaf when it overflows.
    ///
    /// Returns whether a split occurred; the node structure must then be
    /// persisted again.
    pub fn add_entry(&mut self, entry: IndexEntry) -> CacheResult<bool> {
        let id = self.loaded_leaf(entry.lat, entry.lon)?;
        let node = &mut self.nodes[id];
        node.entries.push(entry);
        node.dirty = true;

        if node.entries.len() > self.max_items && node.bbox.can_split() {
            self.split(id);
            return Ok(true);
        }
        Ok(false)
    }

    fn split(&mut self, id: NodeId) {
        let bbox = self.nodes[id].bbox;
        let name = self.nodes[id].name.clone();
        let entries = std::mem::take(&mut self.nodes[id].entries);

        let base = self.nodes.len();
        for quadrant in 0..4 {
            let mut child = QuadNode::new(
                bbox.quadrant(quadrant),
                format!("{}{}", name, quadrant),
                true,
            );
            child.dirty = true;
            self.nodes.push(child);
        }
        let children = [base, base + 1, base + 2, base + 3];
        for entry in entries {
            let quadrant = bbox.quadrant_of(entry.lat, entry.lon);
            self.nodes[children[quadrant]].entries.push(entry);
        }

        let node = &mut self.nodes[id];
        node.children = Some(children);
        node.dirty = false;
        node.loaded = true;
        log::debug!("Split quad-tree node {} ({})", name, bbox);
        self.retired.push(name);
        self.structure_dirty = true;

        for child in children {
            let node = &self.nodes[child];
            if node.entries.len() > self.max_items && node.bbox.can_split() {
                self.split(child);
            }
        }
    }

    /// Exact lookup inside the leaf containing the coordinate.
    pub fn get_entry(&self, lat: i32, lon: i32, tile_id: &str) -> CacheResult<Option<&IndexEntry>> {
        let id = self.loaded_leaf(lat, lon)?;
        Ok(self.nodes[id]
            .entries
            .iter()
            .find(|e| e.matches(lat, lon, tile_id)))
    }

    /// Mutable lookup; marks the leaf dirty when the entry exists.
    pub fn get_entry_mut(
        &mut self,
        lat: i32,
        lon: i32,
        tile_id: &str,
    ) -> CacheResult<Option<&mut IndexEntry>> {
        let id = self.loaded_leaf(lat, lon)?;
        let node = &mut self.nodes[id];
        let found = node.entries.iter_mut().find(|e| e.matches(lat, lon, tile_id));
        if found.is_some() {
            node.dirty = true;
        }
        Ok(found)
    }

    pub fn remove_entry(
        &mut self,
        lat: i32,
        lon: i32,
        tile_id: &str,
    ) -> CacheResult<Option<IndexEntry>> {
        let id = self.loaded_leaf(lat, lon)?;
        let node = &mut self.nodes[id];
        match node.entries.iter().position(|e| e.matches(lat, lon, tile_id)) {
            Some(pos) => {
                node.dirty = true;
                Ok(Some(node.entries.remove(pos)))
            }
            None => Ok(None),
        }
    }

    /// Installs entries read from disk into an unloaded leaf. Entries
    /// outside the leaf's box are dropped and the leaf marked dirty.
    pub fn load_node(&mut self, id: NodeId, entries: Vec<IndexEntry>) -> CacheResult<()> {
        let node = &mut self.nodes[id];
        if !node.is_leaf() {
            return Err(CacheError::InvalidOperation(format!(
                "cannot load entries into internal node {}",
                node.name
            )));
        }
        let total = entries.len();
        let bbox = node.bbox;
        node.entries = entries
            .into_iter()
            .filter(|e| bbox.contains(e.lat, e.lon))
            .collect();
        node.dirty = node.entries.len() != total;
        node.loaded = true;
        if node.dirty {
            log::warn!(
                "Dropped {} misplaced entries while loading node {}",
                total - node.entries.len(),
                node.name
            );
        }
        Ok(())
    }

    /// Releases a leaf's entries. The caller persists a dirty leaf first.
    pub fn unload_node(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        if node.is_leaf() {
            node.entries = Vec::new();
            node.loaded = false;
            node.dirty = false;
        }
    }

    pub fn mark_clean(&mut self, id: NodeId) {
        self.nodes[id].dirty = false;
    }

    /// Keeps the entries of a loaded leaf for which `keep` returns true;
    /// `keep` may also rewrite the entry. The leaf is marked dirty.
    pub fn retain_entries<F>(&mut self, id: NodeId, mut keep: F) -> usize
    where
        F: FnMut(&mut IndexEntry) -> bool,
    {
        let node = &mut self.nodes[id];
        let before = node.entries.len();
        node.entries.retain_mut(|e| keep(e));
        node.dirty = true;
        before - node.entries.len()
    }

    pub fn is_structure_dirty(&self) -> bool {
        self.structure_dirty
    }

    pub fn mark_structure_clean(&mut self) {
        self.structure_dirty = false;
    }

    /// Names of nodes split since the last call.
    pub fn take_retired(&mut self) -> Vec<String> {
        std::mem::take(&mut self.retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: usize, lat: i32, lon: i32) -> IndexEntry {
        IndexEntry::new(0, id as u32, format!("T{}", id), lat, lon)
    }

    #[test]
    fn test_empty_tree() {
        let tree = QuadTree::new(4);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.get_node(123, -456), tree.root());
        assert!(tree.is_structure_dirty());
        assert_eq!(tree.all_nodes(), vec![0]);
        assert_eq!(tree.all_loaded_nodes(), vec![0]);
    }

    #[test]
    fn test_add_and_get() {
        let mut tree = QuadTree::new(4);
        assert!(!tree.add_entry(entry(1, 10, 20)).unwrap());
        let found = tree.get_entry(10, 20, "T1").unwrap().unwrap();
        assert_eq!(found.offset, 1);
        assert!(tree.get_entry(10, 21, "T1").unwrap().is_none());
        assert!(tree.get_entry(10, 20, "T2").unwrap().is_none());
    }

    #[test]
    fn test_split_keeps_every_entry() {
        let max = 500;
        let mut tree = QuadTree::new(max);
        let mut split = false;
        for i in 0..=max {
            let lat = (i as i32) * 1_000_003 - 250_000_000;
            let lon = -(i as i32) * 7_919 + 1_000;
            split |= tree.add_entry(entry(i, lat, lon)).unwrap();
        }
        assert!(split);
        assert!(tree.node(tree.root()).children().is_some());
        assert!(tree.all_nodes().len() >= 2);

        for i in 0..=max {
            let lat = (i as i32) * 1_000_003 - 250_000_000;
            let lon = -(i as i32) * 7_919 + 1_000;
            let found = tree.get_entry(lat, lon, &format!("T{}", i)).unwrap();
            assert_eq!(found.map(|e| e.offset), Some(i as u32));
        }

        let retired = tree.take_retired();
        assert!(retired.contains(&"r".to_string()));
        assert!(tree.take_retired().is_empty());
        assert_eq!(tree.loaded_entry_count(), max + 1);
    }

    #[test]
    fn test_split_recurses_when_quadrant_overflows() {
        let mut tree = QuadTree::new(2);
        // all in the same upper-right quadrant of the world
        tree.add_entry(entry(1, 100, 100)).unwrap();
        tree.add_entry(entry(2, 200, 200)).unwrap();
        assert!(tree.add_entry(entry(3, 1_000_000, 1_000_000)).unwrap());
        for leaf in tree.all_nodes() {
            assert!(tree.node(leaf).size() <= 2);
        }
        assert!(tree.get_entry(200, 200, "T2").unwrap().is_some());
    }

    #[test]
    fn test_identical_coordinates_do_not_split_forever() {
        let mut tree = QuadTree::new(2);
        for i in 0..10 {
            tree.add_entry(entry(i, 5, 5)).unwrap();
        }
        let leaf = tree.get_node(5, 5);
        assert_eq!(tree.node(leaf).size(), 10);
        assert!(!tree.node(leaf).bbox.can_split());
    }

    #[test]
    fn test_remove_entry() {
        let mut tree = QuadTree::new(4);
        tree.add_entry(entry(1, 1, 1)).unwrap();
        tree.add_entry(entry(2, 2, 2)).unwrap();
        tree.mark_clean(0);
        let removed = tree.remove_entry(1, 1, "T1").unwrap();
        assert_eq!(removed.map(|e| e.offset), Some(1));
        assert!(tree.node(0).is_dirty());
        assert!(tree.remove_entry(1, 1, "T1").unwrap().is_none());
        assert_eq!(tree.node(0).size(), 1);
    }

    #[test]
    fn test_unloaded_node_cannot_be_queried() {
        let mut tree = QuadTree::new(4);
        tree.add_entry(entry(1, 1, 1)).unwrap();
        tree.unload_node(0);
        assert!(tree.get_entry(1, 1, "T1").is_err());
        assert!(tree.add_entry(entry(2, 2, 2)).is_err());

        tree.load_node(0, vec![entry(1, 1, 1)]).unwrap();
        assert!(!tree.node(0).is_dirty());
        assert!(tree.get_entry(1, 1, "T1").unwrap().is_some());
    }

    #[test]
    fn test_get_entry_mut_marks_dirty() {
        let mut tree = QuadTree::new(4);
        tree.add_entry(entry(1, 1, 1)).unwrap();
        tree.mark_clean(0);
        tree.get_entry_mut(1, 1, "T1").unwrap().unwrap().offset = 99;
        assert!(tree.node(0).is_dirty());
        assert_eq!(tree.get_entry(1, 1, "T1").unwrap().unwrap().offset, 99);
    }

    #[test]
    fn test_boundaries_roundtrip() {
        let mut tree = QuadTree::new(1);
        tree.add_entry(entry(1, -10, -10)).unwrap();
        tree.add_entry(entry(2, 10, 10)).unwrap();
        tree.add_entry(entry(3, 10_000, -10_000)).unwrap();

        let rebuilt = QuadTree::from_boundaries(tree.boundaries(), 1).unwrap();
        assert_eq!(rebuilt.node_count(), tree.node_count());
        assert!(!rebuilt.is_structure_dirty());
        for (lat, lon) in [(-10, -10), (10, 10), (10_000, -10_000)] {
            let a = tree.node(tree.get_node(lat, lon));
            let b = rebuilt.node(rebuilt.get_node(lat, lon));
            assert_eq!(a.name, b.name);
            assert_eq!(a.bbox, b.bbox);
            assert!(!b.is_loaded());
        }
    }

    #[test]
    fn test_from_boundaries_rejects_garbage() {
        assert!(QuadTree::from_boundaries(vec![], 4).is_err());
        let bad_root = vec![(BoundingBox::new(0, 0, 1, 1), "r".to_string())];
        assert!(QuadTree::from_boundaries(bad_root, 4).is_err());

        let world = BoundingBox::world();
        let orphan = vec![
            (world, "r".to_string()),
            (world.quadrant(0).quadrant(1), "r01".to_string()),
        ];
        assert!(QuadTree::from_boundaries(orphan, 4).is_err());

        let incomplete = vec![(world, "r".to_string()), (world.quadrant(0), "r0".to_string())];
        assert!(QuadTree::from_boundaries(incomplete, 4).is_err());

        let wrong_box = vec![
            (world, "r".to_string()),
            (world.quadrant(1), "r0".to_string()),
            (world.quadrant(1), "r1".to_string()),
            (world.quadrant(2), "r2".to_string()),
            (world.quadrant(3), "r3".to_string()),
        ];
        assert!(QuadTree::from_boundaries(wrong_box, 4).is_err());
    }

    #[test]
    fn test_load_node_drops_misplaced_entries() {
        let mut tree = QuadTree::new(1);
        tree.add_entry(entry(1, -10, -10)).unwrap();
        tree.add_entry(entry(2, 10, 10)).unwrap();
        let leaf = tree.get_node(10, 10);
        tree.unload_node(leaf);
        tree.load_node(leaf, vec![entry(2, 10, 10), entry(1, -10, -10)]).unwrap();
        assert_eq!(tree.node(leaf).size(), 1);
        assert!(tree.node(leaf).is_dirty());
    }

    #[test]
    fn test_retain_entries() {
        let mut tree = QuadTree::new(10);
        for i in 0..6 {
            tree.add_entry(entry(i, i as i32, i as i32)).unwrap();
        }
        let removed = tree.retain_entries(0, |e| {
            e.page = 7;
            e.offset % 2 == 0
        });
        assert_eq!(removed, 3);
        assert!(tree.node(0).entries().iter().all(|e| e.page == 7));
    }

    #[test]
    fn test_random_entries_land_in_their_leaf() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let mut tree = QuadTree::new(8);
        let mut points = Vec::new();
        for i in 0..2_000 {
            let lat = rng.gen_range(-1_000_000..1_000_000);
            let lon = rng.gen_range(-1_000_000..1_000_000);
            tree.add_entry(entry(i, lat, lon)).unwrap();
            points.push((lat, lon));
        }

        for leaf in tree.all_nodes() {
            let node = tree.node(leaf);
            assert!(node.size() <= 8 || !node.bbox.can_split());
            for e in node.entries() {
                assert!(node.bbox.contains(e.lat, e.lon));
            }
        }
        for (i, (lat, lon)) in points.into_iter().enumerate() {
            assert!(tree.get_entry(lat, lon, &format!("T{}", i)).unwrap().is_some());
        }
    }
}
