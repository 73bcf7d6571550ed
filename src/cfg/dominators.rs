//! Immediate dominators, Lengauer-Tarjan with simple eval/link.

use super::{BlockId, FlowGraph};

const NONE: usize = usize::MAX;

struct Tarjan {
    /// DFS number of each block, NONE when unvisited
    dfnum: Vec<usize>,
    /// Block at each DFS number
    vertex: Vec<usize>,
    parent: Vec<usize>,
    semi: Vec<usize>,
    ancestor: Vec<usize>,
    label: Vec<usize>,
}

impl Tarjan {
    fn new(n: usize) -> Self {
        Self {
            dfnum: vec![NONE; n],
            vertex: Vec::with_capacity(n),
            parent: vec![NONE; n],
            semi: vec![NONE; n],
            ancestor: vec![NONE; n],
            label: (0..n).collect(),
        }
    }

    fn number(&mut self, graph: &FlowGraph, entry: usize) {
        let mut stack = vec![(entry, NONE)];
        while let Some((v, from)) = stack.pop() {
            if self.dfnum[v] != NONE {
                continue;
            }
            self.dfnum[v] = self.vertex.len();
            self.semi[v] = self.dfnum[v];
            self.vertex.push(v);
            self.parent[v] = from;
            for s in graph.blocks[v].succs.iter().rev() {
                if self.dfnum[s.index()] == NONE {
                    stack.push((s.index(), v));
                }
            }
        }
    }

    fn compress(&mut self, v: usize) {
        // collect the path up to the forest root, then fold labels downward
        let mut path = Vec::new();
        let mut u = v;
        while self.ancestor[u] != NONE && self.ancestor[self.ancestor[u]] != NONE {
            path.push(u);
            u = self.ancestor[u];
        }
        for &w in path.iter().rev() {
            let a = self.ancestor[w];
            if self.semi[self.label[a]] < self.semi[self.label[w]] {
                self.label[w] = self.label[a];
            }
            self.ancestor[w] = self.ancestor[a];
        }
    }

    fn eval(&mut self, v: usize) -> usize {
        if self.ancestor[v] == NONE {
            return v;
        }
        self.compress(v);
        self.label[v]
    }
}

impl FlowGraph {
    /// Fill [`BasicBlock::idom`](super::BasicBlock::idom) for every block
    /// reachable from the entry.
    pub fn set_immediate_dominators(&mut self) {
        let n = self.blocks.len();
        for block in self.blocks.iter_mut() {
            block.idom = None;
        }
        let Some(entry) = self.entry() else {
            return;
        };

        let mut t = Tarjan::new(n);
        t.number(self, entry.index());
        let mut idom = vec![NONE; n];
        let mut bucket: Vec<Vec<usize>> = vec![Vec::new(); n];

        for i in (1..t.vertex.len()).rev() {
            let w = t.vertex[i];
            for p in &self.blocks[w].preds {
                let v = p.index();
                if t.dfnum[v] == NONE {
                    continue;
                }
                let u = t.eval(v);
                if t.semi[u] < t.semi[w] {
                    t.semi[w] = t.semi[u];
                }
            }
            bucket[t.vertex[t.semi[w]]].push(w);
            let parent = t.parent[w];
            t.ancestor[w] = parent;

            for v in std::mem::take(&mut bucket[parent]) {
                let u = t.eval(v);
                idom[v] = if t.semi[u] < t.semi[v] { u } else { parent };
            }
        }
        for i in 1..t.vertex.len() {
            let w = t.vertex[i];
            if idom[w] != t.vertex[t.semi[w]] {
                idom[w] = idom[idom[w]];
            }
        }

        for &w in t.vertex.iter().skip(1) {
            self.blocks[w].idom = Some(BlockId(idom[w] as u32));
        }
        log::debug!(
            "Dominator tree for 0x{:x}: {} of {} blocks reachable",
            self.base,
            t.vertex.len(),
            n
        );
    }

    /// `a` dominates `b`, using the tree built by
    /// [`FlowGraph::set_immediate_dominators`]. Every block dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut at = Some(b);
        while let Some(id) = at {
            if id == a {
                return true;
            }
            at = self.blocks[id.index()].idom;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::tests::graph_of;

    #[test]
    fn test_diamond_dominators() {
        // 0: test edi,edi ; je 9 ; mov eax,1 ; 9: ret
        let mut g = graph_of(&[0x85, 0xff, 0x74, 0x05, 0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3], 0);
        g.set_immediate_dominators();
        assert_eq!(g.block(BlockId(0)).idom, None);
        assert_eq!(g.block(BlockId(1)).idom, Some(BlockId(0)));
        assert_eq!(g.block(BlockId(2)).idom, Some(BlockId(0)));
        assert!(g.dominates(BlockId(0), BlockId(2)));
        assert!(!g.dominates(BlockId(1), BlockId(2)));
        assert!(g.dominates(BlockId(2), BlockId(2)));
    }

    #[test]
    fn test_dominance_tree_rooted_at_entry() {
        // 0: xor eax,eax
        // 2: inc eax
        // 4: cmp eax,10 ; jne 2
        // 9: test eax,eax ; je 0xf
        // d: nop ; nop
        // f: ret
        let bytes = [
            0x31, 0xc0, 0xff, 0xc0, 0x83, 0xf8, 0x0a, 0x75, 0xf9, 0x85, 0xc0, 0x74, 0x02, 0x90,
            0x90, 0xc3,
        ];
        let mut g = graph_of(&bytes, 0x400);
        g.set_immediate_dominators();
        let entry = g.entry().unwrap();
        for block in g.blocks() {
            if block.index != entry {
                assert!(block.idom.is_some(), "{} has no idom", block.index);
                assert!(g.dominates(entry, block.index));
            }
        }
        let ret = g.block_containing(0x40f).unwrap();
        let test = g.block_containing(0x409).unwrap();
        assert_eq!(g.block(ret).idom, Some(test));
    }

    #[test]
    fn test_unreachable_blocks_have_no_idom() {
        let mut g = graph_of(&[0xc3, 0x90, 0xc3], 0);
        g.set_immediate_dominators();
        assert_eq!(g.block(BlockId(1)).idom, None);
        assert!(!g.dominates(BlockId(0), BlockId(1)));
    }
}
