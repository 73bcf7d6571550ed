//! Natural loops found from DFS back edges.

use std::collections::BTreeSet;

use super::{BlockId, FlowGraph};

/// A natural loop: the blocks that reach `tail` without passing `head`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    pub head: BlockId,
    /// Source of the back edge
    pub tail: BlockId,
    pub blocks: BTreeSet<BlockId>,
}

impl Loop {
    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains(&id)
    }

    /// `other` lies wholly inside this loop.
    pub fn is_inner_loop(&self, other: &Loop) -> bool {
        other.blocks.is_subset(&self.blocks)
    }

    /// Number of other loops in `all` that enclose this one.
    pub fn depth(&self, all: &[Loop]) -> usize {
        all.iter()
            .filter(|l| *l != self && l.is_inner_loop(self))
            .count()
    }
}

impl FlowGraph {
    /// Find every natural loop. Dominators are computed first.
    pub fn build_loops(&mut self) -> &[Loop] {
        self.set_immediate_dominators();
        self.loops.clear();
        let Some(entry) = self.entry() else {
            return &self.loops;
        };

        // iterative DFS; an edge to a block still on the stack is a back edge
        let n = self.blocks.len();
        let mut state = vec![0u8; n];
        let mut back_edges = Vec::new();
        let mut stack: Vec<(usize, usize)> = vec![(entry.index(), 0)];
        state[entry.index()] = 1;
        while let Some((v, next)) = stack.last_mut() {
            let v = *v;
            match self.blocks[v].succs.get(*next) {
                Some(&s) => {
                    *next += 1;
                    match state[s.index()] {
                        0 => {
                            state[s.index()] = 1;
                            stack.push((s.index(), 0));
                        }
                        1 => back_edges.push((BlockId(v as u32), s)),
                        _ => {}
                    }
                }
                None => {
                    state[v] = 2;
                    stack.pop();
                }
            }
        }

        for (tail, head) in back_edges {
            if !self.dominates(head, tail) {
                log::debug!(
                    "Back edge {} -> {} in 0x{:x} is not dominated by its head",
                    tail,
                    head,
                    self.base
                );
                continue;
            }
            let mut blocks = BTreeSet::from([head, tail]);
            let mut work = vec![tail];
            while let Some(b) = work.pop() {
                if b == head {
                    continue;
                }
                for &p in &self.blocks[b.index()].preds {
                    if blocks.insert(p) {
                        work.push(p);
                    }
                }
            }
            self.loops.push(Loop { head, tail, blocks });
        }
        log::debug!("Found {} loops in 0x{:x}", self.loops.len(), self.base);
        &self.loops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::tests::graph_of;

    // 0: xor eax,eax
    // 2: inc eax
    // 4: cmp eax,10 ; 7: jne 2
    // 9: ret
    const COUNTER: [u8; 10] = [0x31, 0xc0, 0xff, 0xc0, 0x83, 0xf8, 0x0a, 0x75, 0xf9, 0xc3];

    #[test]
    fn test_single_loop() {
        let mut g = graph_of(&COUNTER, 0x100);
        let loops = g.build_loops().to_vec();
        assert_eq!(loops.len(), 1);
        let l = &loops[0];
        let body = g.block_containing(0x102).unwrap();
        assert_eq!(l.head, body);
        assert_eq!(l.tail, body);
        assert_eq!(l.blocks, BTreeSet::from([body]));
        assert_eq!(l.depth(&loops), 0);
    }

    #[test]
    fn test_nested_loops() {
        // 0: xor ecx,ecx
        // 2: xor eax,eax        outer head
        // 4: inc eax            inner head
        // 6: cmp eax,4 ; 9: jne 4
        // b: inc ecx ; d: cmp ecx,4 ; 10: jne 2
        // 12: ret
        let bytes = [
            0x31, 0xc9, 0x31, 0xc0, 0xff, 0xc0, 0x83, 0xf8, 0x04, 0x75, 0xf9, 0xff, 0xc1, 0x83,
            0xf9, 0x04, 0x75, 0xf0, 0xc3,
        ];
        let mut g = graph_of(&bytes, 0);
        let loops = g.build_loops().to_vec();
        assert_eq!(loops.len(), 2);
        let outer = loops.iter().find(|l| l.blocks.len() == 3).unwrap();
        let inner = loops.iter().find(|l| l.blocks.len() == 1).unwrap();
        assert!(outer.is_inner_loop(inner));
        assert!(!inner.is_inner_loop(outer));
        assert_eq!(inner.depth(&loops), 1);
        assert_eq!(outer.depth(&loops), 0);
        assert_eq!(outer.head, g.block_containing(0x2).unwrap());
    }

    #[test]
    fn test_loop_sources_are_members() {
        let mut g = graph_of(&COUNTER, 0);
        for l in g.build_loops() {
            assert!(l.contains(l.tail));
            assert!(l.contains(l.head));
        }
    }

    #[test]
    fn test_straight_line_has_no_loops() {
        let mut g = graph_of(&[0x90, 0x90, 0xc3], 0);
        assert!(g.build_loops().is_empty());
    }
}
