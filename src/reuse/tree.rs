//! Weighted order-statistics splay tree held in an arena.
//!
//! Every node carries a key, a payload and a weight; each node also caches
//! the total weight of its subtree so the weight of all keys above a given
//! node is available once it has been splayed to the root.

const NIL: usize = usize::MAX;

#[derive(Debug, Clone)]
struct Node<V> {
    key: u64,
    value: V,
    weight: u64,
    total: u64,
    left: usize,
    right: usize,
    parent: usize,
}

#[derive(Debug, Clone)]
pub struct SplayTree<V> {
    nodes: Vec<Node<V>>,
    free: Vec<usize>,
    root: usize,
    len: usize,
}

impl<V: Copy> Default for SplayTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Copy> SplayTree<V> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: NIL,
            len: 0,
        }
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sum of all weights.
    pub fn total_weight(&self) -> u64 {
        self.total(self.root)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = NIL;
        self.len = 0;
    }

    fn total(&self, n: usize) -> u64 {
        if n == NIL {
            0
        } else {
            self.nodes[n].total
        }
    }

    fn update(&mut self, n: usize) {
        let (l, r) = (self.nodes[n].left, self.nodes[n].right);
        self.nodes[n].total = self.nodes[n].weight + self.total(l) + self.total(r);
    }

    fn set_child(&mut self, parent: usize, child: usize, left: bool) {
        if parent != NIL {
            if left {
                self.nodes[parent].left = child;
            } else {
                self.nodes[parent].right = child;
            }
        }
        if child != NIL {
            self.nodes[child].parent = parent;
        }
    }

    fn is_left(&self, n: usize) -> bool {
        let p = self.nodes[n].parent;
        p != NIL && self.nodes[p].left == n
    }

    fn rotate(&mut self, x: usize) {
        let p = self.nodes[x].parent;
        let g = self.nodes[p].parent;
        let x_left = self.is_left(x);
        let p_left = self.is_left(p);

        if x_left {
            let b = self.nodes[x].right;
            self.set_child(p, b, true);
            self.set_child(x, p, false);
        } else {
            let b = self.nodes[x].left;
            self.set_child(p, b, false);
            self.set_child(x, p, true);
        }
        self.nodes[x].parent = g;
        if g != NIL {
            self.set_child(g, x, p_left);
        }
        self.update(p);
        self.update(x);
    }

    /// Bring `x` to the top of the tree it currently belongs to.
    fn splay(&mut self, x: usize) {
        while self.nodes[x].parent != NIL {
            let p = self.nodes[x].parent;
            let g = self.nodes[p].parent;
            if g != NIL {
                if self.is_left(x) == self.is_left(p) {
                    self.rotate(p);
                } else {
                    self.rotate(x);
                }
            }
            self.rotate(x);
        }
    }

    fn alloc(&mut self, key: u64, value: V, weight: u64) -> usize {
        let node = Node {
            key,
            value,
            weight,
            total: weight,
            left: NIL,
            right: NIL,
            parent: NIL,
        };
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Find `key`, splaying it (or the last node visited) to the root.
    fn find(&mut self, key: u64) -> Option<usize> {
        let mut cur = self.root;
        let mut last = NIL;
        while cur != NIL {
            last = cur;
            let k = self.nodes[cur].key;
            if key == k {
                self.splay(cur);
                self.root = cur;
                return Some(cur);
            }
            cur = if key < k {
                self.nodes[cur].left
            } else {
                self.nodes[cur].right
            };
        }
        if last != NIL {
            self.splay(last);
            self.root = last;
        }
        None
    }

    /// Add `weight` under `key`, creating the key if needed.
    pub fn insert(&mut self, key: u64, value: V, weight: u64) {
        if self.find(key).is_some() {
            let r = self.root;
            self.nodes[r].weight += weight;
            self.nodes[r].value = value;
            self.update(r);
            return;
        }
        let n = self.alloc(key, value, weight);
        self.len += 1;
        let r = self.root;
        if r == NIL {
            self.root = n;
            return;
        }
        // the root is the closest key after the failed find
        if key < self.nodes[r].key {
            let l = self.nodes[r].left;
            self.nodes[r].left = NIL;
            self.update(r);
            self.set_child(n, l, true);
            self.set_child(n, r, false);
        } else {
            let rr = self.nodes[r].right;
            self.nodes[r].right = NIL;
            self.update(r);
            self.set_child(n, rr, false);
            self.set_child(n, r, true);
        }
        self.nodes[n].parent = NIL;
        self.update(n);
        self.root = n;
    }

    /// Remove `key`, returning its weight and payload.
    pub fn remove(&mut self, key: u64) -> Option<(u64, V)> {
        let n = self.find(key)?;
        let (l, r) = (self.nodes[n].left, self.nodes[n].right);
        if l != NIL {
            self.nodes[l].parent = NIL;
        }
        if r != NIL {
            self.nodes[r].parent = NIL;
        }
        self.root = if l == NIL {
            r
        } else {
            let mut m = l;
            while self.nodes[m].right != NIL {
                m = self.nodes[m].right;
            }
            self.splay(m);
            self.set_child(m, r, false);
            self.update(m);
            m
        };
        self.free.push(n);
        self.len -= 1;
        Some((self.nodes[n].weight, self.nodes[n].value))
    }

    /// Weight stored under `key`.
    pub fn weight(&mut self, key: u64) -> Option<u64> {
        self.find(key).map(|n| self.nodes[n].weight)
    }

    /// Change the weight stored under `key` by `delta`, saturating at zero.
    pub fn adjust(&mut self, key: u64, delta: i64) -> Option<u64> {
        let n = self.find(key)?;
        let w = &mut self.nodes[n].weight;
        *w = w.saturating_add_signed(delta);
        let w = *w;
        self.update(n);
        Some(w)
    }

    /// Total weight of the keys strictly greater than `key`.
    pub fn weight_above(&mut self, key: u64) -> u64 {
        match self.find(key) {
            Some(n) => self.total(self.nodes[n].right),
            None => {
                let mut acc = 0;
                let mut cur = self.root;
                while cur != NIL {
                    if self.nodes[cur].key > key {
                        acc += self.nodes[cur].weight + self.total(self.nodes[cur].right);
                        cur = self.nodes[cur].left;
                    } else {
                        cur = self.nodes[cur].right;
                    }
                }
                acc
            }
        }
    }

    /// Smallest key not below `key`.
    pub fn ceiling(&self, key: u64) -> Option<u64> {
        let mut best = None;
        let mut cur = self.root;
        while cur != NIL {
            let k = self.nodes[cur].key;
            if k == key {
                return Some(k);
            }
            if k > key {
                best = Some(k);
                cur = self.nodes[cur].left;
            } else {
                cur = self.nodes[cur].right;
            }
        }
        best
    }

    /// Largest key strictly below `key`.
    pub fn predecessor(&self, key: u64) -> Option<u64> {
        let mut best = None;
        let mut cur = self.root;
        while cur != NIL {
            let k = self.nodes[cur].key;
            if k < key {
                best = Some(k);
                cur = self.nodes[cur].right;
            } else {
                cur = self.nodes[cur].left;
            }
        }
        best
    }

    /// Smallest key strictly above `key`.
    pub fn successor(&self, key: u64) -> Option<u64> {
        let mut best = None;
        let mut cur = self.root;
        while cur != NIL {
            let k = self.nodes[cur].key;
            if k > key {
                best = Some(k);
                cur = self.nodes[cur].left;
            } else {
                cur = self.nodes[cur].right;
            }
        }
        best
    }

    pub fn min_key(&self) -> Option<u64> {
        let mut cur = self.root;
        if cur == NIL {
            return None;
        }
        while self.nodes[cur].left != NIL {
            cur = self.nodes[cur].left;
        }
        Some(self.nodes[cur].key)
    }

    /// `(key, weight, payload)` in ascending key order.
    pub fn entries(&self) -> Vec<(u64, u64, V)> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = Vec::new();
        let mut cur = self.root;
        while cur != NIL || !stack.is_empty() {
            while cur != NIL {
                stack.push(cur);
                cur = self.nodes[cur].left;
            }
            let Some(n) = stack.pop() else {
                break;
            };
            let node = &self.nodes[n];
            out.push((node.key, node.weight, node.value));
            cur = node.right;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(t: &SplayTree<u64>) -> Vec<u64> {
        t.entries().into_iter().map(|(k, _, _)| k).collect()
    }

    #[test]
    fn test_insert_and_order() {
        let mut t = SplayTree::new();
        for k in [5u64, 1, 9, 3, 7] {
            t.insert(k, k * 10, 1);
        }
        assert_eq!(t.len(), 5);
        assert_eq!(keys(&t), vec![1, 3, 5, 7, 9]);
        assert_eq!(t.total_weight(), 5);
        assert_eq!(t.min_key(), Some(1));
    }

    #[test]
    fn test_weight_above() {
        let mut t = SplayTree::new();
        for k in 1..=10u64 {
            t.insert(k, 0u64, k);
        }
        assert_eq!(t.weight_above(10), 0);
        assert_eq!(t.weight_above(8), 9 + 10);
        // absent key
        assert_eq!(t.weight_above(0), 55);
        t.remove(9);
        assert_eq!(t.weight_above(8), 10);
    }

    #[test]
    fn test_remove_returns_payload() {
        let mut t = SplayTree::new();
        for k in [4u64, 2, 6, 1, 3] {
            t.insert(k, k + 100, 2);
        }
        assert_eq!(t.remove(2), Some((2, 102)));
        assert_eq!(t.remove(2), None);
        assert_eq!(keys(&t), vec![1, 3, 4, 6]);
        assert_eq!(t.total_weight(), 8);
        for k in [1, 3, 4, 6] {
            t.remove(k);
        }
        assert!(t.is_empty());
        assert_eq!(t.total_weight(), 0);
    }

    #[test]
    fn test_neighbours_and_adjust() {
        let mut t = SplayTree::new();
        for k in [10u64, 20, 30] {
            t.insert(k, (), 1);
        }
        assert_eq!(t.ceiling(15), Some(20));
        assert_eq!(t.ceiling(20), Some(20));
        assert_eq!(t.ceiling(31), None);
        assert_eq!(t.predecessor(20), Some(10));
        assert_eq!(t.successor(20), Some(30));
        assert_eq!(t.successor(30), None);
        assert_eq!(t.adjust(20, 4), Some(5));
        assert_eq!(t.adjust(20, -9), Some(0));
        assert_eq!(t.weight(20), Some(0));
        assert_eq!(t.total_weight(), 2);
    }

    #[test]
    fn test_many_keys_stay_consistent() {
        let mut t = SplayTree::new();
        for k in 0..500u64 {
            t.insert((k * 7919) % 1009, (), 1);
        }
        for k in (0..1009u64).step_by(3) {
            t.remove(k);
        }
        let entries = t.entries();
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(t.total_weight() as usize, entries.len());
        assert_eq!(t.len(), entries.len());
    }
}
