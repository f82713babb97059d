//! Top-down splay tree over disjoint half-open address ranges.
//!
//! Nodes live in an index arena. Every lookup splays the last node on the
//! search path to the root, so a hot object checked in a loop is found at the
//! root on the next call. After a miss the root is the nearest range below or
//! above the searched address, which is what neighbour queries rely on.

use std::cmp::Ordering;

const NIL: usize = usize::MAX;

#[derive(Debug, Clone)]
struct Node<V> {
    start: usize,
    end: usize,
    left: usize,
    right: usize,
    value: V,
}

/// Map from disjoint ranges `[start, end)` to values.
#[derive(Debug, Clone)]
pub struct RangeMap<V> {
    nodes: Vec<Option<Node<V>>>,
    vacant: Vec<usize>,
    root: usize,
    len: usize,
}

impl<V> RangeMap<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            vacant: Vec::new(),
            root: NIL,
            len: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.vacant.clear();
        self.root = NIL;
        self.len = 0;
    }

    fn node(&self, i: usize) -> &Node<V> {
        match self.nodes[i].as_ref() {
            Some(n) => n,
            None => unreachable!("splay link to vacant slot {i}"),
        }
    }

    fn node_mut(&mut self, i: usize) -> &mut Node<V> {
        match self.nodes[i].as_mut() {
            Some(n) => n,
            None => unreachable!("splay link to vacant slot {i}"),
        }
    }

    fn compare(&self, addr: usize, i: usize) -> Ordering {
        let n = self.node(i);
        if addr < n.start {
            Ordering::Less
        } else if addr >= n.end {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    /// Sleator's top-down splay of the subtree rooted at `t` around `addr`.
    fn splay(&mut self, mut t: usize, addr: usize) -> usize {
        if t == NIL {
            return NIL;
        }
        // Rightmost node of the left tree and leftmost node of the right tree.
        let (mut l_tail, mut r_tail) = (NIL, NIL);
        let (mut l_root, mut r_root) = (NIL, NIL);
        loop {
            match self.compare(addr, t) {
                Ordering::Less => {
                    let mut child = self.node(t).left;
                    if child == NIL {
                        break;
                    }
                    if self.compare(addr, child) == Ordering::Less {
                        let moved = self.node(child).right;
                        self.node_mut(t).left = moved;
                        self.node_mut(child).right = t;
                        t = child;
                        child = self.node(t).left;
                        if child == NIL {
                            break;
                        }
                    }
                    if r_tail == NIL {
                        r_root = t;
                    } else {
                        self.node_mut(r_tail).left = t;
                    }
                    r_tail = t;
                    t = child;
                }
                Ordering::Greater => {
                    let mut child = self.node(t).right;
                    if child == NIL {
                        break;
                    }
                    if self.compare(addr, child) == Ordering::Greater {
                        let moved = self.node(child).left;
                        self.node_mut(t).right = moved;
                        self.node_mut(child).left = t;
                        t = child;
                        child = self.node(t).right;
                        if child == NIL {
                            break;
                        }
                    }
                    if l_tail == NIL {
                        l_root = t;
                    } else {
                        self.node_mut(l_tail).right = t;
                    }
                    l_tail = t;
                    t = child;
                }
                Ordering::Equal => break,
            }
        }
        let (t_left, t_right) = {
            let n = self.node(t);
            (n.left, n.right)
        };
        if l_tail == NIL {
            l_root = t_left;
        } else {
            self.node_mut(l_tail).right = t_left;
        }
        if r_tail == NIL {
            r_root = t_right;
        } else {
            self.node_mut(r_tail).left = t_right;
        }
        let n = self.node_mut(t);
        n.left = l_root;
        n.right = r_root;
        t
    }

    fn alloc_node(&mut self, node: Node<V>) -> usize {
        match self.vacant.pop() {
            Some(i) => {
                self.nodes[i] = Some(node);
                i
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    /// Insert `[start, end)`. Returns `false` and leaves the map unchanged if
    /// the range is empty or `start` is already covered.
    pub fn insert(&mut self, start: usize, end: usize, value: V) -> bool {
        if start >= end {
            return false;
        }
        let mut node = Node {
            start,
            end,
            left: NIL,
            right: NIL,
            value,
        };
        if self.root != NIL {
            self.root = self.splay(self.root, start);
            match self.compare(start, self.root) {
                Ordering::Equal => return false,
                Ordering::Less => {
                    node.left = self.node(self.root).left;
                    node.right = self.root;
                    self.node_mut(self.root).left = NIL;
                }
                Ordering::Greater => {
                    node.right = self.node(self.root).right;
                    node.left = self.root;
                    self.node_mut(self.root).right = NIL;
                }
            }
        }
        self.root = self.alloc_node(node);
        self.len += 1;
        true
    }

    /// Remove the range that begins exactly at `start`.
    pub fn remove(&mut self, start: usize) -> Option<(usize, usize, V)> {
        if self.root == NIL {
            return None;
        }
        self.root = self.splay(self.root, start);
        if self.node(self.root).start != start {
            return None;
        }
        let old = self.root;
        let (left, right) = {
            let n = self.node(old);
            (n.left, n.right)
        };
        self.root = if left == NIL {
            right
        } else {
            // Every range on the left ends at or before `start`, so this
            // splay brings the maximum up with an empty right subtree.
            let top = self.splay(left, start);
            self.node_mut(top).right = right;
            top
        };
        let node = self.nodes[old].take()?;
        self.vacant.push(old);
        self.len -= 1;
        Some((node.start, node.end, node.value))
    }

    /// Find the range covering `addr`.
    pub fn find(&mut self, addr: usize) -> Option<(usize, usize, &V)> {
        if self.root == NIL {
            return None;
        }
        self.root = self.splay(self.root, addr);
        if self.compare(addr, self.root) != Ordering::Equal {
            return None;
        }
        let n = self.node(self.root);
        Some((n.start, n.end, &n.value))
    }

    /// Find the range covering `addr` for in-place update.
    pub fn find_mut(&mut self, addr: usize) -> Option<(usize, usize, &mut V)> {
        self.find(addr)?;
        let n = self.node_mut(self.root);
        Some((n.start, n.end, &mut n.value))
    }

    /// Nearest range lying entirely below `addr`.
    pub fn predecessor(&mut self, addr: usize) -> Option<(usize, usize)> {
        if self.root == NIL {
            return None;
        }
        self.root = self.splay(self.root, addr);
        let root = self.node(self.root);
        if root.end <= addr {
            return Some((root.start, root.end));
        }
        let mut i = root.left;
        if i == NIL {
            return None;
        }
        while self.node(i).right != NIL {
            i = self.node(i).right;
        }
        let n = self.node(i);
        Some((n.start, n.end))
    }

    /// Nearest range lying entirely above `addr`.
    pub fn successor(&mut self, addr: usize) -> Option<(usize, usize)> {
        if self.root == NIL {
            return None;
        }
        self.root = self.splay(self.root, addr);
        let root = self.node(self.root);
        if root.start > addr {
            return Some((root.start, root.end));
        }
        let mut i = root.right;
        if i == NIL {
            return None;
        }
        while self.node(i).left != NIL {
            i = self.node(i).left;
        }
        let n = self.node(i);
        Some((n.start, n.end))
    }

    /// Start of the range currently at the root (the most recently touched).
    #[must_use]
    pub fn root_start(&self) -> Option<usize> {
        (self.root != NIL).then(|| self.node(self.root).start)
    }

    /// In-order snapshot of every range.
    #[must_use]
    pub fn ranges(&self) -> Vec<(usize, usize, &V)> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = Vec::new();
        let mut cur = self.root;
        while cur != NIL || !stack.is_empty() {
            while cur != NIL {
                stack.push(cur);
                cur = self.node(cur).left;
            }
            let Some(i) = stack.pop() else { break };
            let n = self.node(i);
            out.push((n.start, n.end, &n.value));
            cur = n.right;
        }
        out
    }
}

impl<V> Default for RangeMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
