//! Augmented interval tree over inclusive byte ranges.
//!
//! A red-black tree ordered by interval start, where every node carries the
//! maximum interval end found in its subtree. That bound is what makes
//! overlap search logarithmic: descend left whenever the left subtree's max
//! reaches the probe, otherwise right.
//!
//! Nodes live in an arena owned by the tree and are named by index. Index 0
//! is the shared NIL sentinel: black, self-referential, with a subtree max
//! below every real end. Because identity is the index and deletion splices
//! by successor using index surgery only, outside structures holding node
//! indexes (the per-request granted lists) stay valid across any delete of
//! *other* nodes.

use crate::error::{Error, Result};
use crate::types::ReqId;

/// Index of a node within one tree's arena.
pub type NodeIx = u32;

/// The shared sentinel index.
pub const NIL: NodeIx = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Debug)]
struct Node {
    start: i64,
    end: i64,
    max: i64,
    color: Color,
    parent: NodeIx,
    left: NodeIx,
    right: NodeIx,
    owner: ReqId,
}

/// Interval tree with `max` augmentation.
#[derive(Debug)]
pub struct IntervalTree {
    nodes: Vec<Node>,
    free: Vec<NodeIx>,
    root: NodeIx,
    len: usize,
}

impl Default for IntervalTree {
    fn default() -> Self {
        IntervalTree::new()
    }
}

impl IntervalTree {
    /// Empty tree holding only the sentinel.
    pub fn new() -> IntervalTree {
        IntervalTree {
            nodes: vec![Node {
                start: 0,
                end: 0,
                max: i64::MIN,
                color: Color::Black,
                parent: NIL,
                left: NIL,
                right: NIL,
                owner: ReqId(0),
            }],
            free: Vec::new(),
            root: NIL,
            len: 0,
        }
    }

    /// Number of intervals held.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no intervals are held.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Interval start for `ix`.
    pub fn start(&self, ix: NodeIx) -> i64 {
        self.nodes[ix as usize].start
    }

    /// Interval end (inclusive) for `ix`.
    pub fn end(&self, ix: NodeIx) -> i64 {
        self.nodes[ix as usize].end
    }

    /// Request id the interval was granted to.
    pub fn owner(&self, ix: NodeIx) -> ReqId {
        self.nodes[ix as usize].owner
    }

    fn alloc(&mut self, start: i64, end: i64, owner: ReqId) -> NodeIx {
        let node = Node {
            start,
            end,
            max: end,
            color: Color::Red,
            parent: NIL,
            left: NIL,
            right: NIL,
            owner,
        };
        if let Some(ix) = self.free.pop() {
            self.nodes[ix as usize] = node;
            ix
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as NodeIx
        }
    }

    /// Insert `[start, end]` owned by `owner`. Fails with `BadRange` when
    /// `start > end`.
    pub fn insert(&mut self, start: i64, end: i64, owner: ReqId) -> Result<NodeIx> {
        if start > end {
            return Err(Error::BadRange);
        }
        let z = self.alloc(start, end, owner);

        let mut y = NIL;
        let mut x = self.root;
        while x != NIL {
            y = x;
            // every node on the descent subsumes the new interval
            let xn = &mut self.nodes[x as usize];
            if end > xn.max {
                xn.max = end;
            }
            x = if start < xn.start { xn.left } else { xn.right };
        }
        self.nodes[z as usize].parent = y;
        if y == NIL {
            self.root = z;
        } else if start < self.nodes[y as usize].start {
            self.nodes[y as usize].left = z;
        } else {
            self.nodes[y as usize].right = z;
        }
        self.insert_fixup(z);
        self.len += 1;
        Ok(z)
    }

    /// Any interval intersecting `[lo, hi]`, or `None`.
    pub fn overlap_search(&self, lo: i64, hi: i64) -> Option<NodeIx> {
        let mut x = self.root;
        while x != NIL {
            let n = &self.nodes[x as usize];
            if n.start <= hi && lo <= n.end {
                return Some(x);
            }
            x = if n.left != NIL && self.nodes[n.left as usize].max >= lo {
                n.left
            } else {
                n.right
            };
        }
        None
    }

    /// True when no interval to the left of `ix` can reach `lo`; the
    /// conflict found by [`IntervalTree::overlap_search`] is then the
    /// earliest one and the range below `start(ix)` is free.
    pub fn clear_below(&self, ix: NodeIx, lo: i64) -> bool {
        let left = self.nodes[ix as usize].left;
        left == NIL || self.nodes[left as usize].max < lo
    }

    /// Shrink the end of `ix` to `new_end`, restoring the max bound on the
    /// path to the root.
    pub fn trim_end(&mut self, ix: NodeIx, new_end: i64) {
        debug_assert!(new_end >= self.nodes[ix as usize].start);
        self.nodes[ix as usize].end = new_end;
        self.update_max_upward(ix);
    }

    /// Remove the interval at `ix`. Other node indexes are unaffected.
    pub fn remove(&mut self, z: NodeIx) {
        debug_assert_ne!(z, NIL);
        let mut y = z;
        let mut y_color = self.nodes[y as usize].color;
        let x;
        if self.nodes[z as usize].left == NIL {
            x = self.nodes[z as usize].right;
            self.transplant(z, x);
        } else if self.nodes[z as usize].right == NIL {
            x = self.nodes[z as usize].left;
            self.transplant(z, x);
        } else {
            // splice by successor: the minimum of the right subtree takes
            // z's place in the structure, keeping its own index
            y = self.minimum(self.nodes[z as usize].right);
            y_color = self.nodes[y as usize].color;
            x = self.nodes[y as usize].right;
            if self.nodes[y as usize].parent == z {
                self.nodes[x as usize].parent = y;
            } else {
                self.transplant(y, x);
                let zr = self.nodes[z as usize].right;
                self.nodes[y as usize].right = zr;
                self.nodes[zr as usize].parent = y;
            }
            self.transplant(z, y);
            let zl = self.nodes[z as usize].left;
            self.nodes[y as usize].left = zl;
            self.nodes[zl as usize].parent = y;
            self.nodes[y as usize].color = self.nodes[z as usize].color;
        }

        // restore the max bound from the deepest structural change upward
        let fix_from = self.nodes[x as usize].parent;
        self.update_max_upward(fix_from);

        if y_color == Color::Black {
            self.remove_fixup(x);
        }
        self.nodes[NIL as usize].parent = NIL;
        self.free.push(z);
        self.len -= 1;
    }

    /// Node indexes in ascending start order. Diagnostic walk.
    pub fn inorder(&self) -> Vec<NodeIx> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = Vec::new();
        let mut x = self.root;
        while x != NIL || !stack.is_empty() {
            while x != NIL {
                stack.push(x);
                x = self.nodes[x as usize].left;
            }
            x = stack.pop().unwrap_or(NIL);
            if x != NIL {
                out.push(x);
                x = self.nodes[x as usize].right;
            }
        }
        out
    }

    /// Node indexes level by level from the root. Diagnostic walk.
    pub fn breadth(&self) -> Vec<NodeIx> {
        let mut out = Vec::with_capacity(self.len);
        if self.root == NIL {
            return out;
        }
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(self.root);
        while let Some(x) = queue.pop_front() {
            out.push(x);
            let n = &self.nodes[x as usize];
            if n.left != NIL {
                queue.push_back(n.left);
            }
            if n.right != NIL {
                queue.push_back(n.right);
            }
        }
        out
    }

    fn minimum(&self, mut x: NodeIx) -> NodeIx {
        while self.nodes[x as usize].left != NIL {
            x = self.nodes[x as usize].left;
        }
        x
    }

    fn transplant(&mut self, u: NodeIx, v: NodeIx) {
        let up = self.nodes[u as usize].parent;
        if up == NIL {
            self.root = v;
        } else if self.nodes[up as usize].left == u {
            self.nodes[up as usize].left = v;
        } else {
            self.nodes[up as usize].right = v;
        }
        self.nodes[v as usize].parent = up;
    }

    fn subtree_max(&self, ix: NodeIx) -> i64 {
        if ix == NIL { i64::MIN } else { self.nodes[ix as usize].max }
    }

    fn recompute_max(&mut self, ix: NodeIx) -> bool {
        let n = &self.nodes[ix as usize];
        let m = n.end.max(self.subtree_max(n.left)).max(self.subtree_max(n.right));
        if self.nodes[ix as usize].max == m {
            false
        } else {
            self.nodes[ix as usize].max = m;
            true
        }
    }

    fn update_max_upward(&mut self, mut ix: NodeIx) {
        while ix != NIL {
            self.recompute_max(ix);
            ix = self.nodes[ix as usize].parent;
        }
    }

    fn rotate_left(&mut self, x: NodeIx) {
        let y = self.nodes[x as usize].right;
        let yl = self.nodes[y as usize].left;
        self.nodes[x as usize].right = yl;
        if yl != NIL {
            self.nodes[yl as usize].parent = x;
        }
        let xp = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = xp;
        if xp == NIL {
            self.root = y;
        } else if self.nodes[xp as usize].left == x {
            self.nodes[xp as usize].left = y;
        } else {
            self.nodes[xp as usize].right = y;
        }
        self.nodes[y as usize].left = x;
        self.nodes[x as usize].parent = y;
        // x's subtree shrank, y inherited it; recompute bottom-up
        self.recompute_max(x);
        self.recompute_max(y);
    }

    fn rotate_right(&mut self, x: NodeIx) {
        let y = self.nodes[x as usize].left;
        let yr = self.nodes[y as usize].right;
        self.nodes[x as usize].left = yr;
        if yr != NIL {
            self.nodes[yr as usize].parent = x;
        }
        let xp = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = xp;
        if xp == NIL {
            self.root = y;
        } else if self.nodes[xp as usize].right == x {
            self.nodes[xp as usize].right = y;
        } else {
            self.nodes[xp as usize].left = y;
        }
        self.nodes[y as usize].right = x;
        self.nodes[x as usize].parent = y;
        self.recompute_max(x);
        self.recompute_max(y);
    }

    fn insert_fixup(&mut self, mut z: NodeIx) {
        while self.color(self.parent(z)) == Color::Red {
            let p = self.parent(z);
            let g = self.parent(p);
            if p == self.nodes[g as usize].left {
                let u = self.nodes[g as usize].right;
                if self.color(u) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(u, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.nodes[p as usize].right {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_right(g);
                }
            } else {
                let u = self.nodes[g as usize].left;
                if self.color(u) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(u, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.nodes[p as usize].left {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_left(g);
                }
            }
        }
        let root = self.root;
        self.set_color(root, Color::Black);
    }

    fn remove_fixup(&mut self, mut x: NodeIx) {
        while x != self.root && self.color(x) == Color::Black {
            let p = self.parent(x);
            if x == self.nodes[p as usize].left {
                let mut w = self.nodes[p as usize].right;
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_left(p);
                    w = self.nodes[self.parent(x) as usize].right;
                }
                if self.color(self.nodes[w as usize].left) == Color::Black
                    && self.color(self.nodes[w as usize].right) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.nodes[w as usize].right) == Color::Black {
                        let wl = self.nodes[w as usize].left;
                        self.set_color(wl, Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_right(w);
                        w = self.nodes[self.parent(x) as usize].right;
                    }
                    let p = self.parent(x);
                    let pc = self.color(p);
                    self.set_color(w, pc);
                    self.set_color(p, Color::Black);
                    let wr = self.nodes[w as usize].right;
                    self.set_color(wr, Color::Black);
                    self.rotate_left(p);
                    x = self.root;
                }
            } else {
                let mut w = self.nodes[p as usize].left;
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_right(p);
                    w = self.nodes[self.parent(x) as usize].left;
                }
                if self.color(self.nodes[w as usize].right) == Color::Black
                    && self.color(self.nodes[w as usize].left) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.nodes[w as usize].left) == Color::Black {
                        let wr = self.nodes[w as usize].right;
                        self.set_color(wr, Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_left(w);
                        w = self.nodes[self.parent(x) as usize].left;
                    }
                    let p = self.parent(x);
                    let pc = self.color(p);
                    self.set_color(w, pc);
                    self.set_color(p, Color::Black);
                    let wl = self.nodes[w as usize].left;
                    self.set_color(wl, Color::Black);
                    self.rotate_right(p);
                    x = self.root;
                }
            }
        }
        self.set_color(x, Color::Black);
    }

    fn color(&self, ix: NodeIx) -> Color {
        self.nodes[ix as usize].color
    }

    fn set_color(&mut self, ix: NodeIx, c: Color) {
        if ix != NIL {
            self.nodes[ix as usize].color = c;
        }
    }

    fn parent(&self, ix: NodeIx) -> NodeIx {
        self.nodes[ix as usize].parent
    }

    /// Panic if any red-black or max invariant is violated. Test support.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        assert_eq!(self.color(self.root), Color::Black, "root must be black");
        assert_eq!(
            self.nodes[NIL as usize].max,
            i64::MIN,
            "sentinel max must stay below all ends"
        );
        if self.root != NIL {
            self.check_node(self.root);
        }
    }

    #[cfg(test)]
    fn check_node(&self, ix: NodeIx) -> usize {
        let n = &self.nodes[ix as usize];
        assert!(n.start <= n.end, "interval must be ordered");
        let expect = n
            .end
            .max(self.subtree_max(n.left))
            .max(self.subtree_max(n.right));
        assert_eq!(n.max, expect, "max bound out of date at {ix}");
        if n.color == Color::Red {
            assert_eq!(self.color(n.left), Color::Black, "red child of red");
            assert_eq!(self.color(n.right), Color::Black, "red child of red");
        }
        let lh = if n.left != NIL { self.check_node(n.left) } else { 1 };
        let rh = if n.right != NIL { self.check_node(n.right) } else { 1 };
        assert_eq!(lh, rh, "black heights differ under {ix}");
        lh + usize::from(n.color == Color::Black)
    }
}
