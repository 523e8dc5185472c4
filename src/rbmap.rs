//! Ordered map from 64-bit ids to arena slots, as a red-black tree.
//!
//! Holds the granted-request index of the lock manager: key is the request
//! id, value is the stable pool index of the request. Nodes are arena-backed
//! like the interval tree, so a delete disturbs nothing but the removed
//! entry.

use std::fmt;

type Ix = u32;
const NIL: Ix = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

struct Node {
    key: u64,
    val: u32,
    color: Color,
    parent: Ix,
    left: Ix,
    right: Ix,
}

/// Red-black map `u64 -> u32`.
pub struct RbMap {
    nodes: Vec<Node>,
    free: Vec<Ix>,
    root: Ix,
    len: usize,
}

impl Default for RbMap {
    fn default() -> Self {
        RbMap::new()
    }
}

impl fmt::Debug for RbMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl RbMap {
    /// Empty map.
    pub fn new() -> RbMap {
        RbMap {
            nodes: vec![Node {
                key: 0,
                val: 0,
                color: Color::Black,
                parent: NIL,
                left: NIL,
                right: NIL,
            }],
            free: Vec::new(),
            root: NIL,
            len: 0,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the map holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Value stored under `key`, if present.
    pub fn get(&self, key: u64) -> Option<u32> {
        let mut x = self.root;
        while x != NIL {
            let n = &self.nodes[x as usize];
            match key.cmp(&n.key) {
                std::cmp::Ordering::Equal => return Some(n.val),
                std::cmp::Ordering::Less => x = n.left,
                std::cmp::Ordering::Greater => x = n.right,
            }
        }
        None
    }

    /// True when `key` is present.
    pub fn contains(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    /// Insert `key -> val`. An existing entry is overwritten and the old
    /// value returned.
    pub fn insert(&mut self, key: u64, val: u32) -> Option<u32> {
        let mut y = NIL;
        let mut x = self.root;
        while x != NIL {
            y = x;
            let n = &mut self.nodes[x as usize];
            match key.cmp(&n.key) {
                std::cmp::Ordering::Equal => {
                    let old = n.val;
                    n.val = val;
                    return Some(old);
                }
                std::cmp::Ordering::Less => x = n.left,
                std::cmp::Ordering::Greater => x = n.right,
            }
        }
        let z = self.alloc(key, val, y);
        if y == NIL {
            self.root = z;
        } else if key < self.nodes[y as usize].key {
            self.nodes[y as usize].left = z;
        } else {
            self.nodes[y as usize].right = z;
        }
        self.insert_fixup(z);
        self.len += 1;
        None
    }

    /// Remove `key`, returning its value when it was present.
    pub fn remove(&mut self, key: u64) -> Option<u32> {
        let mut z = self.root;
        while z != NIL {
            let n = &self.nodes[z as usize];
            match key.cmp(&n.key) {
                std::cmp::Ordering::Equal => break,
                std::cmp::Ordering::Less => z = n.left,
                std::cmp::Ordering::Greater => z = n.right,
            }
        }
        if z == NIL {
            return None;
        }
        let val = self.nodes[z as usize].val;

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
        if y_color == Color::Black {
            self.remove_fixup(x);
        }
        self.nodes[NIL as usize].parent = NIL;
        self.free.push(z);
        self.len -= 1;
        Some(val)
    }

    /// Entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        let mut stack = Vec::new();
        let mut x = self.root;
        std::iter::from_fn(move || {
            while x != NIL {
                stack.push(x);
                x = self.nodes[x as usize].left;
            }
            let top = stack.pop()?;
            let n = &self.nodes[top as usize];
            x = n.right;
            Some((n.key, n.val))
        })
    }

    fn alloc(&mut self, key: u64, val: u32, parent: Ix) -> Ix {
        let node = Node {
            key,
            val,
            color: Color::Red,
            parent,
            left: NIL,
            right: NIL,
        };
        if let Some(ix) = self.free.pop() {
            self.nodes[ix as usize] = node;
            ix
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as Ix
        }
    }

    fn minimum(&self, mut x: Ix) -> Ix {
        while self.nodes[x as usize].left != NIL {
            x = self.nodes[x as usize].left;
        }
        x
    }

    fn transplant(&mut self, u: Ix, v: Ix) {
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

    fn rotate_left(&mut self, x: Ix) {
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
    }

    fn rotate_right(&mut self, x: Ix) {
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
    }

    fn color(&self, ix: Ix) -> Color {
        self.nodes[ix as usize].color
    }

    fn set_color(&mut self, ix: Ix, c: Color) {
        if ix != NIL {
            self.nodes[ix as usize].color = c;
        }
    }

    fn parent(&self, ix: Ix) -> Ix {
        self.nodes[ix as usize].parent
    }

    fn insert_fixup(&mut self, mut z: Ix) {
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

    fn remove_fixup(&mut self, mut x: Ix) {
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
}
