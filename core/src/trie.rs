//! Double-array trie (BASE/CHECK) dictionary index.
//!
//! Keys are raw byte strings (UTF-8 is handled as bytes). The node under
//! byte `c` of node `n` lives at `base[n] + c` and is accepted only when
//! `check[base[n] + c] == n`; `check == 0` marks a free slot. Byte 0 is
//! reserved as the key terminator, so empty keys and keys containing NUL
//! are rejected.
//!
//! Terminal values are tagged into the terminator node's BASE as
//! `-(value + 1)`; value `0xFFFF` is reserved to mean "none" and `0xFFFE`
//! for the synthetic BOS id of the semi-Markov decoder.
//!
//! Two shapes share one read path: the owned, growable [`DoubleArray`] used
//! during training, and the borrowed [`DoubleArrayView`] over arrays loaded
//! from a model file or embedded in ROM. [`DaRead`] is the seam between
//! them.

use crate::{Error, Result};

/// Index type of the BASE/CHECK arrays.
pub type DaIndex = i32;

/// Root node index. Index 0 is unused.
pub const ROOT: DaIndex = 1;

/// Terminal value meaning "no value".
pub const TERM_NONE: u16 = 0xFFFF;

/// Largest storable terminal value (0xFFFF is reserved).
pub const TERM_VALUE_MAX: u16 = 0xFFFE;

const MIN_CAPACITY: usize = 16;

/// Read-only transition semantics shared by the owned trie and the
/// borrowed view.
pub trait DaRead {
    fn base(&self) -> &[DaIndex];
    fn check(&self) -> &[DaIndex];

    #[inline]
    fn capacity(&self) -> usize {
        self.base().len()
    }

    /// Transition from `cur` under byte `code`; 0 when there is no child.
    ///
    /// A computed destination equal to `cur` is never a child: the root is
    /// initialized with `base[1] = check[1] = 1`, so `base[root] + 0`
    /// would otherwise masquerade as a self-loop child and corrupt child
    /// collection during relocation.
    #[inline]
    fn next(&self, cur: DaIndex, code: u8) -> DaIndex {
        let base = self.base();
        let check = self.check();
        if cur <= 0 || (cur as usize) >= base.len() {
            return 0;
        }
        let b = base[cur as usize];
        if b <= 0 {
            return 0;
        }
        let idx = b as usize + code as usize;
        if idx >= base.len() || idx == cur as usize {
            return 0;
        }
        if check[idx] == cur {
            idx as DaIndex
        } else {
            0
        }
    }

    /// Walk `bytes` from the root; 0 when any transition is missing.
    fn walk(&self, bytes: &[u8]) -> DaIndex {
        let mut cur = ROOT;
        for &b in bytes {
            cur = self.next(cur, b);
            if cur == 0 {
                return 0;
            }
        }
        cur
    }

    /// True when `bytes` was inserted as a complete key.
    fn contains(&self, bytes: &[u8]) -> bool {
        let cur = self.walk(bytes);
        cur != 0 && self.next(cur, 0) != 0
    }

    /// Node reached after consuming `bytes` as a prefix, or 0.
    fn search_prefix(&self, bytes: &[u8]) -> DaIndex {
        self.walk(bytes)
    }

    /// Terminal value stored at `node` (the value tagged on its byte-0
    /// child), if any.
    fn term_value_at(&self, node: DaIndex) -> Option<u16> {
        let term = self.next(node, 0);
        if term == 0 {
            return None;
        }
        let v = self.base()[term as usize];
        if v >= 0 {
            return None;
        }
        let id = (-(v as i64) - 1) as u64;
        if id > u64::from(TERM_VALUE_MAX) {
            return None;
        }
        Some(id as u16)
    }

    /// Terminal value for a complete key.
    fn get_term_value(&self, bytes: &[u8]) -> Option<u16> {
        let cur = self.walk(bytes);
        if cur == 0 {
            None
        } else {
            self.term_value_at(cur)
        }
    }
}

/// Owned double-array trie with incremental insertion.
#[derive(Debug, Clone)]
pub struct DoubleArray {
    base: Vec<DaIndex>,
    check: Vec<DaIndex>,
    growable: bool,
}

impl DaRead for DoubleArray {
    #[inline]
    fn base(&self) -> &[DaIndex] {
        &self.base
    }
    #[inline]
    fn check(&self) -> &[DaIndex] {
        &self.check
    }
}

/// Read-only view over BASE/CHECK arrays owned elsewhere (a loaded model
/// block or a const table). Identical transition semantics.
#[derive(Debug, Clone, Copy)]
pub struct DoubleArrayView<'a> {
    base: &'a [DaIndex],
    check: &'a [DaIndex],
}

impl<'a> DoubleArrayView<'a> {
    pub fn new(base: &'a [DaIndex], check: &'a [DaIndex]) -> Result<Self> {
        if base.len() != check.len() || base.len() <= ROOT as usize {
            return Err(Error::BadArgument("view arrays too small or mismatched"));
        }
        Ok(Self { base, check })
    }
}

impl DaRead for DoubleArrayView<'_> {
    #[inline]
    fn base(&self) -> &[DaIndex] {
        self.base
    }
    #[inline]
    fn check(&self) -> &[DaIndex] {
        self.check
    }
}

impl DoubleArray {
    /// Hard ceiling on capacity. Bounds both memory and the upward
    /// `find_base` scan on adversarial key distributions.
    pub const MAX_CAPACITY: usize = 1 << 28;

    /// Create an empty growable trie.
    pub fn new(initial_capacity: usize) -> Self {
        let cap = initial_capacity.max(MIN_CAPACITY);
        let mut da = Self {
            base: vec![0; cap],
            check: vec![0; cap],
            growable: true,
        };
        da.clear();
        da
    }

    /// Create an empty trie that will never reallocate; insertions that
    /// need more room fail with `Full`. This is the stand-in for
    /// caller-provided static storage.
    pub fn with_fixed_capacity(capacity: usize) -> Result<Self> {
        if capacity < MIN_CAPACITY {
            return Err(Error::BadArgument("trie capacity below minimum"));
        }
        let mut da = Self {
            base: vec![0; capacity],
            check: vec![0; capacity],
            growable: false,
        };
        da.clear();
        Ok(da)
    }

    /// Adopt BASE/CHECK arrays loaded from a model file.
    pub fn from_parts(base: Vec<DaIndex>, check: Vec<DaIndex>) -> Result<Self> {
        if base.len() != check.len() || base.len() <= ROOT as usize {
            return Err(Error::ModelInvalid(
                "trie arrays too small or mismatched".into(),
            ));
        }
        Ok(Self {
            base,
            check,
            growable: false,
        })
    }

    /// Zero all slots and restore the root self-marker.
    pub fn clear(&mut self) {
        self.base.fill(0);
        self.check.fill(0);
        self.base[ROOT as usize] = 1;
        self.check[ROOT as usize] = ROOT;
    }

    /// Insert a key. `FULL` from a fixed-capacity trie leaves the trie
    /// valid but the key absent.
    pub fn insert(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            // An empty key would collide with the root self-loop.
            return Err(Error::BadArgument("empty trie key"));
        }
        if bytes.contains(&0) {
            return Err(Error::BadArgument("trie key contains NUL"));
        }
        let mut cur = ROOT;
        for &b in bytes {
            cur = self.ensure_transition(cur, b)?;
        }
        // Key terminator.
        self.ensure_transition(cur, 0)?;
        Ok(())
    }

    /// Insert `bytes` (if absent) and tag `value` on its terminator node.
    pub fn set_term_value(&mut self, bytes: &[u8], value: u16) -> Result<()> {
        if value > TERM_VALUE_MAX {
            return Err(Error::BadArgument("terminal value out of range"));
        }
        self.insert(bytes)?;
        let cur = self.walk(bytes);
        if cur == 0 {
            return Err(Error::Internal("inserted key not walkable"));
        }
        let term = self.next(cur, 0);
        if term == 0 {
            return Err(Error::Internal("inserted key has no terminator"));
        }
        self.base[term as usize] = -(DaIndex::from(value)) - 1;
        Ok(())
    }

    /// Consume the trie into its raw arrays (model serialization).
    pub fn into_parts(self) -> (Vec<DaIndex>, Vec<DaIndex>) {
        (self.base, self.check)
    }

    /// Grow to hold at least `need` slots. All-or-nothing: on failure the
    /// old arrays remain valid.
    fn reserve(&mut self, need: usize) -> Result<()> {
        if need <= self.base.len() {
            return Ok(());
        }
        if !self.growable {
            return Err(Error::Full("fixed-capacity trie"));
        }
        if need > Self::MAX_CAPACITY {
            return Err(Error::Full("trie capacity ceiling"));
        }
        let mut newcap = self.base.len().max(MIN_CAPACITY);
        while newcap < need {
            newcap *= 2;
        }
        let newcap = newcap.min(Self::MAX_CAPACITY);
        self.base.resize(newcap, 0);
        self.check.resize(newcap, 0);
        Ok(())
    }

    /// Collect the existing child byte codes of `parent`.
    fn collect_children(&self, parent: DaIndex, codes: &mut [u8; 256]) -> usize {
        let b = self.base[parent as usize];
        if b <= 0 {
            return 0;
        }
        let mut n = 0;
        for c in 0..256usize {
            let idx = b as usize + c;
            // The parent's own slot is never one of its children (root
            // self-loop guard).
            if idx == parent as usize {
                continue;
            }
            if idx < self.base.len() && self.check[idx] == parent {
                codes[n] = c as u8;
                n += 1;
            }
        }
        n
    }

    /// Find a base `b >= 1` placing every code of `codes` in a slot that
    /// is free or already owned by `parent`. Slots owned by the same
    /// parent count as free because relocation will rewrite them.
    fn find_base(&mut self, parent: DaIndex, codes: &[u8]) -> Result<DaIndex> {
        debug_assert!(!codes.is_empty());
        let maxc = codes.iter().copied().max().unwrap_or(0) as usize;

        let mut b: usize = 1;
        loop {
            let need = b + maxc + 1;
            self.reserve(need)?;

            let mut ok = true;
            for &c in codes {
                let idx = b + c as usize;
                if idx == parent as usize {
                    ok = false;
                    break;
                }
                let chk = self.check[idx];
                if chk != 0 && chk != parent {
                    ok = false;
                    break;
                }
            }
            if ok {
                return Ok(b as DaIndex);
            }
            b += 1;
            if b + maxc + 1 > Self::MAX_CAPACITY {
                return Err(Error::Full("no base found below capacity ceiling"));
            }
        }
    }

    /// Move every child of `parent` from its old base to `new_base`.
    ///
    /// Grandchild `check` pointers are rewritten in two passes through a
    /// negative sentinel: moving several children at once means a new
    /// child index can coincide with a *different* old child index, and a
    /// single-pass rewrite would re-match the freshly written value and
    /// corrupt the tree.
    fn relocate_children(&mut self, parent: DaIndex, new_base: DaIndex) -> Result<()> {
        let mut codes = [0u8; 256];
        let n = self.collect_children(parent, &mut codes);
        let old_base = self.base[parent as usize];

        let mut old_idx = [0 as DaIndex; 256];
        let mut new_idx = [0 as DaIndex; 256];
        let mut child_base = [0 as DaIndex; 256];

        for i in 0..n {
            let o = old_base as usize + codes[i] as usize;
            let nn = new_base as usize + codes[i] as usize;
            self.reserve(nn + 1)?;
            old_idx[i] = o as DaIndex;
            new_idx[i] = nn as DaIndex;
            child_base[i] = self.base[o];
        }

        for i in 0..n {
            let o = old_idx[i] as usize;
            self.base[o] = 0;
            self.check[o] = 0;
        }
        for i in 0..n {
            let nn = new_idx[i] as usize;
            self.check[nn] = parent;
            self.base[nn] = child_base[i];
        }

        // Pass 1: mark grandchild slots with -new_child.
        for i in 0..n {
            let b = child_base[i];
            if b <= 0 {
                continue;
            }
            let old_child = old_idx[i];
            let new_child = new_idx[i];
            for c in 0..256usize {
                let g = b as usize + c;
                if g < self.check.len() && self.check[g] == old_child {
                    self.check[g] = -new_child;
                }
            }
        }
        // Pass 2: flip the sentinels positive.
        for i in 0..n {
            let b = child_base[i];
            if b <= 0 {
                continue;
            }
            let new_child = new_idx[i];
            let neg = -new_child;
            for c in 0..256usize {
                let g = b as usize + c;
                if g < self.check.len() && self.check[g] == neg {
                    self.check[g] = new_child;
                }
            }
        }

        self.base[parent as usize] = new_base;
        Ok(())
    }

    /// Guarantee the transition `parent --code-->` exists, relocating the
    /// parent's children on collision.
    fn ensure_transition(&mut self, parent: DaIndex, code: u8) -> Result<DaIndex> {
        if parent <= 0 || (parent as usize) >= self.base.len() {
            return Err(Error::BadArgument("transition from invalid node"));
        }

        let mut b = self.base[parent as usize];
        if b <= 0 {
            // No children yet: place this single code.
            let nb = self.find_base(parent, &[code])?;
            self.base[parent as usize] = nb;
            b = nb;
        }

        let idx = b as usize + code as usize;
        self.reserve(idx + 1)?;

        let chk = self.check[idx];
        if chk == parent {
            return Ok(idx as DaIndex);
        }
        if chk == 0 {
            self.check[idx] = parent;
            self.base[idx] = 0;
            return Ok(idx as DaIndex);
        }

        // Collision: relocate the existing children plus the new code.
        let mut codes = [0u8; 256];
        let mut n = self.collect_children(parent, &mut codes);
        if !codes[..n].contains(&code) {
            codes[n] = code;
            n += 1;
        }

        let new_base = self.find_base(parent, &codes[..n])?;
        self.relocate_children(parent, new_base)?;

        let idx = new_base as usize + code as usize;
        self.reserve(idx + 1)?;
        if self.check[idx] != 0 {
            return Err(Error::Internal("relocated slot still occupied"));
        }
        self.check[idx] = parent;
        self.base[idx] = 0;
        Ok(idx as DaIndex)
    }
}

impl Default for DoubleArray {
    fn default() -> Self {
        Self::new(MIN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn insert_contains_prefix() {
        let mut da = DoubleArray::new(16);
        for key in ["cat", "car", "dog"] {
            da.insert(key.as_bytes()).unwrap();
        }
        assert!(da.contains(b"cat"));
        assert!(da.contains(b"car"));
        assert!(da.contains(b"dog"));
        assert!(!da.contains(b"ca"));
        assert!(!da.contains(b"cats"));
        assert!(!da.contains(b"d"));

        let node = da.search_prefix(b"ca");
        assert_ne!(node, 0);
        assert_ne!(da.next(node, b'r'), 0);
        assert_ne!(da.next(node, b't'), 0);
        assert_eq!(da.next(node, b'x'), 0);
    }

    #[test]
    fn rejects_empty_and_nul_keys() {
        let mut da = DoubleArray::new(16);
        assert!(matches!(da.insert(b""), Err(Error::BadArgument(_))));
        assert!(matches!(da.insert(b"a\0b"), Err(Error::BadArgument(_))));
    }

    #[test]
    fn term_value_round_trip() {
        let mut da = DoubleArray::new(16);
        da.set_term_value("東京".as_bytes(), 7).unwrap();
        da.set_term_value("東".as_bytes(), 42).unwrap();
        assert_eq!(da.get_term_value("東京".as_bytes()), Some(7));
        assert_eq!(da.get_term_value("東".as_bytes()), Some(42));
        assert_eq!(da.get_term_value("京".as_bytes()), None);
        // re-tagging overwrites
        da.set_term_value("東".as_bytes(), 1).unwrap();
        assert_eq!(da.get_term_value("東".as_bytes()), Some(1));
        // reserved value rejected
        assert!(da.set_term_value(b"x", TERM_NONE).is_err());
    }

    #[test]
    fn clear_restores_root_marker() {
        let mut da = DoubleArray::new(16);
        da.insert(b"abc").unwrap();
        da.clear();
        assert!(!da.contains(b"abc"));
        assert_eq!(da.base()[ROOT as usize], 1);
        assert_eq!(da.check()[ROOT as usize], ROOT);
        da.insert(b"abc").unwrap();
        assert!(da.contains(b"abc"));
    }

    #[test]
    fn fixed_capacity_reports_full() {
        let mut da = DoubleArray::with_fixed_capacity(16).unwrap();
        let mut full = false;
        for i in 0..64u32 {
            let key = format!("key{i:04}");
            match da.insert(key.as_bytes()) {
                Ok(()) => {}
                Err(Error::Full(_)) => {
                    full = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(full, "16-slot trie must run out of room");
    }

    #[test]
    fn view_matches_owned() {
        let mut da = DoubleArray::new(16);
        for key in ["a", "ab", "abc", "b", "xyz"] {
            da.insert(key.as_bytes()).unwrap();
        }
        da.set_term_value(b"ab", 3).unwrap();
        let view = DoubleArrayView::new(da.base(), da.check()).unwrap();
        for key in ["a", "ab", "abc", "b", "xyz"] {
            assert!(view.contains(key.as_bytes()));
        }
        assert!(!view.contains(b"x"));
        assert_eq!(view.get_term_value(b"ab"), Some(3));
    }

    /// Reference trie: plain per-node child maps.
    #[derive(Default)]
    struct MapTrie {
        children: Vec<HashMap<u8, usize>>,
        terminal: Vec<bool>,
    }

    impl MapTrie {
        fn new() -> Self {
            Self {
                children: vec![HashMap::new()],
                terminal: vec![false],
            }
        }
        fn insert(&mut self, key: &[u8]) {
            let mut cur = 0;
            for &b in key {
                cur = match self.children[cur].get(&b) {
                    Some(&n) => n,
                    None => {
                        let n = self.children.len();
                        self.children.push(HashMap::new());
                        self.terminal.push(false);
                        self.children[cur].insert(b, n);
                        n
                    }
                };
            }
            self.terminal[cur] = true;
        }
        fn contains(&self, key: &[u8]) -> bool {
            let mut cur = 0;
            for &b in key {
                match self.children[cur].get(&b) {
                    Some(&n) => cur = n,
                    None => return false,
                }
            }
            self.terminal[cur]
        }
    }

    fn xorshift(state: &mut u32) -> u32 {
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *state = x;
        x
    }

    /// After any sequence of insertions, the transition function must be
    /// equivalent to the naive child-map trie: every inserted key (and no
    /// probe string) is accepted, even across relocations.
    #[test]
    fn relocation_equivalence_randomized() {
        let mut seed = 0x1234_5678u32;
        let mut da = DoubleArray::new(16);
        let mut reference = MapTrie::new();
        let mut keys: HashSet<Vec<u8>> = HashSet::new();

        for _ in 0..600 {
            let len = 1 + (xorshift(&mut seed) % 6) as usize;
            let key: Vec<u8> = (0..len)
                // byte alphabet chosen to force dense collisions
                .map(|_| 1 + (xorshift(&mut seed) % 7) as u8)
                .collect();
            da.insert(&key).unwrap();
            reference.insert(&key);
            keys.insert(key);
        }

        for key in &keys {
            assert!(da.contains(key), "missing key {key:?}");
        }
        // probe strings near the key space
        for _ in 0..2000 {
            let len = 1 + (xorshift(&mut seed) % 8) as usize;
            let probe: Vec<u8> = (0..len)
                .map(|_| 1 + (xorshift(&mut seed) % 9) as u8)
                .collect();
            assert_eq!(
                da.contains(&probe),
                reference.contains(&probe),
                "divergence on probe {probe:?}"
            );
        }
    }

    /// Dense multi-child relocation where new child indices overlap old
    /// child indices of siblings; guards the two-pass check rewrite.
    #[test]
    fn relocation_with_grandchildren() {
        let mut da = DoubleArray::new(16);
        // Build a parent with several children each having grandchildren,
        // then force relocation by adding colliding codes.
        let keys: Vec<Vec<u8>> = (1u8..=12)
            .flat_map(|a| (1u8..=4).map(move |b| vec![a, b, a ^ b | 1]))
            .collect();
        for k in &keys {
            da.insert(k).unwrap();
        }
        for k in &keys {
            assert!(da.contains(k));
        }
        // values survive relocations triggered by later inserts
        da.set_term_value(&keys[0], 11).unwrap();
        for i in 200u16..260 {
            let k = [(i % 251 + 1) as u8, (i / 3 % 251 + 1) as u8];
            da.insert(&k).unwrap();
        }
        assert_eq!(da.get_term_value(&keys[0]), Some(11));
        for k in &keys {
            assert!(da.contains(k), "key lost after relocation: {k:?}");
        }
    }
}
