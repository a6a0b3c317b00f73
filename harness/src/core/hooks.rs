//! Suite-scoped lifecycle hooks.
//!
//! Hooks live in a tree keyed by suite name. The root node holds hooks
//! registered outside any suite and always matches. A test collects the
//! hooks of every node on its suite path, then runs them in registration
//! order (each hook carries a global sequence number).

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    BeforeEach,
    AfterEach,
}

#[derive(Debug)]
pub struct HookTree<H> {
    root: HookNode<H>,
    next_seq: u64,
}

#[derive(Debug)]
struct HookNode<H> {
    before_each: Vec<(u64, H)>,
    after_each: Vec<(u64, H)>,
    children: BTreeMap<String, HookNode<H>>,
}

impl<H> Default for HookNode<H> {
    fn default() -> Self {
        Self {
            before_each: Vec::new(),
            after_each: Vec::new(),
            children: BTreeMap::new(),
        }
    }
}

impl<H> Default for HookTree<H> {
    fn default() -> Self {
        Self {
            root: HookNode::default(),
            next_seq: 0,
        }
    }
}

impl<H> HookTree<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` at `suite_path` (empty path = root).
    pub fn register(&mut self, kind: HookKind, suite_path: &[String], hook: H) {
        let mut node = &mut self.root;
        for segment in suite_path {
            node = node.children.entry(segment.clone()).or_default();
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        match kind {
            HookKind::BeforeEach => node.before_each.push((seq, hook)),
            HookKind::AfterEach => node.after_each.push((seq, hook)),
        }
    }

    /// Hooks whose suite path is a prefix of (or equal to) `suite_path`, in
    /// registration order.
    pub fn matching(&self, kind: HookKind, suite_path: &[String]) -> Vec<&H> {
        let mut collected: Vec<&(u64, H)> = Vec::new();
        let mut node = Some(&self.root);
        let mut segments = suite_path.iter();
        while let Some(current) = node {
            let hooks = match kind {
                HookKind::BeforeEach => &current.before_each,
                HookKind::AfterEach => &current.after_each,
            };
            collected.extend(hooks.iter());
            node = segments
                .next()
                .and_then(|segment| current.children.get(segment));
        }
        collected.sort_by_key(|(seq, _)| *seq);
        collected.into_iter().map(|(_, hook)| hook).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.next_seq == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn root_hooks_always_match() {
        let mut tree = HookTree::new();
        tree.register(HookKind::BeforeEach, &[], "root");
        assert_eq!(tree.matching(HookKind::BeforeEach, &[]), vec![&"root"]);
        assert_eq!(
            tree.matching(HookKind::BeforeEach, &path(&["a", "b"])),
            vec![&"root"]
        );
    }

    #[test]
    fn prefix_and_equal_paths_match_but_siblings_do_not() {
        let mut tree = HookTree::new();
        tree.register(HookKind::BeforeEach, &path(&["api"]), "api");
        tree.register(HookKind::BeforeEach, &path(&["api", "auth"]), "auth");
        tree.register(HookKind::BeforeEach, &path(&["ui"]), "ui");

        assert_eq!(
            tree.matching(HookKind::BeforeEach, &path(&["api", "auth"])),
            vec![&"api", &"auth"]
        );
        assert_eq!(
            tree.matching(HookKind::BeforeEach, &path(&["api"])),
            vec![&"api"]
        );
        assert!(tree.matching(HookKind::BeforeEach, &[]).is_empty());
    }

    #[test]
    fn collected_hooks_keep_registration_order_across_depths() {
        let mut tree = HookTree::new();
        tree.register(HookKind::AfterEach, &path(&["s"]), "first-nested");
        tree.register(HookKind::AfterEach, &[], "second-root");
        tree.register(HookKind::AfterEach, &path(&["s"]), "third-nested");
        assert_eq!(
            tree.matching(HookKind::AfterEach, &path(&["s"])),
            vec![&"first-nested", &"second-root", &"third-nested"]
        );
    }

    #[test]
    fn kinds_are_separate() {
        let mut tree = HookTree::new();
        tree.register(HookKind::BeforeEach, &[], 1);
        tree.register(HookKind::AfterEach, &[], 2);
        assert_eq!(tree.matching(HookKind::BeforeEach, &[]), vec![&1]);
        assert_eq!(tree.matching(HookKind::AfterEach, &[]), vec![&2]);
        assert!(!tree.is_empty());
    }
}
