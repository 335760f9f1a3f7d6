//! Intrusive doubly-linked lists threaded through the node arena.
//!
//! Every list is anchored by a sentinel node; membership is circular, so
//! "linked" is observable as `node.next != node` without any side table.
//! All operations are O(1).

use crate::arena::{NodeArena, NodeKey};

fn link<C>(arena: &mut NodeArena<C>, a: NodeKey, b: NodeKey) {
    if let Some(node) = arena.get_mut(a) {
        node.next = b;
    }
    if let Some(node) = arena.get_mut(b) {
        node.prev = a;
    }
}

/// Reset a node's links to itself, the detached state.
pub(crate) fn init<C>(arena: &mut NodeArena<C>, key: NodeKey) {
    if let Some(node) = arena.get_mut(key) {
        node.prev = key;
        node.next = key;
    }
}

#[inline]
pub(crate) fn is_linked<C>(arena: &NodeArena<C>, key: NodeKey) -> bool {
    arena.get(key).is_some_and(|node| node.next != key)
}

#[inline]
pub(crate) fn is_empty<C>(arena: &NodeArena<C>, sentinel: NodeKey) -> bool {
    !is_linked(arena, sentinel)
}

/// First item after the sentinel, without removing it.
pub(crate) fn peek<C>(arena: &NodeArena<C>, sentinel: NodeKey) -> Option<NodeKey> {
    let next = arena.get(sentinel)?.next;
    if next == sentinel { None } else { Some(next) }
}

/// Append before the sentinel (list tail). Detaches the node from any
/// list it is currently on, so an item is never linked twice.
pub(crate) fn append<C>(arena: &mut NodeArena<C>, sentinel: NodeKey, key: NodeKey) {
    if is_linked(arena, key) {
        remove(arena, key);
    }
    let Some(tail) = arena.get(sentinel).map(|node| node.prev) else {
        return;
    };
    link(arena, tail, key);
    link(arena, key, sentinel);
}

/// Splice out and re-enter the detached state. Idempotent.
pub(crate) fn remove<C>(arena: &mut NodeArena<C>, key: NodeKey) {
    let Some(node) = arena.get(key) else { return };
    let (prev, next) = (node.prev, node.next);
    link(arena, prev, next);
    init(arena, key);
}

/// Remove and return the item after the sentinel, or `None` if empty.
pub(crate) fn shift<C>(arena: &mut NodeArena<C>, sentinel: NodeKey) -> Option<NodeKey> {
    let head = peek(arena, sentinel)?;
    remove(arena, head);
    Some(head)
}

/// Move every item of `from` onto the tail of `to`, preserving order.
pub(crate) fn take_all<C>(arena: &mut NodeArena<C>, from: NodeKey, to: NodeKey) {
    let Some(node) = arena.get(from) else { return };
    let (first, last) = (node.next, node.prev);
    if first == from {
        return;
    }
    init(arena, from);

    let Some(tail) = arena.get(to).map(|node| node.prev) else {
        return;
    };
    link(arena, tail, first);
    link(arena, last, to);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::NodeKind;

    fn arena_with_sentinel() -> (NodeArena<()>, NodeKey) {
        let mut arena = NodeArena::new();
        let sentinel = arena.alloc(NodeKind::Sentinel);
        (arena, sentinel)
    }

    fn items<C>(arena: &mut NodeArena<C>, n: usize) -> Vec<NodeKey> {
        (0..n).map(|_| arena.alloc(NodeKind::Sentinel)).collect()
    }

    fn drain<C>(arena: &mut NodeArena<C>, sentinel: NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        while let Some(key) = shift(arena, sentinel) {
            out.push(key);
        }
        out
    }

    #[test]
    fn append_preserves_fifo_order() {
        let (mut arena, sentinel) = arena_with_sentinel();
        let keys = items(&mut arena, 3);
        for &key in &keys {
            append(&mut arena, sentinel, key);
        }

        assert_eq!(peek(&arena, sentinel), Some(keys[0]));
        assert_eq!(drain(&mut arena, sentinel), keys);
        assert!(is_empty(&arena, sentinel));
    }

    #[test]
    fn remove_from_middle() {
        let (mut arena, sentinel) = arena_with_sentinel();
        let keys = items(&mut arena, 3);
        for &key in &keys {
            append(&mut arena, sentinel, key);
        }

        remove(&mut arena, keys[1]);
        assert!(!is_linked(&arena, keys[1]));
        assert_eq!(drain(&mut arena, sentinel), vec![keys[0], keys[2]]);
    }

    #[test]
    fn remove_is_idempotent() {
        let (mut arena, sentinel) = arena_with_sentinel();
        let keys = items(&mut arena, 2);
        append(&mut arena, sentinel, keys[0]);
        append(&mut arena, sentinel, keys[1]);

        remove(&mut arena, keys[0]);
        remove(&mut arena, keys[0]);
        assert_eq!(drain(&mut arena, sentinel), vec![keys[1]]);
    }

    #[test]
    fn append_detaches_first() {
        let (mut arena, a) = arena_with_sentinel();
        let b = arena.alloc(NodeKind::Sentinel);
        let item = arena.alloc(NodeKind::Sentinel);

        append(&mut arena, a, item);
        append(&mut arena, b, item);

        assert!(is_empty(&arena, a));
        assert_eq!(peek(&arena, b), Some(item));
    }

    #[test]
    fn reappend_moves_to_tail() {
        let (mut arena, sentinel) = arena_with_sentinel();
        let keys = items(&mut arena, 3);
        for &key in &keys {
            append(&mut arena, sentinel, key);
        }

        append(&mut arena, sentinel, keys[0]);
        assert_eq!(drain(&mut arena, sentinel), vec![keys[1], keys[2], keys[0]]);
    }

    #[test]
    fn shift_on_empty_returns_none() {
        let (mut arena, sentinel) = arena_with_sentinel();
        assert_eq!(shift(&mut arena, sentinel), None);
        assert_eq!(peek(&arena, sentinel), None);
    }

    #[test]
    fn take_all_appends_in_order() {
        let (mut arena, from) = arena_with_sentinel();
        let to = arena.alloc(NodeKind::Sentinel);
        let old = items(&mut arena, 2);
        let new = items(&mut arena, 2);
        for &key in &old {
            append(&mut arena, to, key);
        }
        for &key in &new {
            append(&mut arena, from, key);
        }

        take_all(&mut arena, from, to);
        assert!(is_empty(&arena, from));
        assert_eq!(drain(&mut arena, to), vec![old[0], old[1], new[0], new[1]]);
    }

    #[test]
    fn take_all_from_empty_is_noop() {
        let (mut arena, from) = arena_with_sentinel();
        let to = arena.alloc(NodeKind::Sentinel);
        let item = arena.alloc(NodeKind::Sentinel);
        append(&mut arena, to, item);

        take_all(&mut arena, from, to);
        assert_eq!(drain(&mut arena, to), vec![item]);
    }
}
