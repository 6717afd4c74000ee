//! Connection records and the intrusive list that links them.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Weak;
use std::sync::atomic::{self, AtomicBool, AtomicUsize, Ordering};

use block_pool::BlockPool;
use smallvec::SmallVec;

use crate::{DelegateKey, Endpoint, RawDelegate};

/// Storage for every connection record in the process. Records are small, short-lived and
/// created on every connect, so they come from a shared lock-free pool instead of the heap.
static CONNECTIONS: BlockPool<ConnectionNode> = BlockPool::new();

/// Nodes removed from a list in one operation. Almost always a single node.
pub(crate) type Removed = SmallVec<[NodeRef; 2]>;

/// One record in a connection list.
///
/// A forward record lives in the publisher's list and carries the delegate to invoke. A mirror
/// record lives in the subscriber's list, has no delegate and only exists so the subscriber can
/// tell the publisher to forget it.
pub(crate) struct ConnectionNode {
    key: DelegateKey,

    delegate: Option<RawDelegate>,

    /// The list owner on the other side of a mirrored connection.
    counterpart: Option<Weak<dyn Endpoint>>,

    /// Only accessed while holding the lock of the list that contains this node.
    next: UnsafeCell<Option<NodeRef>>,

    /// Cleared when the node is removed from its list. Dispatch from a snapshot checks this
    /// before invoking, so a removed connection is never invoked after its removal.
    live: AtomicBool,

    refs: AtomicUsize,
}

// SAFETY: A node only ever links list owners that use the same lock policy. For thread-safe
// policies, receivers are Send + Sync (enforced by `Bindable`), the counterpart is a
// thread-safe list owner and `next` is guarded by the owner's lock. For NoLock, the list owners
// are !Send and !Sync, so their nodes never leave the owning thread.
unsafe impl Send for ConnectionNode {}

// SAFETY: See above. Shared access only reads immutable fields and atomics, `next` is guarded.
unsafe impl Sync for ConnectionNode {}

impl ConnectionNode {
    pub(crate) fn key(&self) -> DelegateKey {
        self.key
    }

    pub(crate) fn delegate(&self) -> Option<&RawDelegate> {
        self.delegate.as_ref()
    }

    pub(crate) fn counterpart(&self) -> Option<&Weak<dyn Endpoint>> {
        self.counterpart.as_ref()
    }

    /// Identity of the counterpart, comparable with [`Endpoint::id()`] of a live list owner.
    pub(crate) fn counterpart_id(&self) -> Option<usize> {
        self.counterpart
            .as_ref()
            .map(|counterpart| counterpart.as_ptr().cast::<()>().addr())
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.live.store(false, Ordering::Release);
    }

    fn next_ptr(&self) -> *mut Option<NodeRef> {
        self.next.get()
    }
}

impl fmt::Debug for ConnectionNode {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionNode")
            .field("key", &self.key)
            .field("mirror", &self.delegate.is_none())
            .field("counterpart", &self.counterpart_id())
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

/// Counted reference to a pooled [`ConnectionNode`]. The node goes back to the pool when the
/// last reference is dropped.
///
/// Normally the owning list holds the only reference. Dispatch snapshots and removal take extra
/// references so a node stays valid after it leaves its list.
pub(crate) struct NodeRef {
    node: NonNull<ConnectionNode>,
}

// SAFETY: Same reasoning as for ConnectionNode, the reference count itself is atomic.
unsafe impl Send for NodeRef {}

// SAFETY: Same reasoning as for ConnectionNode, the reference count itself is atomic.
unsafe impl Sync for NodeRef {}

impl NodeRef {
    /// Creates a forward record that invokes `delegate`.
    pub(crate) fn forward(delegate: RawDelegate, counterpart: Option<Weak<dyn Endpoint>>) -> Self {
        Self::new(delegate.key(), Some(delegate), counterpart)
    }

    /// Creates a mirror record pointing back at the publisher.
    pub(crate) fn mirror(key: DelegateKey, publisher: Weak<dyn Endpoint>) -> Self {
        Self::new(key, None, Some(publisher))
    }

    fn new(
        key: DelegateKey,
        delegate: Option<RawDelegate>,
        counterpart: Option<Weak<dyn Endpoint>>,
    ) -> Self {
        let node = CONNECTIONS.allocate();

        // SAFETY: Freshly allocated pool storage is valid for writes and not yet shared.
        unsafe {
            node.write(ConnectionNode {
                key,
                delegate,
                counterpart,
                next: UnsafeCell::new(None),
                live: AtomicBool::new(true),
                refs: AtomicUsize::new(1),
            });
        }

        Self { node }
    }
}

impl Deref for NodeRef {
    type Target = ConnectionNode;

    fn deref(&self) -> &ConnectionNode {
        // SAFETY: The node stays initialized for as long as any reference to it exists.
        unsafe { self.node.as_ref() }
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        // Relaxed is enough for an increment, as with `Arc`: the new reference is derived from
        // an existing one, which already keeps the node alive.
        self.refs.fetch_add(1, Ordering::Relaxed);

        Self { node: self.node }
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        if self.refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }

        // Synchronizes with the Release decrements of every other reference holder.
        atomic::fence(Ordering::Acquire);

        // Unlinking from a list always takes `next`, so dropping the node can never recurse
        // down a chain.
        debug_assert!(
            // SAFETY: We hold the last reference, nobody else can touch the node.
            unsafe { (*self.next_ptr()).is_none() }
        );

        // SAFETY: We hold the last reference, so the node is initialized and unshared. After
        // dropping it in place, the storage goes back to the pool it came from, exactly once.
        unsafe {
            self.node.drop_in_place();
            CONNECTIONS.release(self.node);
        }
    }
}

impl fmt::Debug for NodeRef {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Singly linked list of connection records, in connection order.
///
/// The list does no locking of its own. Its owner grants `&mut` access only while holding its
/// lock, and `&` access (for iteration) likewise.
#[derive(Default)]
pub(crate) struct ConnectionList {
    head: Option<NodeRef>,
    tail: Option<NonNull<ConnectionNode>>,
    len: usize,
}

impl ConnectionList {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Appends `node`, so handlers fire in the order they were connected.
    pub(crate) fn push_back(&mut self, node: NodeRef) {
        let ptr = node.node;

        match self.tail {
            // SAFETY: The tail is in this list and we have exclusive access to the list.
            Some(tail) => unsafe { *tail.as_ref().next_ptr() = Some(node) },
            None => self.head = Some(node),
        }

        self.tail = Some(ptr);
        self.len = self
            .len
            .checked_add(1)
            .expect("connection count cannot overflow usize before memory runs out");
    }

    pub(crate) fn pop_front(&mut self) -> Option<NodeRef> {
        let node = self.head.take()?;

        // SAFETY: The node was in this list and we have exclusive access to the list.
        self.head = unsafe { (*node.next_ptr()).take() };

        if self.head.is_none() {
            self.tail = None;
        }

        self.len = self
            .len
            .checked_sub(1)
            .expect("a list with a head has at least one node");
        node.retire();

        Some(node)
    }

    /// Removes every node for which `keep` returns `false`, preserving the order of the rest.
    /// The removed nodes are retired and returned so the caller can drop them (and notify their
    /// counterparts) after releasing the lock.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&ConnectionNode) -> bool) -> Removed {
        let mut removed = Removed::new();
        let mut link: *mut Option<NodeRef> = &raw mut self.head;
        self.tail = None;

        // SAFETY: `link` points either at our head or at the `next` field of a node that is
        // still in this list. Nodes never move, and we have exclusive access to the list.
        while let Some(node) = unsafe { (*link).take() } {
            if keep(&node) {
                let next = node.next_ptr();
                self.tail = Some(node.node);

                // SAFETY: As above, putting the node back where we took it from.
                unsafe { *link = Some(node) };
                link = next;
            } else {
                // SAFETY: As above, splicing the successor into the vacated link.
                unsafe { *link = (*node.next_ptr()).take() };

                node.retire();
                self.len = self
                    .len
                    .checked_sub(1)
                    .expect("every removed node was counted when it was added");
                removed.push(node);
            }
        }

        removed
    }

    /// Iterates over the nodes in order. The iterator reads each successor before yielding the
    /// current node.
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head.as_ref(),
        }
    }
}

impl Drop for ConnectionList {
    fn drop(&mut self) {
        // Iterative, so that long lists do not overflow the stack.
        while self.pop_front().is_some() {}
    }
}

impl fmt::Debug for ConnectionList {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionList")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

pub(crate) struct Iter<'a> {
    next: Option<&'a NodeRef>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a NodeRef;

    fn next(&mut self) -> Option<&'a NodeRef> {
        let current = self.next?;

        // SAFETY: The list owner guarantees nobody modifies links while we hold `&ConnectionList`.
        self.next = unsafe { (*current.next_ptr()).as_ref() };

        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{Delegate, NoLock, ObserverCore};

    fn free_handler(_value: &u32) {}

    fn node(tag: u32) -> NodeRef {
        // The closure is never invoked here, so it does not need to outlive the node.
        let handler = Arc::new(move |_value: &u32| tag);

        NodeRef::forward(
            Delegate::<u32, u32, NoLock>::from_closure(&handler).into_raw(),
            None,
        )
    }

    fn keys(list: &ConnectionList) -> Vec<DelegateKey> {
        list.iter().map(|node| node.key()).collect()
    }

    #[test]
    fn push_back_preserves_order() {
        let mut list = ConnectionList::default();
        let nodes = (0..5).map(node).collect::<Vec<_>>();
        let expected = nodes.iter().map(|node| node.key()).collect::<Vec<_>>();

        for node in nodes {
            list.push_back(node);
        }

        assert_eq!(list.len(), 5);
        assert_eq!(keys(&list), expected);
    }

    #[test]
    fn retain_removes_matches_and_fixes_tail() {
        let mut list = ConnectionList::default();
        let nodes = (0..5).map(node).collect::<Vec<_>>();
        let all = nodes.iter().map(|node| node.key()).collect::<Vec<_>>();

        for node in nodes {
            list.push_back(node);
        }

        // Remove the first, a middle one and the last.
        let doomed = [all[0], all[2], all[4]];
        let removed = list.retain(|node| !doomed.contains(&node.key()));

        assert_eq!(removed.len(), 3);
        assert!(removed.iter().all(|node| !node.is_live()));
        assert_eq!(keys(&list), vec![all[1], all[3]]);
        assert_eq!(list.len(), 2);

        // The tail must point at the new last node, so appending keeps working.
        let appended = node(99);
        let appended_key = appended.key();
        list.push_back(appended);

        assert_eq!(keys(&list), vec![all[1], all[3], appended_key]);
    }

    #[test]
    fn retain_everything_removed_leaves_usable_list() {
        let mut list = ConnectionList::default();
        list.push_back(node(1));
        list.push_back(node(2));

        let removed = list.retain(|_| false);

        assert_eq!(removed.len(), 2);
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);

        list.push_back(node(3));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn pop_front_retires_node() {
        let mut list = ConnectionList::default();
        list.push_back(node(1));

        let popped = list.pop_front().unwrap();

        assert!(!popped.is_live());
        assert!(list.is_empty());
        assert!(list.pop_front().is_none());
    }

    #[test]
    fn snapshot_reference_outlives_list() {
        let mut list = ConnectionList::default();
        list.push_back(node(1));

        let snapshot = list.iter().cloned().collect::<Vec<_>>();
        drop(list);

        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].is_live());
    }

    #[test]
    fn mirror_has_no_delegate() {
        let mirror = NodeRef::mirror(
            Delegate::<u32, (), NoLock>::from_fn(free_handler).key(),
            Weak::<ObserverCore<NoLock>>::new(),
        );

        assert!(mirror.delegate().is_none());
        assert!(mirror.counterpart().is_some());
    }

    #[test]
    fn long_list_drops_without_recursion() {
        let mut list = ConnectionList::default();

        for _ in 0..100_000 {
            list.push_back(NodeRef::forward(
                Delegate::<u32, (), NoLock>::from_fn(free_handler).into_raw(),
                None,
            ));
        }

        drop(list);
    }
}
