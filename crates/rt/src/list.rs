//! Intrusive singly linked FIFO used by every kernel queue.
//!
//! Items carry their own `next` link, so queueing never allocates. Callers
//! mutate a `Fifo` from one core only, inside a critical section.

use core::cell::Cell;
use core::iter;
use core::ptr::NonNull;

pub(crate) type Link<T> = Cell<Option<NonNull<T>>>;

/// An item that can be linked in a [`Fifo`].
pub(crate) trait Linked: Sized {
    fn link(&self) -> &Link<Self>;
}

pub(crate) struct Fifo<T: Linked> {
    first: Link<T>,
    last: Link<T>,
}

impl<T: Linked> Fifo<T> {
    pub(crate) const fn new() -> Self {
        Self {
            first: Cell::new(None),
            last: Cell::new(None),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.first.get().is_none()
    }

    pub(crate) fn first(&self) -> Option<NonNull<T>> {
        self.first.get()
    }

    pub(crate) fn last(&self) -> Option<NonNull<T>> {
        self.last.get()
    }

    /// Appends `item` at the tail.
    ///
    /// # Safety
    ///
    /// `item` must not be linked in any list, and must stay valid and unmoved
    /// until it is popped or removed.
    pub(crate) unsafe fn push_back(&self, item: &T) {
        item.link().set(None);
        let ptr = NonNull::from(item);
        match self.last.get() {
            Some(last) => last.as_ref().link().set(Some(ptr)),
            None => self.first.set(Some(ptr)),
        }
        self.last.set(Some(ptr));
    }

    pub(crate) fn pop_front(&self) -> Option<NonNull<T>> {
        let head = self.first.get()?;
        // SAFETY: linked items are valid until unlinked.
        let next = unsafe { head.as_ref() }.link().replace(None);
        self.first.set(next);
        if next.is_none() {
            self.last.set(None);
        }
        Some(head)
    }

    /// Unlinks `item` wherever it sits. Returns `false` if it was not linked here.
    pub(crate) fn remove(&self, item: &T) -> bool {
        let target = NonNull::from(item);
        let mut prev: Option<NonNull<T>> = None;
        let mut cursor = self.first.get();

        while let Some(node) = cursor {
            // SAFETY: linked items are valid until unlinked.
            let next = unsafe { node.as_ref() }.link().get();
            if node == target {
                match prev {
                    Some(p) => unsafe { p.as_ref() }.link().set(next),
                    None => self.first.set(next),
                }
                if self.last.get() == Some(target) {
                    self.last.set(prev);
                }
                item.link().set(None);
                return true;
            }
            prev = cursor;
            cursor = next;
        }
        false
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = NonNull<T>> + '_ {
        // SAFETY: linked items are valid until unlinked.
        iter::successors(self.first.get(), |node| unsafe { node.as_ref() }.link().get())
    }

    pub(crate) fn len(&self) -> usize {
        self.iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        id: u32,
        next: Link<Node>,
    }

    impl Node {
        fn new(id: u32) -> Self {
            Self { id, next: Cell::new(None) }
        }
    }

    impl Linked for Node {
        fn link(&self) -> &Link<Self> {
            &self.next
        }
    }

    fn ids(fifo: &Fifo<Node>) -> Vec<u32> {
        fifo.iter().map(|n| unsafe { n.as_ref() }.id).collect()
    }

    #[test]
    fn fifo_order() {
        let (a, b, c) = (Node::new(1), Node::new(2), Node::new(3));
        let fifo = Fifo::new();
        unsafe {
            fifo.push_back(&a);
            fifo.push_back(&b);
            fifo.push_back(&c);
        }
        assert_eq!(ids(&fifo), [1, 2, 3]);
        assert_eq!(fifo.pop_front(), Some(NonNull::from(&a)));
        assert_eq!(ids(&fifo), [2, 3]);
        assert_eq!(fifo.len(), 2);
    }

    #[test]
    fn pop_last_resets_tail() {
        let a = Node::new(1);
        let fifo = Fifo::new();
        unsafe { fifo.push_back(&a) };
        assert!(fifo.pop_front().is_some());
        assert!(fifo.is_empty());
        assert!(fifo.last().is_none());

        let b = Node::new(2);
        unsafe { fifo.push_back(&b) };
        assert_eq!(fifo.first(), Some(NonNull::from(&b)));
        assert_eq!(fifo.last(), Some(NonNull::from(&b)));
    }

    #[test]
    fn remove_middle_and_tail() {
        let (a, b, c) = (Node::new(1), Node::new(2), Node::new(3));
        let fifo = Fifo::new();
        unsafe {
            fifo.push_back(&a);
            fifo.push_back(&b);
            fifo.push_back(&c);
        }
        assert!(fifo.remove(&b));
        assert_eq!(ids(&fifo), [1, 3]);
        assert!(fifo.remove(&c));
        assert_eq!(fifo.last(), Some(NonNull::from(&a)));
        assert!(!fifo.remove(&c));

        let d = Node::new(4);
        unsafe { fifo.push_back(&d) };
        assert_eq!(ids(&fifo), [1, 4]);
    }
}
