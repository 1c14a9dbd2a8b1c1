/// Intrusive links stored inside each arena entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Links {
    prev: Option<u32>,
    next: Option<u32>,
    linked: bool,
}

impl Links {
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

/// Arena entries that can sit on a [`HandleQueue`].
pub trait Linked {
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
}

/// Insertion-ordered doubly linked list threaded through an arena.
///
/// The queue owns nothing: it only stores the head/tail indices, the links
/// live in the entries. Insert and remove are O(1); an entry sits on at most
/// one queue at a time.
#[derive(Debug, Default)]
pub struct HandleQueue {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl HandleQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<u32> {
        self.head
    }

    pub fn push_back<T: Linked>(&mut self, arena: &mut [T], index: u32) {
        let links = arena[index as usize].links_mut();
        debug_assert!(!links.linked, "entry {index} is already queued");
        *links = Links {
            prev: self.tail,
            next: None,
            linked: true,
        };
        match self.tail {
            Some(tail) => arena[tail as usize].links_mut().next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    pub fn remove<T: Linked>(&mut self, arena: &mut [T], index: u32) {
        let links = *arena[index as usize].links();
        debug_assert!(links.linked, "entry {index} is not queued");
        match links.prev {
            Some(prev) => arena[prev as usize].links_mut().next = links.next,
            None => self.head = links.next,
        }
        match links.next {
            Some(next) => arena[next as usize].links_mut().prev = links.prev,
            None => self.tail = links.prev,
        }
        *arena[index as usize].links_mut() = Links::default();
        self.len -= 1;
    }

    pub fn pop_front<T: Linked>(&mut self, arena: &mut [T]) -> Option<u32> {
        let head = self.head?;
        self.remove(arena, head);
        Some(head)
    }

    /// Walk the queue from oldest to newest.
    pub fn iter<'a, T: Linked>(&self, arena: &'a [T]) -> QueueIter<'a, T> {
        QueueIter {
            arena,
            cursor: self.head,
        }
    }
}

pub struct QueueIter<'a, T> {
    arena: &'a [T],
    cursor: Option<u32>,
}

impl<'a, T: Linked> Iterator for QueueIter<'a, T> {
    type Item = (u32, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let entry = &self.arena[index as usize];
        self.cursor = entry.links().next;
        Some((index, entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Entry {
        links: Links,
    }

    impl Linked for Entry {
        fn links(&self) -> &Links {
            &self.links
        }

        fn links_mut(&mut self) -> &mut Links {
            &mut self.links
        }
    }

    fn arena(n: usize) -> Vec<Entry> {
        (0..n).map(|_| Entry::default()).collect()
    }

    fn order(queue: &HandleQueue, arena: &[Entry]) -> Vec<u32> {
        queue.iter(arena).map(|(i, _)| i).collect()
    }

    #[test]
    fn keeps_insertion_order() {
        let mut entries = arena(4);
        let mut queue = HandleQueue::new();
        for i in [2, 0, 3, 1] {
            queue.push_back(&mut entries, i);
        }
        assert_eq!(order(&queue, &entries), vec![2, 0, 3, 1]);
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn removes_from_head_middle_and_tail() {
        let mut entries = arena(5);
        let mut queue = HandleQueue::new();
        for i in 0..5 {
            queue.push_back(&mut entries, i);
        }
        queue.remove(&mut entries, 2);
        assert_eq!(order(&queue, &entries), vec![0, 1, 3, 4]);
        queue.remove(&mut entries, 0);
        assert_eq!(order(&queue, &entries), vec![1, 3, 4]);
        queue.remove(&mut entries, 4);
        assert_eq!(order(&queue, &entries), vec![1, 3]);
        assert!(!entries[2].links.is_linked());

        // removed entries can be queued again, at the back
        queue.push_back(&mut entries, 2);
        assert_eq!(order(&queue, &entries), vec![1, 3, 2]);
    }

    #[test]
    fn pop_front_drains_oldest_first() {
        let mut entries = arena(3);
        let mut queue = HandleQueue::new();
        for i in 0..3 {
            queue.push_back(&mut entries, i);
        }
        assert_eq!(queue.pop_front(&mut entries), Some(0));
        assert_eq!(queue.pop_front(&mut entries), Some(1));
        assert_eq!(queue.pop_front(&mut entries), Some(2));
        assert_eq!(queue.pop_front(&mut entries), None);
        assert!(queue.is_empty());
        assert_eq!(queue.front(), None);
    }
}
