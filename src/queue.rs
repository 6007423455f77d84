use std::collections::VecDeque;

/// Bytes waiting to be written to one endpoint, in transmission order.
///
/// The front buffer may be partially written; `offset` tracks how much of it
/// has already gone out.
#[derive(Debug, Default)]
pub struct WriteQueue {
    chunks: VecDeque<Vec<u8>>,
    offset: usize,
    len: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Unwritten remainder of the front buffer.
    pub fn front(&self) -> Option<&[u8]> {
        self.chunks.front().map(|chunk| &chunk[self.offset..])
    }

    /// Marks `n` bytes of the front buffer as written. Returns `true` when the
    /// front buffer was completed and removed.
    pub fn consume(&mut self, n: usize) -> bool {
        let Some(front) = self.chunks.front() else {
            return false;
        };
        let n = n.min(front.len() - self.offset);
        self.offset += n;
        self.len -= n;
        if self.offset == front.len() {
            self.chunks.pop_front();
            self.offset = 0;
            true
        } else {
            false
        }
    }

    /// Total bytes still queued.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chunks_are_ignored() {
        let mut queue = WriteQueue::new();
        queue.push(Vec::new());
        assert!(queue.is_empty());
        assert_eq!(queue.front(), None);
    }

    #[test]
    fn partial_consumption_keeps_remainder_at_head() {
        let mut queue = WriteQueue::new();
        queue.push(b"hello".to_vec());
        queue.push(b" world".to_vec());
        assert_eq!(queue.len(), 11);

        assert!(!queue.consume(2));
        assert_eq!(queue.front(), Some(&b"llo"[..]));
        assert_eq!(queue.len(), 9);

        assert!(queue.consume(3));
        assert_eq!(queue.front(), Some(&b" world"[..]));
        assert_eq!(queue.len(), 6);

        assert!(queue.consume(6));
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn over_consumption_is_clamped_to_front() {
        let mut queue = WriteQueue::new();
        queue.push(vec![1, 2, 3]);
        queue.push(vec![4]);
        assert!(queue.consume(10));
        assert_eq!(queue.front(), Some(&[4u8][..]));
        assert_eq!(queue.len(), 1);
        assert!(!WriteQueue::new().consume(1));
    }
}
