use parking_lot::Mutex;

/// Thread-safe free list of byte buffers reused for envelope serialization
/// on the hot paths. Buffers are cleared on checkout; capacity is retained.
#[derive(Debug)]
pub(crate) struct BufferPool {
  buffers: Mutex<Vec<Vec<u8>>>,
  max_pooled: usize,
}

impl BufferPool {
  pub(crate) fn new(max_pooled: usize) -> Self {
    return Self {
      buffers: Mutex::new(Vec::new()),
      max_pooled,
    };
  }

  pub(crate) fn get(&self) -> Vec<u8> {
    let mut buf = self.buffers.lock().pop().unwrap_or_default();
    buf.clear();
    return buf;
  }

  pub(crate) fn put(&self, buf: Vec<u8>) {
    let mut buffers = self.buffers.lock();
    if buffers.len() < self.max_pooled {
      buffers.push(buf);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_buffers_are_reset_on_checkout() {
    let pool = BufferPool::new(4);

    let mut buf = pool.get();
    buf.extend_from_slice(b"stale content");
    let capacity = buf.capacity();
    pool.put(buf);

    let buf = pool.get();
    assert!(buf.is_empty());
    assert_eq!(buf.capacity(), capacity);
  }

  #[test]
  fn test_pool_is_bounded() {
    let pool = BufferPool::new(2);
    for _ in 0..8 {
      pool.put(Vec::with_capacity(16));
    }
    assert_eq!(pool.buffers.lock().len(), 2);
  }
}
