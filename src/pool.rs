// ============================================================================
// BUFFER POOL — leased offscreen render targets
// ============================================================================
//
// Free buffers are bucketed by the canonical `BufferConfig::key()`.  Acquire
// pops a free buffer from the matching bucket (resizing it if dimensions
// drifted) and only allocates when the bucket is empty.  The pool grows on
// demand and never shrinks; steady-state rendering allocates nothing.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::backend::{BackendError, BufferConfig, BufferId, RenderBackend};

struct PoolEntry {
    id: BufferId,
    config: BufferConfig,
}

#[derive(Default)]
pub struct BufferPool {
    free: HashMap<String, Vec<PoolEntry>>,
    leased: HashMap<BufferId, PoolEntry>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease a buffer of the given size and configuration.
    pub fn acquire(
        &mut self,
        backend: &mut dyn RenderBackend,
        width: u32,
        height: u32,
        config: &BufferConfig,
    ) -> Result<BufferId, BackendError> {
        let key = config.key();
        if let Some(entry) = self.free.get_mut(&key).and_then(Vec::pop) {
            if backend.buffer_size(entry.id) != Some((width, height)) {
                backend.resize_buffer(entry.id, width, height)?;
            }
            trace!(id = entry.id.0, key = %key, "pool hit");
            let id = entry.id;
            self.leased.insert(id, entry);
            return Ok(id);
        }

        let id = backend.create_buffer(width, height, config)?;
        debug!(id = id.0, width, height, key = %key, "pool grew");
        self.leased.insert(
            id,
            PoolEntry {
                id,
                config: *config,
            },
        );
        Ok(id)
    }

    /// Return a leased buffer to its bucket.  Releasing a buffer that is not
    /// currently leased is a no-op.
    pub fn release(&mut self, buffer: BufferId) {
        if let Some(entry) = self.leased.remove(&buffer) {
            self.free.entry(entry.config.key()).or_default().push(entry);
        }
    }

    pub fn leased_count(&self) -> usize {
        self.leased.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    /// Destroy everything the pool owns, leased or free.
    pub fn dispose_all(&mut self, backend: &mut dyn RenderBackend) {
        for (_, entry) in self.leased.drain() {
            backend.destroy_buffer(entry.id);
        }
        for (_, bucket) in self.free.drain() {
            for entry in bucket {
                backend.destroy_buffer(entry.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::backend::{Filtering, PixelFormat};

    #[test]
    fn release_then_acquire_reuses_the_buffer() {
        let mut backend = SoftwareBackend::new();
        let mut pool = BufferPool::new();
        let config = BufferConfig::default();

        let a = pool.acquire(&mut backend, 8, 8, &config).unwrap();
        pool.release(a);
        let b = pool.acquire(&mut backend, 8, 8, &config).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.leased_count(), 1);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn different_configs_never_share_buckets() {
        let mut backend = SoftwareBackend::new();
        let mut pool = BufferPool::new();
        let linear = BufferConfig::default();
        let nearest = BufferConfig {
            filtering: Filtering::Nearest,
            ..BufferConfig::default()
        };

        let a = pool.acquire(&mut backend, 8, 8, &linear).unwrap();
        pool.release(a);
        let b = pool.acquire(&mut backend, 8, 8, &nearest).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn reused_buffer_is_resized_on_dimension_change() {
        let mut backend = SoftwareBackend::new();
        let mut pool = BufferPool::new();
        let config = BufferConfig::default();

        let a = pool.acquire(&mut backend, 8, 8, &config).unwrap();
        pool.release(a);
        let b = pool.acquire(&mut backend, 32, 16, &config).unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.buffer_size(b), Some((32, 16)));
    }

    #[test]
    fn double_release_is_a_noop() {
        let mut backend = SoftwareBackend::new();
        let mut pool = BufferPool::new();
        let config = BufferConfig::default();

        let a = pool.acquire(&mut backend, 8, 8, &config).unwrap();
        pool.release(a);
        pool.release(a);
        assert_eq!(pool.free_count(), 1);

        // A second acquire must not hand out the same buffer twice.
        let b = pool.acquire(&mut backend, 8, 8, &config).unwrap();
        let c = pool.acquire(&mut backend, 8, 8, &config).unwrap();
        assert_eq!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn concurrent_leases_grow_the_pool() {
        let mut backend = SoftwareBackend::new();
        let mut pool = BufferPool::new();
        let config = BufferConfig {
            format: PixelFormat::Rgba16F,
            ..BufferConfig::default()
        };

        let a = pool.acquire(&mut backend, 8, 8, &config).unwrap();
        let b = pool.acquire(&mut backend, 8, 8, &config).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.leased_count(), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn dispose_all_destroys_backend_buffers() {
        let mut backend = SoftwareBackend::new();
        let mut pool = BufferPool::new();
        let config = BufferConfig::default();

        let a = pool.acquire(&mut backend, 8, 8, &config).unwrap();
        let b = pool.acquire(&mut backend, 8, 8, &config).unwrap();
        pool.release(b);
        pool.dispose_all(&mut backend);

        assert_eq!(pool.leased_count(), 0);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(backend.buffer_size(a), None);
        assert_eq!(backend.buffer_size(b), None);
    }
}
