use std::sync::{Mutex, OnceLock};

/// Size of one pump read
pub const PUMP_BUFFER_SIZE: usize = 64 * 1024;

const MAX_POOL_SIZE: usize = 256;

/// Pool of tunnel pump buffers.
///
/// Every live tunnel holds two buffers; returning them on teardown keeps the
/// allocator out of the accept path under churn.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    /// Get a zeroed buffer of [`PUMP_BUFFER_SIZE`] bytes
    pub fn get_buffer(&self) -> Vec<u8> {
        let reused = match self.buffers.lock() {
            Ok(mut pool) => pool.pop(),
            Err(_) => None,
        };
        reused.unwrap_or_else(|| vec![0u8; PUMP_BUFFER_SIZE])
    }

    /// Return a buffer for reuse
    pub fn return_buffer(&self, mut buffer: Vec<u8>) {
        // Reject buffers with wrong capacity to avoid memory bloat
        if buffer.capacity() < PUMP_BUFFER_SIZE || buffer.capacity() > PUMP_BUFFER_SIZE * 2 {
            return;
        }

        // Zero on return so tunnel data never leaks between sessions
        buffer.clear();
        buffer.resize(PUMP_BUFFER_SIZE, 0);

        if let Ok(mut pool) = self.buffers.lock() {
            if pool.len() < MAX_POOL_SIZE {
                pool.push(buffer);
            }
        }
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.buffers.lock().map(|pool| pool.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

static BUFFER_POOL: OnceLock<BufferPool> = OnceLock::new();

/// Get or initialize the global buffer pool
pub fn get_buffer_pool() -> &'static BufferPool {
    BUFFER_POOL.get_or_init(BufferPool::new)
}

/// RAII lease that returns the buffer to the global pool on drop
#[derive(Debug)]
pub struct BufferLease {
    buffer: Vec<u8>,
}

impl BufferLease {
    pub fn new() -> Self {
        Self {
            buffer: get_buffer_pool().get_buffer(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }
}

impl Default for BufferLease {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        get_buffer_pool().return_buffer(std::mem::take(&mut self.buffer));
    }
}
