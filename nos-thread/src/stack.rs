//! Kernel stacks and the stack reuse pool

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use nos_api::sync::{AtomicU64, Mutex, Ordering};
use nos_api::{KernelError, Result};

/// Stack a thread runs on.
///
/// Stacks allocated by the core are owned and go back to the pool when the
/// thread is reclaimed. Stacks supplied by the creator are only described
/// here and are never freed by the core.
pub struct KernelStack {
    memory: StackMemory,
}

enum StackMemory {
    Owned(Box<[u8]>),
    Supplied { base: usize, size: usize },
}

impl KernelStack {
    /// Describes a stack the caller allocated and keeps ownership of
    pub fn supplied(base: usize, size: usize) -> Self {
        Self {
            memory: StackMemory::Supplied { base, size },
        }
    }

    fn owned(memory: Box<[u8]>) -> Self {
        Self {
            memory: StackMemory::Owned(memory),
        }
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        match &self.memory {
            StackMemory::Owned(memory) => memory.len(),
            StackMemory::Supplied { size, .. } => *size,
        }
    }

    /// Lowest address of the stack
    pub fn base(&self) -> usize {
        match &self.memory {
            StackMemory::Owned(memory) => memory.as_ptr() as usize,
            StackMemory::Supplied { base, .. } => *base,
        }
    }

    /// Initial stack pointer (stacks grow down)
    pub fn top(&self) -> usize {
        self.base() + self.size()
    }

    /// Returns true when the core allocated the stack and must free it
    pub fn is_owned(&self) -> bool {
        matches!(self.memory, StackMemory::Owned(_))
    }
}

impl fmt::Debug for KernelStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelStack")
            .field("base", &self.base())
            .field("size", &self.size())
            .field("owned", &self.is_owned())
            .finish()
    }
}

/// Counters kept by the stack pool
#[derive(Debug, Default)]
pub(crate) struct StackCounters {
    pub(crate) allocated: AtomicU64,
    pub(crate) reused: AtomicU64,
    pub(crate) released: AtomicU64,
}

/// Thread stack pool for efficient allocation.
/// Reuses freed default-size stacks to reduce allocation churn.
pub(crate) struct StackPool {
    free: Mutex<Vec<Box<[u8]>>>,
    pooled_size: usize,
    limit: usize,
    pub(crate) counters: StackCounters,
}

impl StackPool {
    pub(crate) fn new(pooled_size: usize, limit: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            pooled_size,
            limit,
            counters: StackCounters::default(),
        }
    }

    /// Get a stack from the pool or allocate a new one
    pub(crate) fn allocate(&self, size: usize) -> Result<KernelStack> {
        if size == self.pooled_size {
            if let Some(memory) = self.free.lock().pop() {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(KernelStack::owned(memory));
            }
        }

        let mut memory = Vec::new();
        memory
            .try_reserve_exact(size)
            .map_err(|_| KernelError::NoResources)?;
        memory.resize(size, 0u8);
        self.counters.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(KernelStack::owned(memory.into_boxed_slice()))
    }

    /// Return a stack to the pool for reuse
    pub(crate) fn release(&self, stack: KernelStack) {
        let StackMemory::Owned(memory) = stack.memory else {
            return;
        };
        self.counters.released.fetch_add(1, Ordering::Relaxed);

        if memory.len() != self.pooled_size {
            return;
        }
        let mut pool = self.free.lock();
        // Limit pool size to prevent unbounded growth
        if pool.len() < self.limit {
            pool.push(memory);
        }
    }

    pub(crate) fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}
