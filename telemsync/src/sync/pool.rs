use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("handle pool needs at least one handle")]
    Empty,
    #[error("handle pool is closed")]
    Closed,
    #[error("handle pool lost track of a checked-out handle")]
    Exhausted,
}

pub struct HandlePool<H> {
    // Only touched while holding a permit, so acquire always finds a handle.
    free: Mutex<Vec<H>>,
    available: Semaphore,
    size: usize,
}

impl<H> HandlePool<H> {
    pub fn new(handles: Vec<H>) -> Result<Self, PoolError> {
        if handles.is_empty() {
            return Err(PoolError::Empty);
        }
        let size = handles.len();
        Ok(Self {
            free: Mutex::new(handles),
            available: Semaphore::new(size),
            size,
        })
    }

    pub fn from_fn(size: usize, make: impl FnMut() -> H) -> Result<Self, PoolError> {
        Self::new(std::iter::repeat_with(make).take(size).collect())
    }

    pub async fn acquire(&self) -> Result<PooledHandle<'_, H>, PoolError> {
        let permit = self
            .available
            .acquire()
            .await
            .map_err(|_| PoolError::Closed)?;
        let handle = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(PoolError::Exhausted)?;
        Ok(PooledHandle {
            handle: Some(handle),
            pool: self,
            _permit: permit,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.available.available_permits()
    }
}

pub struct PooledHandle<'a, H> {
    handle: Option<H>,
    pool: &'a HandlePool<H>,
    // Dropped after `Drop::drop` has put the handle back.
    _permit: SemaphorePermit<'a>,
}

impl<H> Deref for PooledHandle<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        self.handle.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<H> DerefMut for PooledHandle<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        self.handle.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<H> Drop for PooledHandle<'_, H> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }
    }
}
