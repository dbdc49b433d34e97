//! buffer pool for the per-session relay buffers
//!
//! wraps the `poule` crate so the rest of the code only manipulates
//! checkouts; the pool starts small and doubles its capacity as sessions
//! pile up, until it reaches its configured maximum

use std::ops;

use crate::buffer::Buffer;

pub struct Pool {
    pub inner: poule::Pool<Buffer>,
    pub buffer_size: usize,
}

impl Pool {
    pub fn with_capacity(initial: usize, maximum: usize, buffer_size: usize) -> Pool {
        let mut inner = poule::Pool::with_capacity(maximum);
        inner.grow_to(std::cmp::max(initial, 1));
        Pool { inner, buffer_size }
    }

    pub fn checkout(&mut self) -> Option<Checkout> {
        if self.inner.used() == self.inner.capacity()
            && self.inner.capacity() < self.inner.maximum_capacity()
        {
            let next = std::cmp::min(self.inner.capacity() * 2, self.inner.maximum_capacity());
            debug!(
                "growing pool capacity from {} to {}",
                self.inner.capacity(),
                next
            );
            self.inner.grow_to(next);
        }

        let capacity = self.buffer_size;
        self.inner
            .checkout(|| {
                trace!("initializing a buffer with capacity {}", capacity);
                Buffer::with_capacity(capacity)
            })
            .map(|c| Checkout { inner: c })
    }
}

pub struct Checkout {
    pub inner: poule::Checkout<Buffer>,
}

impl ops::Deref for Checkout {
    type Target = Buffer;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl ops::DerefMut for Checkout {
    fn deref_mut(&mut self) -> &mut Buffer {
        &mut self.inner
    }
}
