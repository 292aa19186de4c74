//! Fixed-capacity arenas of hardware descriptors.
//!
//! Descriptors are addressed by a small index handle. The bus address that hardware sees is
//! derived from the index, so software never keeps raw pointers into DMA memory.
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::{fmt, mem};

use common::dma::{BusMapper, Dma};
use log::warn;
use slab::Slab;
use syscall::error::{Error, Result, EINVAL, ENOMEM};

use super::desc::{Qh, Td};

/// A descriptor that can live in a [`DescPool`].
pub trait Descriptor: Default {
    const NAME: &'static str;
    /// Put the descriptor in its freshly allocated state.
    fn reset(&self);
}

impl Descriptor for Td {
    const NAME: &'static str = "TD";
    fn reset(&self) {
        self.clear()
    }
}

impl Descriptor for Qh {
    const NAME: &'static str = "QH";
    fn reset(&self) {
        self.clear()
    }
}

pub struct Handle<T> {
    index: u32,
    kind: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: usize) -> Self {
        Self {
            index: index as u32,
            kind: PhantomData,
        }
    }
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

// Derives would put bounds on `T`.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}
impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl<T> Eq for Handle<T> {}
impl<T: Descriptor> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", T::NAME, self.index)
    }
}

pub type TdHandle = Handle<Td>;
pub type QhHandle = Handle<Qh>;

pub struct DescPool<T> {
    descs: Dma<[T]>,
    base: u32,
    used: Mutex<Slab<()>>,
}

impl<T: Descriptor> DescPool<T> {
    pub fn new(capacity: usize, mapper: &Arc<dyn BusMapper>) -> Result<Self> {
        let descs = unsafe { Dma::<[T]>::zeroed_unsized(capacity, mapper)? };
        let end = descs.physical() + capacity * mem::size_of::<T>();
        // UHCI link pointers and the frame list base are 32 bits wide.
        let base = u32::try_from(descs.physical())
            .ok()
            .filter(|_| end <= u32::MAX as usize)
            .ok_or_else(|| {
                warn!("{} pool at {:#x} is not reachable with 32-bit DMA", T::NAME, descs.physical());
                Error::new(EINVAL)
            })?;
        for desc in descs.iter() {
            desc.reset();
        }
        Ok(Self {
            descs,
            base,
            used: Mutex::new(Slab::with_capacity(capacity)),
        })
    }

    /// Allocate a descriptor in its reset state. Never blocks for longer than the pool lock is
    /// held, so it may be used from the completion path.
    pub fn alloc(&self) -> Result<Handle<T>> {
        let mut used = self.used.lock().unwrap();
        if used.len() >= self.descs.len() {
            return Err(Error::new(ENOMEM));
        }
        let index = used.insert(());
        self.descs[index].reset();
        Ok(Handle::new(index))
    }

    /// Return a descriptor to the pool. The caller must have proven that hardware can no longer
    /// reach it.
    pub fn free(&self, handle: Handle<T>) {
        let mut used = self.used.lock().unwrap();
        if used.try_remove(handle.index()).is_none() {
            warn!("double free of {:?}", handle);
            return;
        }
        self.descs[handle.index()].reset();
    }

    pub fn get(&self, handle: Handle<T>) -> &T {
        &self.descs[handle.index()]
    }

    /// The bus address of a descriptor, as written into link pointers.
    pub fn bus(&self, handle: Handle<T>) -> u32 {
        self.base + (handle.index() * mem::size_of::<T>()) as u32
    }

    /// Find the descriptor a link pointer refers to.
    pub fn lookup(&self, bus: u32) -> Option<Handle<T>> {
        let offset = bus.checked_sub(self.base)? as usize;
        if offset % mem::size_of::<T>() != 0 {
            return None;
        }
        let index = offset / mem::size_of::<T>();
        (index < self.descs.len()).then(|| Handle::new(index))
    }

    pub fn capacity(&self) -> usize {
        self.descs.len()
    }
    pub fn in_use(&self) -> usize {
        self.used.lock().unwrap().len()
    }
    pub fn available(&self) -> usize {
        self.capacity() - self.in_use()
    }
}

impl<T: Descriptor> fmt::Debug for DescPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescPool")
            .field("kind", &T::NAME)
            .field("base", &format_args!("{:#010x}", self.base))
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::uhci::desc::LINK_TERMINATE;
    use common::dma::BusWindow;
    use std::sync::atomic::Ordering;

    fn mapper() -> Arc<dyn BusMapper> {
        Arc::new(BusWindow::new(0x4000_0000, 0x10_0000))
    }

    #[test]
    fn alloc_until_exhausted() {
        let pool = DescPool::<Td>::new(3, &mapper()).unwrap();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert_eq!(pool.alloc().unwrap_err(), Error::new(ENOMEM));
        assert_eq!(pool.bus(a), 0x4000_0000);
        assert_eq!(pool.bus(b), 0x4000_0010);
        assert_eq!(pool.lookup(pool.bus(c)), Some(c));
        assert_eq!(pool.lookup(0x4000_0008), None);

        pool.free(b);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.alloc().unwrap(), b);
    }

    #[test]
    fn allocation_resets_descriptor() {
        let pool = DescPool::<Qh>::new(1, &mapper()).unwrap();
        let qh = pool.alloc().unwrap();
        pool.get(qh).element.store(0x1234_5670, Ordering::SeqCst);
        pool.free(qh);
        let qh = pool.alloc().unwrap();
        assert_eq!(pool.get(qh).element.load(Ordering::SeqCst), LINK_TERMINATE);
        assert_eq!(pool.get(qh).head.load(Ordering::SeqCst), LINK_TERMINATE);
    }

    #[test]
    fn pool_above_4g_is_rejected() {
        let high: Arc<dyn BusMapper> = Arc::new(BusWindow::new(0x1_0000_0000, 0x10_0000));
        assert_eq!(DescPool::<Td>::new(4, &high).unwrap_err(), Error::new(EINVAL));
    }
}
