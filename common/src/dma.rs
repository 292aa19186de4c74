use std::alloc::{self, Layout};
use std::mem::{self, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use syscall::error::{Error, Result, EINVAL, ENOMEM};
use syscall::PAGE_SIZE;

/// Translates CPU memory into addresses a bus master can reach.
///
/// Every [`PhysBox`] is mapped exactly once when it is allocated, and unmapped when it is dropped,
/// so implementations never have to translate arbitrary pointers later on.
pub trait BusMapper: Send + Sync {
    /// Map `size` bytes starting at the virtual address `virt`, returning the bus address.
    fn map(&self, virt: usize, size: usize) -> Result<usize>;

    /// Release a mapping previously returned by [`BusMapper::map`].
    fn unmap(&self, _bus: usize, _size: usize) {}
}

/// Bus addresses are the same as virtual addresses (no IOMMU, identity-mapped kernel).
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityMapper;

impl BusMapper for IdentityMapper {
    fn map(&self, virt: usize, _size: usize) -> Result<usize> {
        Ok(virt)
    }
}

/// A linear window of bus addresses handed out page by page, as an emulated device or a
/// translation aperture would see them. Addresses are never reused.
#[derive(Debug)]
pub struct BusWindow {
    next: AtomicUsize,
    limit: usize,
}

impl BusWindow {
    pub fn new(base: usize, size: usize) -> Self {
        assert_aligned(base);
        Self {
            next: AtomicUsize::new(base),
            limit: base + size,
        }
    }
}

impl BusMapper for BusWindow {
    fn map(&self, _virt: usize, size: usize) -> Result<usize> {
        let size = size.next_multiple_of(PAGE_SIZE);
        let bus = self.next.fetch_add(size, Ordering::Relaxed);
        if bus + size > self.limit {
            return Err(Error::new(ENOMEM));
        }
        Ok(bus)
    }
}

fn assert_aligned(x: usize) {
    assert_eq!(x % PAGE_SIZE, 0);
}

/// An RAII guard of a bus-visible memory allocation. All allocations are page-aligned, zeroed and
/// take up at least one page.
pub struct PhysBox {
    address: usize,
    virt: NonNull<u8>,
    layout: Layout,
    mapper: Arc<dyn BusMapper>,
}

impl PhysBox {
    /// Allocate and map `size` bytes. `size` must be a multiple of the page size.
    pub fn new(size: usize, mapper: &Arc<dyn BusMapper>) -> Result<Self> {
        assert_aligned(size);
        if size == 0 {
            return Err(Error::new(EINVAL));
        }
        let layout = Layout::from_size_align(size, PAGE_SIZE).map_err(|_| Error::new(EINVAL))?;
        let virt = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or(Error::new(ENOMEM))?;

        match mapper.map(virt.as_ptr() as usize, size) {
            Ok(address) => Ok(Self {
                address,
                virt,
                layout,
                mapper: Arc::clone(mapper),
            }),
            Err(err) => {
                unsafe { alloc::dealloc(virt.as_ptr(), layout) };
                Err(err)
            }
        }
    }

    /// Retrieve the bus address of this allocation.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Retrieve the size in bytes of the alloc.
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }
}

impl std::fmt::Debug for PhysBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysBox")
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size())
            .finish()
    }
}

impl Drop for PhysBox {
    fn drop(&mut self) {
        self.mapper.unmap(self.address, self.layout.size());
        unsafe { alloc::dealloc(self.virt.as_ptr(), self.layout) }
    }
}

pub struct Dma<T: ?Sized> {
    phys: PhysBox,
    virt: *mut T,
}

// The memory is owned exclusively; sharing it is as safe as sharing a `T`.
unsafe impl<T: ?Sized + Send> Send for Dma<T> {}
unsafe impl<T: ?Sized + Sync> Sync for Dma<T> {}

impl<T> Dma<T> {
    pub fn zeroed(mapper: &Arc<dyn BusMapper>) -> Result<Dma<MaybeUninit<T>>> {
        let phys = PhysBox::new(mem::size_of::<T>().max(1).next_multiple_of(PAGE_SIZE), mapper)?;
        Ok(Dma {
            virt: phys.as_mut_ptr() as *mut MaybeUninit<T>,
            phys,
        })
    }

    pub fn new(value: T, mapper: &Arc<dyn BusMapper>) -> Result<Self> {
        let this = Self::zeroed(mapper)?;
        Ok(unsafe {
            ptr::write(this.virt, MaybeUninit::new(value));
            this.assume_init()
        })
    }
}

impl<T> Dma<MaybeUninit<T>> {
    pub unsafe fn assume_init(self) -> Dma<T> {
        let this = mem::ManuallyDrop::new(self);
        Dma {
            phys: ptr::read(&this.phys),
            virt: this.virt as *mut T,
        }
    }
}

impl<T: ?Sized> Dma<T> {
    /// The bus address of the first byte.
    pub fn physical(&self) -> usize {
        self.phys.address()
    }
    pub fn size(&self) -> usize {
        self.phys.size()
    }
    pub fn phys(&self) -> &PhysBox {
        &self.phys
    }
}

impl<T> Dma<[T]> {
    /// Creates a new DMA buffer with a size only known at runtime.
    /// ## Safety
    /// * `T` must be valid as zeroed (i.e. no NonNull pointers).
    pub unsafe fn zeroed_unsized(count: usize, mapper: &Arc<dyn BusMapper>) -> Result<Self> {
        assert!(mem::align_of::<T>() <= PAGE_SIZE);
        let size = (mem::size_of::<T>() * count).max(1).next_multiple_of(PAGE_SIZE);
        let phys = PhysBox::new(size, mapper)?;
        Ok(Dma {
            virt: slice::from_raw_parts_mut(phys.as_mut_ptr() as *mut T, count) as *mut [T],
            phys,
        })
    }

    /// The bus address of element `index`.
    pub fn physical_at(&self, index: usize) -> usize {
        self.physical() + index * mem::size_of::<T>()
    }
}

impl Dma<[u8]> {
    /// A zeroed byte buffer of `len` bytes.
    pub fn buffer(len: usize, mapper: &Arc<dyn BusMapper>) -> Result<Self> {
        unsafe { Self::zeroed_unsized(len, mapper) }
    }
}

impl<T: ?Sized> Deref for Dma<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.virt }
    }
}

impl<T: ?Sized> DerefMut for Dma<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.virt }
    }
}

impl<T: ?Sized> Drop for Dma<T> {
    fn drop(&mut self) {
        unsafe { ptr::drop_in_place(self.virt) }
    }
}

impl<T: ?Sized> std::fmt::Debug for Dma<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dma").field("phys", &self.phys).finish()
    }
}
