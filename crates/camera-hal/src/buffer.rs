//! Memory-mapped frame buffers and the per-stream buffer store

use crate::error::{HalError, HalResult};
use crate::params::{PixelFormat, Size};
use crate::state::StreamKind;
use std::ptr::NonNull;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Luma plane padding used by the preview path
const PLANE_ALIGN: usize = 2048;
/// Whole-frame padding (one page)
const FRAME_ALIGN: usize = 4096;

/// Errors from the memory mapping facility
#[derive(Debug, Error)]
pub enum MapError {
    #[error("Out of memory mapping {0} bytes")]
    OutOfMemory(usize),

    #[error("Zero-length mapping requested")]
    ZeroLength,

    #[error("Mapping call failed: {0}")]
    Os(#[from] std::io::Error),

    #[error("Region with descriptor {0} is not owned by this mapper")]
    Foreign(i32),
}

/// A mapped region handed out by a [`MemoryMapper`]
pub struct MappedRegion {
    descriptor: i32,
    base: NonNull<u8>,
    length: usize,
}

impl MappedRegion {
    /// Wrap a raw mapping.
    ///
    /// # Safety
    /// `base` must be valid for reads and writes of `length` bytes until the
    /// region is returned to the mapper that produced it.
    pub unsafe fn from_raw_parts(descriptor: i32, base: NonNull<u8>, length: usize) -> Self {
        Self {
            descriptor,
            base,
            length,
        }
    }

    /// Backing descriptor
    pub fn descriptor(&self) -> i32 {
        self.descriptor
    }

    /// Mapped base address
    pub fn address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Raw base pointer, for the owning mapper
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: guaranteed by the from_raw_parts contract
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.length) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by the from_raw_parts contract; &mut self is unique
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.length) }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("descriptor", &self.descriptor)
            .field("address", &format_args!("{:#x}", self.address()))
            .field("length", &self.length)
            .finish()
    }
}

// The region is plain memory owned by exactly one MappedBuffer
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

/// Memory mapping facility (pmem/ion heap, memfd, or a test heap)
pub trait MemoryMapper: Send + Sync {
    /// Map `length` bytes of shareable memory
    fn map(&self, length: usize) -> Result<MappedRegion, MapError>;

    /// Unmap a region previously returned by `map`
    fn unmap(&self, region: MappedRegion) -> Result<(), MapError>;
}

/// Plane layout of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub size: Size,
    pub format: PixelFormat,
    pub y_offset: usize,
    pub cbcr_offset: usize,
    pub frame_len: usize,
}

impl FrameGeometry {
    /// Semi-planar 4:2:0 layout with a padded luma plane
    pub fn semi_planar(size: Size, format: PixelFormat) -> Self {
        let luma = size.width as usize * size.height as usize;
        let cbcr_offset = align_up(luma, PLANE_ALIGN);
        let frame_len = align_up(cbcr_offset + luma / 2, FRAME_ALIGN);
        Self {
            size,
            format,
            y_offset: 0,
            cbcr_offset,
            frame_len,
        }
    }

    /// Luma plane length in bytes
    pub fn luma_len(&self) -> usize {
        self.size.width as usize * self.size.height as usize
    }

    /// Chroma plane length in bytes
    pub fn chroma_len(&self) -> usize {
        self.luma_len() / 2
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Descriptor-level view of a buffer, handed to drivers and displays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    pub descriptor: i32,
    pub offset: usize,
    pub length: usize,
    pub index: usize,
}

/// A mapped frame buffer owned by the store
#[derive(Debug)]
pub struct MappedBuffer {
    region: MappedRegion,
    geometry: FrameGeometry,
    index: usize,
}

impl MappedBuffer {
    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn descriptor(&self) -> i32 {
        self.region.descriptor()
    }

    pub fn address(&self) -> usize {
        self.region.address()
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Frame bytes (one `frame_len` worth)
    pub fn data(&self) -> &[u8] {
        let len = self.geometry.frame_len.min(self.region.len());
        &self.region.as_slice()[..len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let len = self.geometry.frame_len.min(self.region.len());
        &mut self.region.as_mut_slice()[..len]
    }

    pub fn handle(&self) -> BufferHandle {
        BufferHandle {
            descriptor: self.region.descriptor(),
            offset: 0,
            length: self.region.len(),
            index: self.index,
        }
    }
}

/// Owner of every mapped buffer, grouped by stream kind
pub struct BufferStore {
    mapper: Arc<dyn MemoryMapper>,
    sets: [Vec<MappedBuffer>; 3],
    postview: Option<MappedBuffer>,
}

impl BufferStore {
    pub fn new(mapper: Arc<dyn MemoryMapper>) -> Self {
        Self {
            mapper,
            sets: [Vec::new(), Vec::new(), Vec::new()],
            postview: None,
        }
    }

    /// Map `count` buffers for a stream, replacing any previous set.
    ///
    /// On failure nothing stays mapped for that kind.
    pub fn allocate(
        &mut self,
        kind: StreamKind,
        count: usize,
        geometry: FrameGeometry,
    ) -> HalResult<Vec<BufferHandle>> {
        if count == 0 {
            return Err(HalError::Allocation(format!("{} stream needs at least one buffer", kind)));
        }
        self.release_kind(kind);

        let mut buffers = Vec::with_capacity(count);
        for index in 0..count {
            match self.mapper.map(geometry.frame_len) {
                Ok(region) => buffers.push(MappedBuffer {
                    region,
                    geometry,
                    index,
                }),
                Err(e) => {
                    warn!("Mapping {} buffer {} failed: {}", kind, index, e);
                    for buffer in buffers {
                        self.unmap(buffer);
                    }
                    return Err(e.into());
                }
            }
        }

        debug!(
            "Mapped {} {} buffers of {} bytes",
            count, kind, geometry.frame_len
        );
        let handles = buffers.iter().map(MappedBuffer::handle).collect();
        self.sets[kind.index()] = buffers;
        Ok(handles)
    }

    /// Unmap every buffer tied to a stream kind
    pub fn release_kind(&mut self, kind: StreamKind) {
        let buffers = std::mem::take(&mut self.sets[kind.index()]);
        if !buffers.is_empty() {
            debug!("Unmapping {} {} buffers", buffers.len(), kind);
        }
        for buffer in buffers {
            self.unmap(buffer);
        }
    }

    pub fn is_empty_for(&self, kind: StreamKind) -> bool {
        self.sets[kind.index()].is_empty()
    }

    pub fn len_for(&self, kind: StreamKind) -> usize {
        self.sets[kind.index()].len()
    }

    /// Handles of every buffer of a kind, in index order
    pub fn handles(&self, kind: StreamKind) -> Vec<BufferHandle> {
        self.sets[kind.index()].iter().map(MappedBuffer::handle).collect()
    }

    pub fn buffer(&self, kind: StreamKind, index: usize) -> Option<&MappedBuffer> {
        self.sets[kind.index()].get(index)
    }

    pub fn buffer_mut(&mut self, kind: StreamKind, index: usize) -> Option<&mut MappedBuffer> {
        self.sets[kind.index()].get_mut(index)
    }

    /// Copy a preview frame into a dedicated postview buffer.
    ///
    /// The copy survives the teardown of the preview stream and is released
    /// by [`clear_postview`](Self::clear_postview).
    pub fn capture_postview(&mut self, index: usize) -> HalResult<BufferHandle> {
        self.clear_postview();

        let source = self
            .buffer(StreamKind::Preview, index)
            .ok_or_else(|| HalError::InvalidState(format!("no preview buffer {}", index)))?;
        let geometry = *source.geometry();

        let region = self.mapper.map(geometry.frame_len)?;
        let mut postview = MappedBuffer {
            region,
            geometry,
            index: 0,
        };

        if let Some(source) = self.buffer(StreamKind::Preview, index) {
            postview.data_mut().copy_from_slice(source.data());
        }

        let handle = postview.handle();
        self.postview = Some(postview);
        Ok(handle)
    }

    pub fn postview(&self) -> Option<&MappedBuffer> {
        self.postview.as_ref()
    }

    pub fn clear_postview(&mut self) {
        if let Some(buffer) = self.postview.take() {
            debug!("Unmapping postview buffer");
            self.unmap(buffer);
        }
    }

    /// Unmap everything
    pub fn release_all(&mut self) {
        for kind in StreamKind::ALL {
            self.release_kind(kind);
        }
        self.clear_postview();
    }

    fn unmap(&self, buffer: MappedBuffer) {
        let descriptor = buffer.descriptor();
        if let Err(e) = self.mapper.unmap(buffer.region) {
            warn!("Unmap of descriptor {} failed: {}", descriptor, e);
        }
    }
}

impl Drop for BufferStore {
    fn drop(&mut self) {
        self.release_all();
    }
}
