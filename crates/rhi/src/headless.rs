//! Software backend.
//!
//! [`HeadlessDevice`] implements every device seam without a GPU. Handles are
//! fabricated from a counter, "GPU" work is a queue of pending submissions,
//! and host-visible memory is ordinary heap memory. It exists so the frame
//! pipeline can be driven and inspected in tests and in `--headless` runs.
//!
//! # Retirement modes
//!
//! By default a submission retires (signals its fence) as soon as it is
//! submitted. In stalled mode ([`HeadlessDevice::set_stalled`]) submissions
//! stay pending until [`HeadlessDevice::complete_next`] or
//! [`HeadlessDevice::complete_all`] retires them, which is how tests model a
//! GPU that falls behind. [`GpuDevice::wait_idle`] always drains the queue.
//!
//! # Inspection
//!
//! [`HeadlessDevice::counters`] reports acquires, presents, submissions,
//! pool resets and fence-order violations (a command pool reset while a
//! submission recorded from it is still pending).

use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use tracing::{debug, warn};

use crate::device::{
    AcquireOutcome, AllocationHandle, BufferAllocDesc, DeviceAllocator, GpuDevice, ImageAllocDesc,
    MemoryBlock, PresentBackend, PresentOutcome, SubmitDesc, SurfaceTarget, SwapchainDesc,
    SwapchainSupportDetails,
};
use crate::error::{RhiError, RhiResult};

/// Largest image dimension the software surface reports by default.
const MAX_EXTENT: u32 = 16384;

/// Memory budget of a device built with [`HeadlessDevice::new`]: 1 GiB.
pub const DEFAULT_MEMORY_BUDGET: u64 = 1 << 30;

/// How the next acquire should misbehave.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireFailure {
    /// Block for the full acquire timeout without producing an image.
    Timeout,
    /// Hand out an image but report the swapchain as suboptimal.
    Suboptimal,
}

/// Call counters for assertions in tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessCounters {
    /// Acquire calls that reached the backend.
    pub acquires: u64,
    /// Images successfully queued for presentation.
    pub presents: u64,
    pub submissions: u64,
    pub pool_resets: u64,
    /// Command pool or fence resets issued while dependent work was pending.
    pub fence_order_violations: u64,
    /// Highest number of simultaneously pending submissions.
    pub max_outstanding: usize,
    pub swapchains_created: u64,
    pub surfaces_created: u64,
}

#[derive(Debug)]
struct PendingSubmit {
    fence: u64,
    pool: Option<u64>,
}

#[derive(Debug)]
struct HeadlessSwapchain {
    images: Vec<vk::Image>,
    extent: vk::Extent2D,
    next_image: u32,
    retired: bool,
}

#[derive(Debug)]
struct HostAllocation {
    resource: u64,
    memory: u64,
    size: u64,
    // Backing storage for mapped pointers handed out in `MemoryBlock`.
    _host: Option<Box<[u8]>>,
}

#[derive(Debug)]
struct HeadlessState {
    stalled: bool,
    device_lost: bool,
    fail_next_present: bool,
    fail_next_acquire: Option<AcquireFailure>,
    surface_extent: vk::Extent2D,
    /// Surface leaves the extent to the swapchain (reports `u32::MAX`).
    undefined_extent: bool,
    max_extent: vk::Extent2D,
    min_image_count: u32,
    max_image_count: u32,
    last_image_count: u32,
    memory_budget: u64,
    memory_used: u64,
    /// Freed device-memory handles handed out again, newest first.
    recycled_memory: Option<Vec<u64>>,
    semaphores: HashSet<u64>,
    fences: HashMap<u64, bool>,
    pools: HashSet<u64>,
    command_buffers: HashMap<u64, u64>,
    recording: HashSet<u64>,
    pending: VecDeque<PendingSubmit>,
    surfaces: HashSet<u64>,
    swapchains: HashMap<u64, HeadlessSwapchain>,
    image_views: HashSet<u64>,
    allocations: HashMap<u64, HostAllocation>,
    counters: HeadlessCounters,
}

/// In-process stand-in for a GPU and presentation engine.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use cadence_rhi::device::GpuContext;
/// use cadence_rhi::headless::HeadlessDevice;
///
/// let backend = Arc::new(HeadlessDevice::new(600, 600).with_image_count(2, 3));
/// let context = GpuContext::from_backend(backend.clone());
/// backend.set_stalled(true);
/// assert_eq!(backend.outstanding_submissions(), 0);
/// ```
#[derive(Debug)]
pub struct HeadlessDevice {
    state: Mutex<HeadlessState>,
    retired: Condvar,
    next_handle: AtomicU64,
    graphics_queue: vk::Queue,
}

impl HeadlessDevice {
    /// Creates a device whose surface reports `width` x `height`.
    pub fn new(width: u32, height: u32) -> Self {
        let next_handle = AtomicU64::new(1);
        let graphics_queue = vk::Queue::from_raw(next_handle.fetch_add(1, Ordering::Relaxed));
        Self {
            state: Mutex::new(HeadlessState {
                stalled: false,
                device_lost: false,
                fail_next_present: false,
                fail_next_acquire: None,
                surface_extent: vk::Extent2D { width, height },
                undefined_extent: false,
                max_extent: vk::Extent2D {
                    width: MAX_EXTENT,
                    height: MAX_EXTENT,
                },
                min_image_count: 2,
                max_image_count: 3,
                last_image_count: 0,
                memory_budget: DEFAULT_MEMORY_BUDGET,
                memory_used: 0,
                recycled_memory: None,
                semaphores: HashSet::new(),
                fences: HashMap::new(),
                pools: HashSet::new(),
                command_buffers: HashMap::new(),
                recording: HashSet::new(),
                pending: VecDeque::new(),
                surfaces: HashSet::new(),
                swapchains: HashMap::new(),
                image_views: HashSet::new(),
                allocations: HashMap::new(),
                counters: HeadlessCounters::default(),
            }),
            retired: Condvar::new(),
            next_handle,
            graphics_queue,
        }
    }

    /// Limits total allocated bytes; further allocations fail with out-of-memory.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.state_mut().memory_budget = bytes;
        self
    }

    /// Sets the surface's minimum and maximum swapchain image counts.
    pub fn with_image_count(mut self, min: u32, max: u32) -> Self {
        let state = self.state_mut();
        state.min_image_count = min.max(1);
        state.max_image_count = max.max(state.min_image_count);
        self
    }

    /// Caps the swapchain extent the surface allows.
    pub fn with_max_extent(mut self, width: u32, height: u32) -> Self {
        self.state_mut().max_extent = vk::Extent2D {
            width: width.max(1),
            height: height.max(1),
        };
        self
    }

    /// Makes the surface report an undefined current extent, leaving the
    /// size to the swapchain. [`HeadlessDevice::resize_surface`] then sets
    /// the window size the swapchain is checked against.
    pub fn with_undefined_extent(mut self) -> Self {
        self.state_mut().undefined_extent = true;
        self
    }

    /// Hands freed device-memory handles out again, the way drivers reuse
    /// handle values.
    pub fn with_memory_handle_reuse(mut self) -> Self {
        self.state_mut().recycled_memory = Some(Vec::new());
        self
    }

    fn state_mut(&mut self) -> &mut HeadlessState {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Switches between immediate and manual retirement of submissions.
    ///
    /// Leaving stalled mode retires everything still pending.
    pub fn set_stalled(&self, stalled: bool) {
        let mut state = self.lock();
        state.stalled = stalled;
        if !stalled {
            retire_all(&mut state);
            self.retired.notify_all();
        }
    }

    /// Retires the oldest pending submission. Returns false if none was pending.
    pub fn complete_next(&self) -> bool {
        let mut state = self.lock();
        let Some(submit) = state.pending.pop_front() else {
            return false;
        };
        if let Some(signaled) = state.fences.get_mut(&submit.fence) {
            *signaled = true;
        }
        self.retired.notify_all();
        true
    }

    /// Retires every pending submission and returns how many there were.
    pub fn complete_all(&self) -> usize {
        let mut state = self.lock();
        let count = retire_all(&mut state);
        self.retired.notify_all();
        count
    }

    /// Changes the extent the surface reports; zero models a minimized window.
    pub fn resize_surface(&self, width: u32, height: u32) {
        self.lock().surface_extent = vk::Extent2D { width, height };
    }

    /// Changes the image-count range later swapchains are built with.
    pub fn set_image_count(&self, min: u32, max: u32) {
        let mut state = self.lock();
        state.min_image_count = min.max(1);
        state.max_image_count = max.max(state.min_image_count);
    }

    /// Makes the next present fail as if the surface went out of date.
    pub fn fail_next_present(&self) {
        self.lock().fail_next_present = true;
    }

    /// Makes the next acquire time out or report a suboptimal swapchain.
    pub fn fail_next_acquire(&self, failure: AcquireFailure) {
        self.lock().fail_next_acquire = Some(failure);
    }

    /// Makes every later submission and fence wait report a lost device.
    pub fn lose_device(&self) {
        self.lock().device_lost = true;
        self.retired.notify_all();
    }

    pub fn counters(&self) -> HeadlessCounters {
        self.lock().counters
    }

    pub fn outstanding_submissions(&self) -> usize {
        self.lock().pending.len()
    }

    /// Image count of the most recently created swapchain.
    pub fn swapchain_image_count(&self) -> u32 {
        self.lock().last_image_count
    }

    pub fn live_semaphores(&self) -> usize {
        self.lock().semaphores.len()
    }

    pub fn live_fences(&self) -> usize {
        self.lock().fences.len()
    }

    pub fn live_command_pools(&self) -> usize {
        self.lock().pools.len()
    }

    pub fn live_surfaces(&self) -> usize {
        self.lock().surfaces.len()
    }

    pub fn live_swapchains(&self) -> usize {
        self.lock().swapchains.len()
    }

    pub fn is_swapchain_alive(&self, swapchain: vk::SwapchainKHR) -> bool {
        self.lock().swapchains.contains_key(&swapchain.as_raw())
    }

    pub fn live_image_views(&self) -> usize {
        self.lock().image_views.len()
    }

    pub fn is_image_view_alive(&self, view: vk::ImageView) -> bool {
        self.lock().image_views.contains(&view.as_raw())
    }

    pub fn live_allocations(&self) -> usize {
        self.lock().allocations.len()
    }

    /// Bytes currently allocated.
    pub fn memory_used(&self) -> u64 {
        self.lock().memory_used
    }

    fn allocate(
        &self,
        resource: u64,
        size: u64,
        location: MemoryLocation,
        host_visible: bool,
        name: &str,
    ) -> RhiResult<MemoryBlock> {
        let mut state = self.lock();
        if state.memory_used.saturating_add(size) > state.memory_budget {
            warn!(
                "Headless allocation '{}' of {} bytes exceeds budget ({} of {} used)",
                name, size, state.memory_used, state.memory_budget
            );
            return Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }

        let mut host = if host_visible {
            Some(host_memory(size).ok_or_else(|| {
                warn!("Headless host memory for '{}' ({} bytes) unavailable", name, size);
                RhiError::VulkanError(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
            })?)
        } else {
            None
        };
        let mapped = host.as_mut().and_then(|h| NonNull::new(h.as_mut_ptr()));

        let memory = match state.recycled_memory.as_mut().and_then(Vec::pop) {
            Some(raw) => raw,
            None => self.next_raw(),
        };
        let handle = AllocationHandle::from_raw(self.next_raw());
        let memory_type_index = memory_type_index(location);

        state.memory_used += size;
        state.allocations.insert(
            handle.as_raw(),
            HostAllocation {
                resource,
                memory,
                size,
                _host: host,
            },
        );

        debug!("Headless allocation '{}': {} bytes", name, size);
        Ok(MemoryBlock {
            handle,
            memory: vk::DeviceMemory::from_raw(memory),
            memory_type_index,
            size,
            mapped,
        })
    }

    fn free(&self, resource: u64, allocation: AllocationHandle) -> RhiResult<()> {
        let mut state = self.lock();
        match state.allocations.get(&allocation.as_raw()) {
            Some(entry) if entry.resource == resource => {}
            Some(_) => {
                return Err(RhiError::InvalidHandle(format!(
                    "allocation {allocation:?} is bound to a different resource"
                )));
            }
            None => {
                return Err(RhiError::InvalidHandle(format!(
                    "unknown allocation {allocation:?}"
                )));
            }
        }
        if let Some(entry) = state.allocations.remove(&allocation.as_raw()) {
            state.memory_used -= entry.size;
            if let Some(recycled) = state.recycled_memory.as_mut() {
                recycled.push(entry.memory);
            }
        }
        Ok(())
    }
}

/// Zeroed host memory, or `None` when the request cannot be satisfied.
fn host_memory(size: u64) -> Option<Box<[u8]>> {
    let len = usize::try_from(size).ok()?;
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(len).ok()?;
    bytes.resize(len, 0);
    Some(bytes.into_boxed_slice())
}

/// Extent the presentation engine currently expects a swapchain to have.
fn expected_extent(state: &HeadlessState) -> vk::Extent2D {
    if state.undefined_extent {
        vk::Extent2D {
            width: state.surface_extent.width.min(state.max_extent.width),
            height: state.surface_extent.height.min(state.max_extent.height),
        }
    } else {
        state.surface_extent
    }
}

fn retire_all(state: &mut HeadlessState) -> usize {
    let count = state.pending.len();
    while let Some(submit) = state.pending.pop_front() {
        if let Some(signaled) = state.fences.get_mut(&submit.fence) {
            *signaled = true;
        }
    }
    count
}

fn memory_type_index(location: MemoryLocation) -> u32 {
    match location {
        MemoryLocation::CpuToGpu => 1,
        MemoryLocation::GpuToCpu => 2,
        _ => 0,
    }
}

fn is_host_visible(location: MemoryLocation) -> bool {
    matches!(
        location,
        MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu
    )
}

fn bytes_per_texel(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM | vk::Format::S8_UINT => 1,
        vk::Format::D16_UNORM | vk::Format::R16_SFLOAT | vk::Format::R8G8_UNORM => 2,
        vk::Format::D32_SFLOAT_S8_UINT
        | vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => 4,
    }
}

fn unknown(kind: &str, raw: u64) -> RhiError {
    RhiError::InvalidHandle(format!("unknown {kind} {raw:#x}"))
}

impl GpuDevice for HeadlessDevice {
    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let raw = self.next_raw();
        self.lock().semaphores.insert(raw);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        if semaphore != vk::Semaphore::null() {
            self.lock().semaphores.remove(&semaphore.as_raw());
        }
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let raw = self.next_raw();
        self.lock().fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if fence != vk::Fence::null() {
            self.lock().fences.remove(&fence.as_raw());
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> RhiResult<bool> {
        let raw = fence.as_raw();
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();

        loop {
            if state.device_lost {
                return Err(RhiError::DeviceLost("headless device lost".to_string()));
            }
            match state.fences.get(&raw) {
                None => return Err(unknown("fence", raw)),
                Some(true) => return Ok(true),
                Some(false) => {}
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.retired
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0)
                }
                None => self
                    .retired
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        let raw = fence.as_raw();
        let mut state = self.lock();
        if state.pending.iter().any(|p| p.fence == raw) {
            warn!("Fence {:#x} reset while its submission is pending", raw);
            state.counters.fence_order_violations += 1;
        }
        let signaled = state.fences.get_mut(&raw).ok_or_else(|| unknown("fence", raw))?;
        *signaled = false;
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        let raw = fence.as_raw();
        self.lock()
            .fences
            .get(&raw)
            .copied()
            .ok_or_else(|| unknown("fence", raw))
    }

    fn create_command_pool(&self) -> RhiResult<vk::CommandPool> {
        let raw = self.next_raw();
        self.lock().pools.insert(raw);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        if pool == vk::CommandPool::null() {
            return;
        }
        let raw = pool.as_raw();
        let mut state = self.lock();
        state.pools.remove(&raw);
        let buffers: Vec<u64> = state
            .command_buffers
            .iter()
            .filter(|(_, owner)| **owner == raw)
            .map(|(buffer, _)| *buffer)
            .collect();
        for buffer in buffers {
            state.command_buffers.remove(&buffer);
            state.recording.remove(&buffer);
        }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        let raw = pool.as_raw();
        let mut state = self.lock();
        if !state.pools.contains(&raw) {
            return Err(unknown("command pool", raw));
        }
        if state.pending.iter().any(|p| p.pool == Some(raw)) {
            warn!("Command pool {:#x} reset while a submission from it is pending", raw);
            state.counters.fence_order_violations += 1;
        }
        state.counters.pool_resets += 1;

        let buffers: Vec<u64> = state
            .command_buffers
            .iter()
            .filter(|(_, owner)| **owner == raw)
            .map(|(buffer, _)| *buffer)
            .collect();
        for buffer in buffers {
            state.recording.remove(&buffer);
        }
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer> {
        let pool_raw = pool.as_raw();
        let raw = self.next_raw();
        let mut state = self.lock();
        if !state.pools.contains(&pool_raw) {
            return Err(unknown("command pool", pool_raw));
        }
        state.command_buffers.insert(raw, pool_raw);
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()> {
        let raw = command_buffer.as_raw();
        let mut state = self.lock();
        if !state.command_buffers.contains_key(&raw) {
            return Err(unknown("command buffer", raw));
        }
        if !state.recording.insert(raw) {
            return Err(RhiError::InvalidHandle(format!(
                "command buffer {raw:#x} is already recording"
            )));
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let raw = command_buffer.as_raw();
        if self.lock().recording.remove(&raw) {
            Ok(())
        } else {
            Err(RhiError::InvalidHandle(format!(
                "command buffer {raw:#x} is not recording"
            )))
        }
    }

    fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    fn present_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    fn submit(&self, queue: vk::Queue, submit: &SubmitDesc) -> RhiResult<()> {
        let mut state = self.lock();
        if state.device_lost {
            return Err(RhiError::DeviceLost("headless device lost".to_string()));
        }
        if queue != self.graphics_queue {
            return Err(unknown("queue", queue.as_raw()));
        }

        let buffer = submit.command_buffer.as_raw();
        let pool = state.command_buffers.get(&buffer).copied();
        if pool.is_none() {
            return Err(unknown("command buffer", buffer));
        }
        if state.recording.contains(&buffer) {
            return Err(RhiError::InvalidHandle(format!(
                "command buffer {buffer:#x} submitted while recording"
            )));
        }
        for semaphore in [submit.wait_semaphore, submit.signal_semaphore] {
            if semaphore != vk::Semaphore::null() && !state.semaphores.contains(&semaphore.as_raw())
            {
                return Err(unknown("semaphore", semaphore.as_raw()));
            }
        }

        let fence = submit.fence.as_raw();
        if submit.fence != vk::Fence::null() {
            match state.fences.get(&fence) {
                None => return Err(unknown("fence", fence)),
                Some(true) => {
                    return Err(RhiError::InvalidHandle(format!(
                        "fence {fence:#x} submitted while signaled"
                    )));
                }
                Some(false) => {}
            }
        }

        state.counters.submissions += 1;
        if state.stalled {
            state.pending.push_back(PendingSubmit { fence, pool });
            state.counters.max_outstanding = state.counters.max_outstanding.max(state.pending.len());
        } else {
            state.counters.max_outstanding = state.counters.max_outstanding.max(1);
            if let Some(signaled) = state.fences.get_mut(&fence) {
                *signaled = true;
            }
            self.retired.notify_all();
        }
        Ok(())
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> RhiResult<vk::ImageView> {
        if image == vk::Image::null() {
            return Err(RhiError::InvalidHandle("image view of a null image".to_string()));
        }
        let raw = self.next_raw();
        self.lock().image_views.insert(raw);
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        if view != vk::ImageView::null() {
            self.lock().image_views.remove(&view.as_raw());
        }
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.lock();
        if state.device_lost {
            return Err(RhiError::DeviceLost("headless device lost".to_string()));
        }
        retire_all(&mut state);
        self.retired.notify_all();
        Ok(())
    }
}

impl PresentBackend for HeadlessDevice {
    fn create_surface(&self, target: &SurfaceTarget) -> RhiResult<vk::SurfaceKHR> {
        match *target {
            SurfaceTarget::Headless { width, height } => {
                let raw = self.next_raw();
                let mut state = self.lock();
                state.surface_extent = vk::Extent2D { width, height };
                state.surfaces.insert(raw);
                state.counters.surfaces_created += 1;
                Ok(vk::SurfaceKHR::from_raw(raw))
            }
            SurfaceTarget::Window { .. } => Err(RhiError::SurfaceError(
                "the headless backend cannot present to a window".to_string(),
            )),
        }
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        if surface != vk::SurfaceKHR::null() {
            self.lock().surfaces.remove(&surface.as_raw());
        }
    }

    fn surface_support(&self, surface: vk::SurfaceKHR) -> RhiResult<SwapchainSupportDetails> {
        let state = self.lock();
        if !state.surfaces.contains(&surface.as_raw()) {
            return Err(RhiError::SurfaceError(format!(
                "unknown surface {:#x}",
                surface.as_raw()
            )));
        }

        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: state.min_image_count,
            max_image_count: state.max_image_count,
            current_extent: if state.undefined_extent {
                vk::Extent2D {
                    width: u32::MAX,
                    height: u32::MAX,
                }
            } else {
                state.surface_extent
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: state.max_extent,
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
        };

        Ok(SwapchainSupportDetails {
            capabilities,
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        })
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<vk::SwapchainKHR> {
        let raw = self.next_raw();
        let mut state = self.lock();
        if !state.surfaces.contains(&desc.surface.as_raw()) {
            return Err(RhiError::SurfaceError(format!(
                "unknown surface {:#x}",
                desc.surface.as_raw()
            )));
        }
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(RhiError::SwapchainError(
                "swapchain extent must be non-zero".to_string(),
            ));
        }
        if desc.old_swapchain != vk::SwapchainKHR::null() {
            match state.swapchains.get_mut(&desc.old_swapchain.as_raw()) {
                Some(old) => old.retired = true,
                None => return Err(unknown("swapchain", desc.old_swapchain.as_raw())),
            }
        }

        let count = desc
            .image_count
            .clamp(state.min_image_count, state.max_image_count);
        let images = (0..count)
            .map(|_| vk::Image::from_raw(self.next_raw()))
            .collect();

        state.swapchains.insert(
            raw,
            HeadlessSwapchain {
                images,
                extent: desc.extent,
                next_image: 0,
                retired: false,
            },
        );
        state.last_image_count = count;
        state.counters.swapchains_created += 1;
        Ok(vk::SwapchainKHR::from_raw(raw))
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>> {
        let raw = swapchain.as_raw();
        self.lock()
            .swapchains
            .get(&raw)
            .map(|s| s.images.clone())
            .ok_or_else(|| unknown("swapchain", raw))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if swapchain != vk::SwapchainKHR::null() {
            self.lock().swapchains.remove(&swapchain.as_raw());
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: Duration,
        semaphore: vk::Semaphore,
    ) -> RhiResult<AcquireOutcome> {
        let raw = swapchain.as_raw();
        let mut state = self.lock();
        state.counters.acquires += 1;

        if semaphore != vk::Semaphore::null() && !state.semaphores.contains(&semaphore.as_raw()) {
            return Err(unknown("semaphore", semaphore.as_raw()));
        }
        let failure = state.fail_next_acquire.take();
        if failure == Some(AcquireFailure::Timeout) {
            drop(state);
            std::thread::sleep(timeout);
            debug!("Headless acquire timed out after {:?}", timeout);
            return Ok(AcquireOutcome::Stale);
        }

        let expected = expected_extent(&state);
        let chain = state
            .swapchains
            .get_mut(&raw)
            .ok_or_else(|| unknown("swapchain", raw))?;
        if chain.retired || chain.extent != expected {
            return Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }

        let index = chain.next_image;
        chain.next_image = (chain.next_image + 1) % chain.images.len() as u32;
        Ok(AcquireOutcome::Acquired {
            index,
            suboptimal: failure == Some(AcquireFailure::Suboptimal),
        })
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> RhiResult<PresentOutcome> {
        let raw = swapchain.as_raw();
        let mut state = self.lock();
        if state.device_lost {
            return Err(RhiError::DeviceLost("headless device lost".to_string()));
        }
        if queue != self.graphics_queue {
            return Err(unknown("queue", queue.as_raw()));
        }
        if std::mem::take(&mut state.fail_next_present) {
            return Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }
        if wait_semaphore != vk::Semaphore::null()
            && !state.semaphores.contains(&wait_semaphore.as_raw())
        {
            return Err(unknown("semaphore", wait_semaphore.as_raw()));
        }

        let expected = expected_extent(&state);
        let chain = state
            .swapchains
            .get(&raw)
            .ok_or_else(|| unknown("swapchain", raw))?;
        if image_index as usize >= chain.images.len() {
            return Err(RhiError::InvalidHandle(format!(
                "image index {image_index} out of range"
            )));
        }
        let stale = chain.retired || chain.extent != expected;

        state.counters.presents += 1;
        Ok(if stale {
            PresentOutcome::Stale
        } else {
            PresentOutcome::Presented
        })
    }
}

impl DeviceAllocator for HeadlessDevice {
    fn allocate_image(&self, desc: &ImageAllocDesc<'_>) -> RhiResult<(vk::Image, MemoryBlock)> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(RhiError::AllocationError(format!(
                "image '{}' has zero extent",
                desc.name
            )));
        }
        if desc.format == vk::Format::UNDEFINED {
            return Err(RhiError::VulkanError(vk::Result::ERROR_FORMAT_NOT_SUPPORTED));
        }

        let image = self.next_raw();
        let size =
            desc.extent.width as u64 * desc.extent.height as u64 * bytes_per_texel(desc.format);
        let block = self.allocate(image, size, desc.location, false, desc.name)?;
        Ok((vk::Image::from_raw(image), block))
    }

    fn free_image(&self, image: vk::Image, allocation: AllocationHandle) -> RhiResult<()> {
        self.free(image.as_raw(), allocation)
    }

    fn allocate_buffer(&self, desc: &BufferAllocDesc<'_>) -> RhiResult<(vk::Buffer, MemoryBlock)> {
        if desc.size == 0 {
            return Err(RhiError::AllocationError(format!(
                "buffer '{}' has zero size",
                desc.name
            )));
        }

        let buffer = self.next_raw();
        let block = self.allocate(
            buffer,
            desc.size,
            desc.location,
            is_host_visible(desc.location),
            desc.name,
        )?;
        Ok((vk::Buffer::from_raw(buffer), block))
    }

    fn free_buffer(&self, buffer: vk::Buffer, allocation: AllocationHandle) -> RhiResult<()> {
        self.free(buffer.as_raw(), allocation)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_headless_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HeadlessDevice>();
    }

    #[test]
    fn test_handles_are_unique() {
        let device = HeadlessDevice::new(1, 1);
        let a = device.create_semaphore().expect("semaphore");
        let b = device.create_semaphore().expect("semaphore");
        let f = device.create_fence(false).expect("fence");
        assert_ne!(a, b);
        assert_ne!(a.as_raw(), f.as_raw());
        assert_ne!(a, vk::Semaphore::null());
    }

    #[test]
    fn test_stalled_fence_signals_on_complete() {
        let device = Arc::new(HeadlessDevice::new(1, 1));
        device.set_stalled(true);
        let pool = device.create_command_pool().expect("pool");
        let cmd = device.allocate_command_buffer(pool).expect("buffer");
        let fence = device.create_fence(false).expect("fence");

        device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::empty())
            .expect("begin");
        device.end_command_buffer(cmd).expect("end");
        device
            .submit(
                device.graphics_queue(),
                &SubmitDesc {
                    command_buffer: cmd,
                    wait_semaphore: vk::Semaphore::null(),
                    wait_stage: vk::PipelineStageFlags::empty(),
                    signal_semaphore: vk::Semaphore::null(),
                    fence,
                },
            )
            .expect("submit");

        assert_eq!(device.outstanding_submissions(), 1);
        assert!(!device
            .wait_for_fence(fence, Duration::from_millis(10))
            .expect("wait"));

        let waiter = {
            let device = device.clone();
            std::thread::spawn(move || device.wait_for_fence(fence, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(device.complete_next());
        assert!(waiter.join().expect("join").expect("wait"));
        assert!(!device.complete_next());
    }

    #[test]
    fn test_pool_reset_with_pending_work_is_a_violation() {
        let device = HeadlessDevice::new(1, 1);
        device.set_stalled(true);
        let pool = device.create_command_pool().expect("pool");
        let cmd = device.allocate_command_buffer(pool).expect("buffer");
        let fence = device.create_fence(false).expect("fence");
        device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::empty())
            .expect("begin");
        device.end_command_buffer(cmd).expect("end");
        device
            .submit(
                device.graphics_queue(),
                &SubmitDesc {
                    command_buffer: cmd,
                    wait_semaphore: vk::Semaphore::null(),
                    wait_stage: vk::PipelineStageFlags::empty(),
                    signal_semaphore: vk::Semaphore::null(),
                    fence,
                },
            )
            .expect("submit");

        device.reset_command_pool(pool).expect("reset");
        assert_eq!(device.counters().fence_order_violations, 1);

        device.complete_all();
        device.reset_command_pool(pool).expect("reset");
        assert_eq!(device.counters().fence_order_violations, 1);
        assert_eq!(device.counters().pool_resets, 2);
    }

    #[test]
    fn test_window_surface_is_rejected() {
        use raw_window_handle::{RawDisplayHandle, RawWindowHandle, WebDisplayHandle, WebWindowHandle};

        let device = HeadlessDevice::new(1, 1);
        let target = SurfaceTarget::Window {
            display: RawDisplayHandle::Web(WebDisplayHandle::new()),
            window: RawWindowHandle::Web(WebWindowHandle::new(1)),
        };
        assert!(matches!(
            device.create_surface(&target),
            Err(RhiError::SurfaceError(_))
        ));
    }

    #[test]
    fn test_memory_budget_and_host_mapping() {
        let device = HeadlessDevice::new(1, 1).with_memory_budget(128);
        let (buffer, block) = device
            .allocate_buffer(&BufferAllocDesc {
                size: 100,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
                name: "staging",
            })
            .expect("buffer");
        assert!(block.mapped.is_some());
        assert_eq!(block.memory_type_index, 1);
        assert_eq!(device.memory_used(), 100);

        let err = device
            .allocate_buffer(&BufferAllocDesc {
                size: 64,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::GpuOnly,
                name: "overflow",
            })
            .unwrap_err();
        assert!(matches!(
            err,
            RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        ));

        device.free_buffer(buffer, block.handle).expect("free");
        assert_eq!(device.memory_used(), 0);
        assert!(device.free_buffer(buffer, block.handle).is_err());
    }

    #[test]
    fn test_huge_request_is_out_of_memory() {
        let device = HeadlessDevice::new(1, 1);
        for location in [MemoryLocation::GpuOnly, MemoryLocation::CpuToGpu] {
            let err = device
                .allocate_buffer(&BufferAllocDesc {
                    size: u64::MAX / 2,
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                    location,
                    name: "huge",
                })
                .unwrap_err();
            assert!(matches!(
                err,
                RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            ));
        }

        let unbounded = HeadlessDevice::new(1, 1).with_memory_budget(u64::MAX);
        let err = unbounded
            .allocate_buffer(&BufferAllocDesc {
                size: u64::MAX,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
                name: "huge-staging",
            })
            .unwrap_err();
        assert!(matches!(
            err,
            RhiError::VulkanError(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(unbounded.memory_used(), 0);
    }

    #[test]
    fn test_memory_handles_are_reused_after_free() {
        let device = HeadlessDevice::new(1, 1).with_memory_handle_reuse();
        let desc = BufferAllocDesc {
            size: 16,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            location: MemoryLocation::GpuOnly,
            name: "uniforms",
        };
        let (first, first_block) = device.allocate_buffer(&desc).expect("buffer");
        device.free_buffer(first, first_block.handle).expect("free");

        let (_second, second_block) = device.allocate_buffer(&desc).expect("buffer");
        assert_eq!(second_block.memory, first_block.memory);
        assert_ne!(second_block.handle, first_block.handle);
    }

    fn swapchain_for(device: &HeadlessDevice, extent: vk::Extent2D) -> vk::SwapchainKHR {
        let surface = device
            .create_surface(&SurfaceTarget::Headless {
                width: extent.width,
                height: extent.height,
            })
            .expect("surface");
        device
            .create_swapchain(&SwapchainDesc {
                surface,
                image_count: 2,
                surface_format: vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                extent,
                present_mode: vk::PresentModeKHR::FIFO,
                pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                old_swapchain: vk::SwapchainKHR::null(),
            })
            .expect("swapchain")
    }

    #[test]
    fn test_acquire_failures_apply_once() {
        let device = HeadlessDevice::new(32, 32);
        let swapchain = swapchain_for(&device, vk::Extent2D { width: 32, height: 32 });
        let timeout = Duration::from_millis(30);

        device.fail_next_acquire(AcquireFailure::Timeout);
        let start = Instant::now();
        let outcome = device
            .acquire_next_image(swapchain, timeout, vk::Semaphore::null())
            .expect("acquire");
        assert_eq!(outcome, AcquireOutcome::Stale);
        assert!(start.elapsed() >= timeout);

        device.fail_next_acquire(AcquireFailure::Suboptimal);
        let outcome = device
            .acquire_next_image(swapchain, timeout, vk::Semaphore::null())
            .expect("acquire");
        assert_eq!(
            outcome,
            AcquireOutcome::Acquired {
                index: 0,
                suboptimal: true
            }
        );

        let outcome = device
            .acquire_next_image(swapchain, timeout, vk::Semaphore::null())
            .expect("acquire");
        assert_eq!(
            outcome,
            AcquireOutcome::Acquired {
                index: 1,
                suboptimal: false
            }
        );
        assert_eq!(device.counters().acquires, 3);
    }

    #[test]
    fn test_undefined_extent_checks_against_clamped_size() {
        let device = HeadlessDevice::new(5000, 5000)
            .with_max_extent(4096, 4096)
            .with_undefined_extent();
        let swapchain = swapchain_for(&device, vk::Extent2D { width: 4096, height: 4096 });

        let surface = vk::SurfaceKHR::from_raw(
            *device.lock().surfaces.iter().next().expect("surface"),
        );
        let support = device.surface_support(surface).expect("support");
        assert_eq!(support.capabilities.current_extent.width, u32::MAX);
        assert_eq!(support.capabilities.max_image_extent.width, 4096);

        assert!(matches!(
            device.acquire_next_image(swapchain, Duration::ZERO, vk::Semaphore::null()),
            Ok(AcquireOutcome::Acquired { .. })
        ));
        device.resize_surface(800, 600);
        assert!(matches!(
            device.acquire_next_image(swapchain, Duration::ZERO, vk::Semaphore::null()),
            Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DATE_KHR))
        ));
    }
}
