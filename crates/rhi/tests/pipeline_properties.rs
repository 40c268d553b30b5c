//! Ordering and bookkeeping properties of the rhi components on the headless backend.

use std::sync::Arc;
use std::time::Duration;

use cadence_rhi::command::CommandLayer;
use cadence_rhi::device::{GpuContext, SurfaceTarget};
use cadence_rhi::headless::HeadlessDevice;
use cadence_rhi::memory::{BufferResource, ImageResource, MemoryAllocator, MemoryHint};
use cadence_rhi::registry::AllocationRegistry;
use cadence_rhi::swapchain::{SwapchainManager, SwapchainProperties};
use cadence_rhi::sync::SyncManager;
use cadence_rhi::vk;

#[test]
fn test_registry_tracks_allocations_minus_frees() {
    let backend = Arc::new(HeadlessDevice::new(64, 64));
    let context = GpuContext::from_backend(backend.clone());
    let registry = Arc::new(AllocationRegistry::new());
    let memory = MemoryAllocator::new(&context, registry.clone());

    let mut images: Vec<ImageResource> = Vec::new();
    let mut buffers: Vec<BufferResource> = Vec::new();
    let mut allocated = 0usize;
    let mut freed = 0usize;

    // Deterministic interleaving of allocations and frees.
    for step in 0..60u32 {
        match step % 5 {
            0 | 1 => {
                let extent = vk::Extent2D {
                    width: 8 + step,
                    height: 8,
                };
                images.push(
                    memory
                        .create_image(
                            vk::Format::R8G8B8A8_UNORM,
                            extent,
                            vk::ImageUsageFlags::SAMPLED,
                            MemoryHint::DEVICE_LOCAL,
                            "texture",
                        )
                        .expect("image"),
                );
                allocated += 1;
            }
            2 => {
                buffers.push(
                    memory
                        .create_buffer(
                            256,
                            vk::BufferUsageFlags::UNIFORM_BUFFER,
                            MemoryHint::UPLOAD,
                            "uniforms",
                        )
                        .expect("buffer"),
                );
                allocated += 1;
            }
            3 => {
                if let Some(mut image) = images.pop() {
                    memory.destroy_image(&mut image);
                    // Second destroy must not double count.
                    memory.destroy_image(&mut image);
                    freed += 1;
                }
            }
            _ => {
                if let Some(mut buffer) = buffers.pop() {
                    memory.destroy_buffer(&mut buffer);
                    freed += 1;
                }
            }
        }

        assert_eq!(registry.live_count(), allocated - freed);
        let snapshot = registry.snapshot();
        let mut identities: Vec<_> = snapshot.iter().map(|r| r.identity()).collect();
        identities.sort_by_key(|(index, memory)| (*index, vk::Handle::as_raw(*memory)));
        identities.dedup();
        assert_eq!(identities.len(), snapshot.len(), "duplicate identity at step {step}");
    }

    for image in &mut images {
        memory.destroy_image(image);
    }
    for buffer in &mut buffers {
        memory.destroy_buffer(buffer);
    }
    assert_eq!(registry.live_count(), 0);
    assert_eq!(backend.live_allocations(), 0);
}

#[test]
fn test_pool_reset_never_sees_pending_work() {
    let backend = Arc::new(HeadlessDevice::new(64, 64));
    let context = GpuContext::from_backend(backend.clone());
    let mut sync =
        SyncManager::create_all(&context, 3, Duration::from_secs(5)).expect("sync objects");
    let mut commands = CommandLayer::new(&context, 3).expect("command layer");
    let queue = context.device().graphics_queue();
    backend.set_stalled(true);

    let completer = {
        let backend = backend.clone();
        std::thread::spawn(move || {
            let mut completed = 0;
            while completed < 27 {
                if backend.complete_next() {
                    completed += 1;
                } else {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        })
    };

    for frame in 0..30 {
        let slot = frame % 3;
        sync.wait_and_reset(slot, &mut commands).expect("wait and reset");
        commands
            .record_and_submit(slot, queue, &mut sync, |_| Ok(()))
            .expect("submit");
        assert!(backend.outstanding_submissions() <= 3);
    }
    completer.join().expect("completer");

    let counters = backend.counters();
    assert_eq!(counters.submissions, 30);
    assert_eq!(counters.pool_resets, 30);
    assert_eq!(counters.fence_order_violations, 0);
    assert!(counters.max_outstanding <= 3);
}

#[test]
fn test_swapchain_lifecycle_releases_in_order() {
    let backend = Arc::new(HeadlessDevice::new(300, 200));
    let context = GpuContext::from_backend(backend.clone());
    let mut swapchain = SwapchainManager::new(&context, Duration::from_millis(100));

    swapchain
        .create_surface(&SurfaceTarget::Headless {
            width: 300,
            height: 200,
        })
        .expect("surface");
    let support = swapchain.query_support().expect("support");
    let properties = SwapchainProperties::select(&support, 300, 200).expect("properties");
    swapchain.create(properties, &support).expect("swapchain");
    assert_eq!(backend.live_image_views(), swapchain.images().len());

    swapchain.destroy();
    swapchain.destroy();
    assert_eq!(backend.live_image_views(), 0);
    assert_eq!(backend.live_swapchains(), 0);
    assert_eq!(backend.live_surfaces(), 0);
}

#[test]
fn test_registry_accepts_reused_memory_handles() {
    let backend = Arc::new(HeadlessDevice::new(64, 64).with_memory_handle_reuse());
    let context = GpuContext::from_backend(backend.clone());
    let registry = Arc::new(AllocationRegistry::new());
    let memory = MemoryAllocator::new(&context, registry.clone());

    let mut staging = memory
        .create_buffer(
            512,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryHint::UPLOAD,
            "staging",
        )
        .expect("staging buffer");
    let first = registry.snapshot()[0].identity();
    memory.destroy_buffer(&mut staging);
    assert_eq!(registry.live_count(), 0);

    let mut uniforms = memory
        .create_buffer(
            256,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryHint::UPLOAD,
            "uniforms",
        )
        .expect("uniform buffer");

    // The driver handed back the same memory object; it is a new allocation.
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].identity(), first);
    assert_eq!(snapshot[0].tag, "uniforms");
    assert_eq!(snapshot[0].size, 256);
    assert_eq!(registry.live_count(), 1);

    memory.destroy_buffer(&mut uniforms);
    assert_eq!(registry.live_count(), 0);
    assert_eq!(backend.live_allocations(), 0);
}
