//! Clear-screen renderer used by the `cadence` binary.
//!
//! Records a single dynamic-rendering pass that clears the acquired image
//! (and the depth target when present) and leaves it ready to present.

use std::time::Duration;

use ash::vk;
use tracing::warn;

use cadence_renderer::{FrameContext, FrameRenderer};
use cadence_rhi::RhiResult;
use cadence_rhi::memory::view_aspect;

/// Base clear color; the blue channel pulses slowly over time.
const CLEAR_COLOR: [f32; 4] = [0.1, 0.1, 0.15, 1.0];

#[derive(Debug, Default)]
pub struct ClearRenderer {
    elapsed: Duration,
}

impl ClearRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the time used to animate the clear color.
    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
    }

    fn clear_color(&self) -> [f32; 4] {
        let pulse = (self.elapsed.as_secs_f32() * 0.5).sin() * 0.5 + 0.5;
        let [r, g, b, a] = CLEAR_COLOR;
        [r, g, b + pulse * 0.1, a]
    }
}

impl FrameRenderer for ClearRenderer {
    fn record(&mut self, frame: &FrameContext<'_>) -> RhiResult<()> {
        // The software backend has no command stream to record into.
        let Some(device) = frame.device.raw_device() else {
            return Ok(());
        };
        let cmd = frame.command_buffer;

        transition(
            device,
            cmd,
            frame.image.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(frame.image.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color(),
                },
            });
        let color_attachments = [color_attachment];

        let depth_attachment = frame.depth.map(|depth| {
            let aspect = view_aspect(depth.format);
            let layout = depth_layout(aspect);
            transition(
                device,
                cmd,
                depth.image,
                vk::ImageLayout::UNDEFINED,
                layout,
                aspect,
            );
            let attachment = vk::RenderingAttachmentInfo::default()
                .image_view(depth.view)
                .image_layout(layout)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                });
            (attachment, aspect)
        });

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: frame.extent,
        };
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some((depth_attachment, aspect)) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
            if aspect.contains(vk::ImageAspectFlags::STENCIL) {
                rendering_info = rendering_info.stencil_attachment(depth_attachment);
            }
        }

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_end_rendering(cmd);
        }
        Ok(())
    }

    fn record_overlay(&mut self, frame: &FrameContext<'_>) -> RhiResult<()> {
        let Some(device) = frame.device.raw_device() else {
            return Ok(());
        };
        transition(
            device,
            frame.command_buffer,
            frame.image.image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageAspectFlags::COLOR,
        );
        Ok(())
    }
}

fn depth_layout(aspect: vk::ImageAspectFlags) -> vk::ImageLayout {
    if aspect.contains(vk::ImageAspectFlags::STENCIL) {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
    }
}

/// Records an image layout transition barrier.
fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    aspect_mask: vk::ImageAspectFlags,
) {
    let (src_stage, src_access, dst_stage, dst_access) = match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL) => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        (
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
            | vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ) => (
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
        ),
        _ => {
            warn!(
                "Unhandled layout transition: {:?} -> {:?}",
                old_layout, new_layout
            );
            (
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            )
        }
    };

    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect_mask)
                .level_count(1)
                .layer_count(1),
        )
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}
