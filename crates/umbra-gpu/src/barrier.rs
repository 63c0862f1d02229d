//! Barrier engine.
//!
//! A barrier describes one transition of one resource. Access masks come from
//! a closed table of legal transitions; pipeline stage masks are derived from
//! the access masks alone, so the same transition always produces the same
//! barrier. Asking for a transition outside the table is a programmer error
//! and panics.

use ash::vk;
use ash::vk::ImageLayout as Layout;

use crate::resource::{Buffer, Image};

const NONE: vk::AccessFlags = vk::AccessFlags::empty();
const TRANSFER_READ: vk::AccessFlags = vk::AccessFlags::TRANSFER_READ;
const TRANSFER_WRITE: vk::AccessFlags = vk::AccessFlags::TRANSFER_WRITE;
const SHADER_READ: vk::AccessFlags = vk::AccessFlags::SHADER_READ;
const UNIFORM_READ: vk::AccessFlags = vk::AccessFlags::UNIFORM_READ;
const VERTEX_READ: vk::AccessFlags = vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
const INDEX_READ: vk::AccessFlags = vk::AccessFlags::INDEX_READ;
const HOST_READ: vk::AccessFlags = vk::AccessFlags::HOST_READ;
const HOST_WRITE: vk::AccessFlags = vk::AccessFlags::HOST_WRITE;
const COLOR_WRITE: vk::AccessFlags = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
const DEPTH_WRITE: vk::AccessFlags = vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
const DEPTH_READ_WRITE: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
);
const MEMORY_READ: vk::AccessFlags = vk::AccessFlags::MEMORY_READ;

/// One legal image layout transition and the access masks it implies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

const fn image_transition(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> ImageTransition {
    ImageTransition {
        old_layout,
        new_layout,
        src_access,
        dst_access,
    }
}

/// Every image layout transition the renderer issues.
pub const IMAGE_TRANSITIONS: &[ImageTransition] = &[
    // Uploads.
    image_transition(Layout::UNDEFINED, Layout::TRANSFER_DST_OPTIMAL, NONE, TRANSFER_WRITE),
    image_transition(Layout::TRANSFER_DST_OPTIMAL, Layout::SHADER_READ_ONLY_OPTIMAL, TRANSFER_WRITE, SHADER_READ),
    image_transition(Layout::SHADER_READ_ONLY_OPTIMAL, Layout::TRANSFER_DST_OPTIMAL, SHADER_READ, TRANSFER_WRITE),
    image_transition(Layout::UNDEFINED, Layout::SHADER_READ_ONLY_OPTIMAL, NONE, SHADER_READ),
    // Render targets.
    image_transition(Layout::UNDEFINED, Layout::COLOR_ATTACHMENT_OPTIMAL, NONE, COLOR_WRITE),
    image_transition(Layout::UNDEFINED, Layout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL, NONE, DEPTH_READ_WRITE),
    image_transition(Layout::COLOR_ATTACHMENT_OPTIMAL, Layout::SHADER_READ_ONLY_OPTIMAL, COLOR_WRITE, SHADER_READ),
    image_transition(Layout::SHADER_READ_ONLY_OPTIMAL, Layout::COLOR_ATTACHMENT_OPTIMAL, SHADER_READ, COLOR_WRITE),
    image_transition(Layout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL, Layout::DEPTH_STENCIL_READ_ONLY_OPTIMAL, DEPTH_WRITE, SHADER_READ),
    image_transition(Layout::DEPTH_STENCIL_READ_ONLY_OPTIMAL, Layout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL, SHADER_READ, DEPTH_READ_WRITE),
    // Presentation.
    image_transition(Layout::UNDEFINED, Layout::PRESENT_SRC_KHR, NONE, MEMORY_READ),
    image_transition(Layout::COLOR_ATTACHMENT_OPTIMAL, Layout::PRESENT_SRC_KHR, COLOR_WRITE, MEMORY_READ),
    image_transition(Layout::PRESENT_SRC_KHR, Layout::COLOR_ATTACHMENT_OPTIMAL, NONE, COLOR_WRITE),
];

/// Every buffer access transition the renderer issues, as (old, new).
pub const BUFFER_TRANSITIONS: &[(vk::AccessFlags, vk::AccessFlags)] = &[
    // Staged uploads.
    (NONE, TRANSFER_WRITE),
    (TRANSFER_WRITE, VERTEX_READ),
    (TRANSFER_WRITE, INDEX_READ),
    (TRANSFER_WRITE, UNIFORM_READ),
    (TRANSFER_WRITE, SHADER_READ),
    (HOST_WRITE, TRANSFER_READ),
    // Per-frame rewrite cycles.
    (UNIFORM_READ, TRANSFER_WRITE),
    (VERTEX_READ, TRANSFER_WRITE),
    (HOST_WRITE, UNIFORM_READ),
    (HOST_WRITE, VERTEX_READ),
    // Readback.
    (TRANSFER_WRITE, HOST_READ),
];

const fn stages(a: vk::PipelineStageFlags, b: vk::PipelineStageFlags) -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::from_raw(a.as_raw() | b.as_raw())
}

/// Stages that perform each access.
const ACCESS_STAGES: &[(vk::AccessFlags, vk::PipelineStageFlags)] = &[
    (vk::AccessFlags::INDIRECT_COMMAND_READ, vk::PipelineStageFlags::DRAW_INDIRECT),
    (vk::AccessFlags::INDEX_READ, vk::PipelineStageFlags::VERTEX_INPUT),
    (vk::AccessFlags::VERTEX_ATTRIBUTE_READ, vk::PipelineStageFlags::VERTEX_INPUT),
    (
        vk::AccessFlags::UNIFORM_READ,
        stages(vk::PipelineStageFlags::VERTEX_SHADER, vk::PipelineStageFlags::FRAGMENT_SHADER),
    ),
    (vk::AccessFlags::INPUT_ATTACHMENT_READ, vk::PipelineStageFlags::FRAGMENT_SHADER),
    (
        vk::AccessFlags::SHADER_READ,
        stages(vk::PipelineStageFlags::VERTEX_SHADER, vk::PipelineStageFlags::FRAGMENT_SHADER),
    ),
    (vk::AccessFlags::SHADER_WRITE, vk::PipelineStageFlags::FRAGMENT_SHADER),
    (vk::AccessFlags::COLOR_ATTACHMENT_READ, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT),
    (vk::AccessFlags::COLOR_ATTACHMENT_WRITE, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT),
    (
        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        stages(
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
    ),
    (
        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        stages(
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
    ),
    (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER),
    (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER),
    (vk::AccessFlags::HOST_READ, vk::PipelineStageFlags::HOST),
    (vk::AccessFlags::HOST_WRITE, vk::PipelineStageFlags::HOST),
    (vk::AccessFlags::MEMORY_READ, vk::PipelineStageFlags::BOTTOM_OF_PIPE),
    (vk::AccessFlags::MEMORY_WRITE, vk::PipelineStageFlags::ALL_COMMANDS),
];

/// Look up the access masks of an image layout transition.
pub fn image_transition_access(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> Option<(vk::AccessFlags, vk::AccessFlags)> {
    IMAGE_TRANSITIONS
        .iter()
        .find(|t| t.old_layout == old_layout && t.new_layout == new_layout)
        .map(|t| (t.src_access, t.dst_access))
}

/// Returns true if a buffer may move from `old_access` to `new_access`.
pub fn buffer_transition_allowed(old_access: vk::AccessFlags, new_access: vk::AccessFlags) -> bool {
    BUFFER_TRANSITIONS.contains(&(old_access, new_access))
}

fn stages_for(access: vk::AccessFlags, empty: vk::PipelineStageFlags) -> vk::PipelineStageFlags {
    if access.is_empty() {
        return empty;
    }
    let mut remaining = access;
    let mut mask = vk::PipelineStageFlags::empty();
    for &(bit, stage) in ACCESS_STAGES {
        if access.contains(bit) {
            mask |= stage;
            remaining &= !bit;
        }
    }
    assert!(
        remaining.is_empty(),
        "no pipeline stage mapping for access {remaining:?}"
    );
    mask
}

/// Stages that must complete before the barrier, derived from `access`.
pub fn src_stages(access: vk::AccessFlags) -> vk::PipelineStageFlags {
    stages_for(access, vk::PipelineStageFlags::TOP_OF_PIPE)
}

/// Stages that wait on the barrier, derived from `access`.
pub fn dst_stages(access: vk::AccessFlags) -> vk::PipelineStageFlags {
    stages_for(access, vk::PipelineStageFlags::BOTTOM_OF_PIPE)
}

/// Aspect mask implied by an image format.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Layout transition of a whole single-mip image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl ImageBarrier {
    /// Build the barrier for `image` moving from `old_layout` to `new_layout`.
    ///
    /// Panics if the transition is not in [`IMAGE_TRANSITIONS`].
    #[track_caller]
    pub fn new(image: &Image, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        Self::for_raw(image.raw, image.aspect, old_layout, new_layout)
    }

    /// Same as [`ImageBarrier::new`] for an image not owned by the device arena.
    #[track_caller]
    pub fn for_raw(
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        let Some((src_access, dst_access)) = image_transition_access(old_layout, new_layout) else {
            tracing::error!(?old_layout, ?new_layout, "unmapped image layout transition");
            panic!("unmapped image layout transition {old_layout:?} -> {new_layout:?}");
        };
        Self {
            image,
            aspect,
            old_layout,
            new_layout,
            src_access,
            dst_access,
            src_stage: src_stages(src_access),
            dst_stage: dst_stages(dst_access),
        }
    }

    /// Vulkan form of this barrier.
    pub fn to_vk(&self) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(self.aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            )
    }
}

/// Access transition of a whole buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub size: u64,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl BufferBarrier {
    /// Build the barrier for `buffer` moving from `old_access` to `new_access`.
    ///
    /// Panics if the transition is not in [`BUFFER_TRANSITIONS`].
    #[track_caller]
    pub fn new(buffer: &Buffer, old_access: vk::AccessFlags, new_access: vk::AccessFlags) -> Self {
        if !buffer_transition_allowed(old_access, new_access) {
            tracing::error!(?old_access, ?new_access, "unmapped buffer access transition");
            panic!("unmapped buffer access transition {old_access:?} -> {new_access:?}");
        }
        Self {
            buffer: buffer.raw,
            size: buffer.size,
            src_access: old_access,
            dst_access: new_access,
            src_stage: src_stages(old_access),
            dst_stage: dst_stages(new_access),
        }
    }

    /// Vulkan form of this barrier.
    pub fn to_vk(&self) -> vk::BufferMemoryBarrier<'static> {
        vk::BufferMemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_allocator::MemoryLocation;

    fn image() -> Image {
        Image {
            raw: vk::Image::null(),
            format: vk::Format::R8G8B8A8_SRGB,
            extent: vk::Extent2D {
                width: 4,
                height: 4,
            },
            usage: vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
            external: false,
        }
    }

    fn buffer() -> Buffer {
        Buffer {
            raw: vk::Buffer::null(),
            size: 256,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            location: MemoryLocation::GpuOnly,
        }
    }

    #[test]
    fn upload_transition_masks() {
        let barrier = ImageBarrier::new(
            &image(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(barrier.src_access, vk::AccessFlags::empty());
        assert_eq!(barrier.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(barrier.dst_stage, vk::PipelineStageFlags::TRANSFER);
    }

    #[test]
    fn sample_after_copy_waits_on_transfer() {
        let barrier = ImageBarrier::new(
            &image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert!(barrier
            .dst_stage
            .contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
    }

    #[test]
    fn gbuffer_read_waits_on_color_output() {
        let barrier = ImageBarrier::new(
            &image(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(
            barrier.src_stage,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
    }

    #[test]
    fn depth_stages_cover_both_fragment_tests() {
        let stages = dst_stages(DEPTH_READ_WRITE);
        assert!(stages.contains(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS));
        assert!(stages.contains(vk::PipelineStageFlags::LATE_FRAGMENT_TESTS));
    }

    #[test]
    fn stage_masks_depend_only_on_access_masks() {
        // Rebuild every transition in reverse order and compare against a
        // forward pass.
        let forward: Vec<_> = IMAGE_TRANSITIONS
            .iter()
            .map(|t| ImageBarrier::new(&image(), t.old_layout, t.new_layout))
            .collect();
        let mut backward: Vec<_> = IMAGE_TRANSITIONS
            .iter()
            .rev()
            .map(|t| ImageBarrier::new(&image(), t.old_layout, t.new_layout))
            .collect();
        backward.reverse();
        assert_eq!(forward, backward);

        for (t, barrier) in IMAGE_TRANSITIONS.iter().zip(&forward) {
            assert_eq!(barrier.src_stage, src_stages(t.src_access));
            assert_eq!(barrier.dst_stage, dst_stages(t.dst_access));
        }

        for &(old, new) in BUFFER_TRANSITIONS {
            let a = BufferBarrier::new(&buffer(), old, new);
            let b = BufferBarrier::new(&buffer(), old, new);
            assert_eq!(a, b);
            assert_eq!(a.src_stage, src_stages(old));
            assert_eq!(a.dst_stage, dst_stages(new));
        }
    }

    #[test]
    fn transition_table_has_no_duplicates() {
        for (i, a) in IMAGE_TRANSITIONS.iter().enumerate() {
            for b in &IMAGE_TRANSITIONS[i + 1..] {
                assert!(
                    !(a.old_layout == b.old_layout && a.new_layout == b.new_layout),
                    "duplicate transition {:?} -> {:?}",
                    a.old_layout,
                    a.new_layout
                );
            }
        }
    }

    #[test]
    #[should_panic(expected = "unmapped image layout transition")]
    fn unmapped_image_transition_panics() {
        ImageBarrier::new(
            &image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
    }

    #[test]
    #[should_panic(expected = "unmapped buffer access transition")]
    fn unmapped_buffer_transition_panics() {
        BufferBarrier::new(
            &buffer(),
            vk::AccessFlags::INDEX_READ,
            vk::AccessFlags::HOST_WRITE,
        );
    }

    #[test]
    fn uniform_cycle_is_legal_both_ways() {
        assert!(buffer_transition_allowed(UNIFORM_READ, TRANSFER_WRITE));
        assert!(buffer_transition_allowed(TRANSFER_WRITE, UNIFORM_READ));
    }

    #[test]
    fn depth_format_aspect() {
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::R16G16B16A16_SFLOAT),
            vk::ImageAspectFlags::COLOR
        );
    }
}
