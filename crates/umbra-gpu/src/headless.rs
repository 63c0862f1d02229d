//! CPU implementation of [`Backend`].
//!
//! Queue operations are not executed when submitted. They are appended to a
//! FIFO and run only when the CPU waits on a fence or on the whole device,
//! which makes every missing synchronization step observable: touching a
//! resource that queued work still references, waiting on a fence nothing
//! will signal, or reusing a semaphore before its signal was consumed all
//! panic with a description of the hazard.
//!
//! Buffers and images hold real bytes, so copies and clears can be checked
//! by reading contents back.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::backend::{
    Backend, BufferDesc, ClearValue, Command, DescriptorBinding, DescriptorResource,
    DescriptorWrite, FramebufferDesc, ImageDesc, ImageViewDesc, MappedMemory, RenderPassDesc,
    SamplerDesc, SubmitInfo, SwapchainInfo,
};
use crate::error::{GpuError, Result};
use crate::pipeline::{validate_spirv, GraphicsPipelineConfig};

/// Present-image behaviour of a [`HeadlessBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadlessConfig {
    pub image_count: u32,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    /// Sequence of image indices returned by acquisition, repeated.
    /// `None` hands images out round-robin.
    pub acquire_order: Option<Vec<u32>>,
    /// Cap on the bytes of all live buffers and images, present images
    /// included. Creation beyond it fails with an allocation error.
    pub memory_budget: Option<u64>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            image_count: 3,
            extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            format: vk::Format::B8G8R8A8_UNORM,
            acquire_order: None,
            memory_budget: None,
        }
    }
}

/// Counters accumulated by a [`HeadlessBackend`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub live_buffers: usize,
    pub live_images: usize,
    /// Bytes held by live buffers and images.
    pub memory_used: u64,
    pub submissions: u64,
    pub draws: u64,
    pub indexed_draws: u64,
    pub copies: u64,
    pub bytes_copied: u64,
    pub barriers: u64,
    pub presents: u64,
    pub fence_waits: u64,
    pub host_maps: u64,
}

/// Writes one buffer has received since creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferWrites {
    pub host_maps: u64,
    /// Copy regions executed with the buffer as destination.
    pub transfers: u64,
}

struct BufferState {
    data: Box<[u8]>,
    mapped: bool,
    writes: BufferWrites,
}

struct ImageState {
    data: Box<[u8]>,
    extent: vk::Extent2D,
    format: vk::Format,
    texel: usize,
    layout: vk::ImageLayout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmdState {
    Initial,
    Recording,
    Executable,
    Pending,
}

struct CmdBuffer {
    pool: vk::CommandPool,
    state: CmdState,
    commands: Vec<Command>,
}

struct DescriptorSetState {
    pool: vk::DescriptorPool,
    bindings: Vec<DescriptorBinding>,
    writes: HashMap<(u32, u32), DescriptorResource>,
}

struct FramebufferState {
    attachments: Vec<vk::ImageView>,
}

enum Op {
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        waits: Vec<vk::Semaphore>,
        signals: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    Acquire {
        semaphore: vk::Semaphore,
    },
    Present {
        image: u32,
        waits: Vec<vk::Semaphore>,
    },
}

#[derive(Default)]
struct References {
    buffers: HashSet<vk::Buffer>,
    images: HashSet<vk::Image>,
    sets: HashSet<vk::DescriptorSet>,
}

struct Swapchain {
    images: Vec<vk::Image>,
    held: Vec<bool>,
    extent: vk::Extent2D,
    acquisitions: usize,
    out_of_date: bool,
}

#[derive(Default)]
struct State {
    buffers: HashMap<vk::Buffer, BufferState>,
    images: HashMap<vk::Image, ImageState>,
    views: HashMap<vk::ImageView, vk::Image>,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashMap<vk::Semaphore, bool>,
    pools: HashSet<vk::CommandPool>,
    cmds: HashMap<vk::CommandBuffer, CmdBuffer>,
    set_layouts: HashMap<vk::DescriptorSetLayout, Vec<DescriptorBinding>>,
    descriptor_pools: HashSet<vk::DescriptorPool>,
    sets: HashMap<vk::DescriptorSet, DescriptorSetState>,
    render_passes: HashMap<vk::RenderPass, RenderPassDesc>,
    framebuffers: HashMap<vk::Framebuffer, FramebufferState>,
    queue: VecDeque<Op>,
    swapchain: Option<Swapchain>,
    stats: HeadlessStats,
}

/// GPU simulation on the CPU.
pub struct HeadlessBackend {
    config: HeadlessConfig,
    next_handle: AtomicU64,
    state: Mutex<State>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

fn texel_size(format: vk::Format) -> usize {
    match format {
        vk::Format::R8_UNORM => 1,
        vk::Format::R16G16B16A16_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => 4,
    }
}

fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn encode_clear(format: vk::Format, value: ClearValue, texel: usize) -> Vec<u8> {
    match (value, format) {
        (
            ClearValue::Color(c),
            vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB,
        ) => c.map(unorm8).to_vec(),
        (
            ClearValue::Color(c),
            vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB,
        ) => [c[2], c[1], c[0], c[3]].map(unorm8).to_vec(),
        (ClearValue::Color(c), vk::Format::R32G32B32A32_SFLOAT) => {
            c.iter().flat_map(|v| v.to_le_bytes()).collect()
        }
        (ClearValue::DepthStencil { depth, .. }, vk::Format::D32_SFLOAT) => {
            depth.to_le_bytes().to_vec()
        }
        _ => vec![0; texel],
    }
}

impl HeadlessBackend {
    /// Create a backend with the given present-image behaviour.
    pub fn new(config: HeadlessConfig) -> Self {
        assert!(config.image_count > 0, "headless swapchain needs an image");
        if let Some(order) = &config.acquire_order {
            assert!(!order.is_empty(), "empty acquire order");
            assert!(
                order.iter().all(|&i| i < config.image_count),
                "acquire order names an image beyond image_count"
            );
        }
        let backend = Self {
            config,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(State::default()),
        };
        let extent = backend.config.extent;
        let swapchain = backend.build_swapchain(&mut backend.state.lock(), extent);
        backend.state.lock().swapchain = Some(swapchain);
        backend
    }

    fn check_budget(&self, state: &State, bytes: u64) -> Result<()> {
        match self.config.memory_budget {
            Some(budget) if state.memory_used() + bytes > budget => {
                Err(GpuError::AllocationFailed(format!(
                    "{bytes} bytes requested, {} of {budget} in use",
                    state.memory_used()
                )))
            }
            _ => Ok(()),
        }
    }

    fn handle<T: Handle>(&self) -> T {
        T::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn new_image(&self, state: &mut State, extent: vk::Extent2D, format: vk::Format) -> vk::Image {
        let texel = texel_size(format);
        let raw = self.handle();
        state.images.insert(
            raw,
            ImageState {
                data: vec![0; extent.width as usize * extent.height as usize * texel].into(),
                extent,
                format,
                texel,
                layout: vk::ImageLayout::UNDEFINED,
            },
        );
        raw
    }

    fn build_swapchain(&self, state: &mut State, extent: vk::Extent2D) -> Swapchain {
        let images = (0..self.config.image_count)
            .map(|_| self.new_image(state, extent, self.config.format))
            .collect();
        Swapchain {
            images,
            held: vec![false; self.config.image_count as usize],
            extent,
            acquisitions: 0,
            out_of_date: false,
        }
    }

    /// Bytes currently stored in `buffer`.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        let state = self.state.lock();
        match state.buffers.get(&buffer) {
            Some(b) => b.data.to_vec(),
            None => panic!("unknown buffer {buffer:?}"),
        }
    }

    /// Host maps and transfers `buffer` has received so far.
    pub fn buffer_writes(&self, buffer: vk::Buffer) -> BufferWrites {
        match self.state.lock().buffers.get(&buffer) {
            Some(b) => b.writes,
            None => panic!("unknown buffer {buffer:?}"),
        }
    }

    /// Bytes currently stored in `image`, rows tightly packed.
    pub fn image_contents(&self, image: vk::Image) -> Vec<u8> {
        let state = self.state.lock();
        match state.images.get(&image) {
            Some(i) => i.data.to_vec(),
            None => panic!("unknown image {image:?}"),
        }
    }

    /// Layout `image` is in after all executed work.
    pub fn image_layout(&self, image: vk::Image) -> vk::ImageLayout {
        let state = self.state.lock();
        match state.images.get(&image) {
            Some(i) => i.layout,
            None => panic!("unknown image {image:?}"),
        }
    }

    /// Commands recorded into `cmd` since it was last begun.
    pub fn recorded_commands(&self, cmd: vk::CommandBuffer) -> Vec<Command> {
        let state = self.state.lock();
        match state.cmds.get(&cmd) {
            Some(c) => c.commands.clone(),
            None => panic!("unknown command buffer {cmd:?}"),
        }
    }

    /// Returns true if `cmd` has been ended and may be submitted.
    pub fn is_executable(&self, cmd: vk::CommandBuffer) -> bool {
        self.state
            .lock()
            .cmds
            .get(&cmd)
            .is_some_and(|c| c.state == CmdState::Executable)
    }

    /// Queue operations not yet executed.
    pub fn pending_operations(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Make the next acquisition report an out-of-date swapchain.
    pub fn mark_out_of_date(&self) {
        if let Some(swapchain) = self.state.lock().swapchain.as_mut() {
            swapchain.out_of_date = true;
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> HeadlessStats {
        let state = self.state.lock();
        HeadlessStats {
            live_buffers: state.buffers.len(),
            live_images: state.images.len(),
            memory_used: state.memory_used(),
            ..state.stats
        }
    }

    fn unmap(&self, buffer: vk::Buffer) {
        if let Some(b) = self.state.lock().buffers.get_mut(&buffer) {
            b.mapped = false;
        }
    }
}

impl State {
    fn memory_used(&self) -> u64 {
        let buffers: usize = self.buffers.values().map(|b| b.data.len()).sum();
        let images: usize = self.images.values().map(|i| i.data.len()).sum();
        (buffers + images) as u64
    }

    fn view_image(&self, view: vk::ImageView) -> vk::Image {
        match self.views.get(&view) {
            Some(image) => *image,
            None => panic!("unknown image view {view:?}"),
        }
    }

    fn collect_set(&self, set: vk::DescriptorSet, refs: &mut References) {
        refs.sets.insert(set);
        let Some(state) = self.sets.get(&set) else {
            return;
        };
        for resource in state.writes.values() {
            match *resource {
                DescriptorResource::UniformBuffer { buffer, .. }
                | DescriptorResource::StorageBuffer { buffer, .. } => {
                    refs.buffers.insert(buffer);
                }
                DescriptorResource::CombinedImageSampler { view, .. } => {
                    if let Some(image) = self.views.get(&view) {
                        refs.images.insert(*image);
                    }
                }
            }
        }
    }

    fn collect_commands(&self, commands: &[Command], refs: &mut References) {
        for command in commands {
            match command {
                Command::PipelineBarrier {
                    image_barriers,
                    buffer_barriers,
                    ..
                } => {
                    refs.images.extend(image_barriers.iter().map(|b| b.image));
                    refs.buffers.extend(buffer_barriers.iter().map(|b| b.buffer));
                }
                Command::CopyBuffer { src, dst, .. } => {
                    refs.buffers.extend([*src, *dst]);
                }
                Command::CopyBufferToImage { src, dst, .. } => {
                    refs.buffers.insert(*src);
                    refs.images.insert(*dst);
                }
                Command::BeginRenderPass { framebuffer, .. } => {
                    if let Some(fb) = self.framebuffers.get(framebuffer) {
                        for view in &fb.attachments {
                            if let Some(image) = self.views.get(view) {
                                refs.images.insert(*image);
                            }
                        }
                    }
                }
                Command::BindVertexBuffer { buffer, .. } | Command::BindIndexBuffer { buffer, .. } => {
                    refs.buffers.insert(*buffer);
                }
                Command::BindDescriptorSet { set, .. } => self.collect_set(*set, refs),
                _ => {}
            }
        }
    }

    /// Resources referenced by queued, unexecuted work.
    fn pending_references(&self) -> References {
        let mut refs = References::default();
        for op in &self.queue {
            if let Op::Submit {
                command_buffers, ..
            } = op
            {
                for cmd in command_buffers {
                    if let Some(c) = self.cmds.get(cmd) {
                        self.collect_commands(&c.commands, &mut refs);
                    }
                }
            }
        }
        refs
    }

    fn fence_queued(&self, fence: vk::Fence) -> bool {
        self.queue
            .iter()
            .any(|op| matches!(op, Op::Submit { fence: f, .. } if *f == fence))
    }

    fn consume(&mut self, semaphore: vk::Semaphore, what: &str) {
        match self.semaphores.get_mut(&semaphore) {
            Some(signaled) if *signaled => *signaled = false,
            Some(_) => panic!(
                "{what} waits on semaphore {semaphore:?} which has no signal operation before it"
            ),
            None => panic!("{what} waits on unknown semaphore {semaphore:?}"),
        }
    }

    fn signal(&mut self, semaphore: vk::Semaphore) {
        match self.semaphores.get_mut(&semaphore) {
            Some(signaled) => {
                assert!(
                    !*signaled,
                    "semaphore {semaphore:?} signaled again before its previous signal was waited on"
                );
                *signaled = true;
            }
            None => panic!("signal of unknown semaphore {semaphore:?}"),
        }
    }

    fn execute_next(&mut self) -> bool {
        let Some(op) = self.queue.pop_front() else {
            return false;
        };
        match op {
            Op::Submit {
                command_buffers,
                waits,
                signals,
                fence,
            } => {
                for semaphore in waits {
                    self.consume(semaphore, "submission");
                }
                for cmd in &command_buffers {
                    let commands = match self.cmds.get(cmd) {
                        Some(c) => c.commands.clone(),
                        None => panic!("submitted command buffer {cmd:?} was freed"),
                    };
                    self.execute(&commands);
                    if let Some(c) = self.cmds.get_mut(cmd) {
                        c.state = CmdState::Executable;
                    }
                }
                for semaphore in signals {
                    self.signal(semaphore);
                }
                if fence != vk::Fence::null() {
                    self.fences.insert(fence, true);
                }
                self.stats.submissions += 1;
            }
            Op::Acquire { semaphore } => self.signal(semaphore),
            Op::Present { image, waits } => {
                for semaphore in waits {
                    self.consume(semaphore, "presentation");
                }
                let raw = self
                    .swapchain
                    .as_ref()
                    .and_then(|s| s.images.get(image as usize).copied());
                if let Some(state) = raw.and_then(|raw| self.images.get(&raw)) {
                    assert_eq!(
                        state.layout,
                        vk::ImageLayout::PRESENT_SRC_KHR,
                        "present image {image} presented in layout {:?}",
                        state.layout
                    );
                }
                self.stats.presents += 1;
            }
        }
        true
    }

    fn run_until_signaled(&mut self, fence: vk::Fence) {
        loop {
            match self.fences.get(&fence) {
                Some(true) => return,
                Some(false) => {}
                None => panic!("wait on unknown fence {fence:?}"),
            }
            assert!(
                self.fence_queued(fence),
                "fence {fence:?} can never be signaled: no pending submission uses it"
            );
            self.execute_next();
        }
    }

    fn image_mut(&mut self, image: vk::Image) -> &mut ImageState {
        match self.images.get_mut(&image) {
            Some(state) => state,
            None => panic!("command references unknown image {image:?}"),
        }
    }

    fn buffer_mut(&mut self, buffer: vk::Buffer) -> &mut BufferState {
        match self.buffers.get_mut(&buffer) {
            Some(state) => state,
            None => panic!("command references unknown buffer {buffer:?}"),
        }
    }

    fn execute(&mut self, commands: &[Command]) {
        let mut pass: Option<(RenderPassDesc, Vec<vk::Image>)> = None;
        let mut pipeline_bound = false;
        let mut sets: HashMap<u32, vk::DescriptorSet> = HashMap::new();

        for command in commands {
            match command {
                Command::PipelineBarrier {
                    image_barriers, ..
                } => {
                    for barrier in image_barriers {
                        let image = self.image_mut(barrier.image);
                        if barrier.old_layout != vk::ImageLayout::UNDEFINED {
                            assert_eq!(
                                image.layout, barrier.old_layout,
                                "barrier on {:?} expects layout {:?} but image is in {:?}",
                                barrier.image, barrier.old_layout, image.layout
                            );
                        }
                        image.layout = barrier.new_layout;
                    }
                    self.stats.barriers += 1;
                }
                Command::CopyBuffer { src, dst, regions } => {
                    for region in regions {
                        let (src_start, size) = (region.src_offset as usize, region.size as usize);
                        let bytes = self.buffer_mut(*src).data[src_start..src_start + size].to_vec();
                        let dst_start = region.dst_offset as usize;
                        let target = self.buffer_mut(*dst);
                        target.data[dst_start..dst_start + size].copy_from_slice(&bytes);
                        target.writes.transfers += 1;
                        self.stats.copies += 1;
                        self.stats.bytes_copied += region.size;
                    }
                }
                Command::CopyBufferToImage {
                    src,
                    dst,
                    dst_layout,
                    regions,
                } => {
                    assert_eq!(
                        *dst_layout,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        "copy into image with destination layout {dst_layout:?}"
                    );
                    for region in regions {
                        let src_data = self.buffer_mut(*src).data.clone();
                        let image = self.image_mut(*dst);
                        assert_eq!(
                            image.layout,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            "copy into {dst:?} while it is in {:?}",
                            image.layout
                        );
                        let width = region.image_extent.width as usize;
                        let row_len = match region.buffer_row_length {
                            0 => width,
                            len => len as usize,
                        };
                        let texel = image.texel;
                        let image_width = image.extent.width as usize;
                        for row in 0..region.image_extent.height as usize {
                            let from = region.buffer_offset as usize + row * row_len * texel;
                            let y = region.image_offset.y as usize + row;
                            let to = (y * image_width + region.image_offset.x as usize) * texel;
                            image.data[to..to + width * texel]
                                .copy_from_slice(&src_data[from..from + width * texel]);
                        }
                        let bytes = u64::from(region.image_extent.width)
                            * u64::from(region.image_extent.height)
                            * texel as u64;
                        self.stats.copies += 1;
                        self.stats.bytes_copied += bytes;
                    }
                }
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    clear_values,
                    ..
                } => {
                    assert!(pass.is_none(), "render pass begun inside another");
                    let desc = match self.render_passes.get(render_pass) {
                        Some(desc) => desc.clone(),
                        None => panic!("unknown render pass {render_pass:?}"),
                    };
                    let views = match self.framebuffers.get(framebuffer) {
                        Some(fb) => fb.attachments.clone(),
                        None => panic!("unknown framebuffer {framebuffer:?}"),
                    };
                    let images: Vec<_> = views.iter().map(|v| self.view_image(*v)).collect();
                    for (index, (attachment, &raw)) in desc.attachments().zip(&images).enumerate() {
                        let image = self.image_mut(raw);
                        if attachment.initial_layout != vk::ImageLayout::UNDEFINED {
                            assert_eq!(
                                image.layout, attachment.initial_layout,
                                "attachment {index} is in {:?}, render pass expects {:?}",
                                image.layout, attachment.initial_layout
                            );
                        }
                        if attachment.load_op == vk::AttachmentLoadOp::CLEAR {
                            let value = clear_values.get(index).copied().unwrap_or(
                                ClearValue::Color([0.0; 4]),
                            );
                            let texel = encode_clear(image.format, value, image.texel);
                            for chunk in image.data.chunks_exact_mut(image.texel) {
                                chunk.copy_from_slice(&texel);
                            }
                        }
                        image.layout = if image_is_depth(attachment.format) {
                            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                        } else {
                            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                        };
                    }
                    pass = Some((desc, images));
                }
                Command::EndRenderPass => {
                    let Some((desc, images)) = pass.take() else {
                        panic!("render pass ended without begin");
                    };
                    for (attachment, raw) in desc.attachments().zip(images) {
                        self.image_mut(raw).layout = attachment.final_layout;
                    }
                }
                Command::BindPipeline { .. } => pipeline_bound = true,
                Command::BindDescriptorSet { first_set, set, .. } => {
                    sets.insert(*first_set, *set);
                }
                Command::Draw { .. } | Command::DrawIndexed { .. } => {
                    assert!(pass.is_some(), "draw outside a render pass");
                    assert!(pipeline_bound, "draw without a bound pipeline");
                    for set in sets.values() {
                        self.check_sampled_layouts(*set);
                    }
                    if matches!(command, Command::Draw { .. }) {
                        self.stats.draws += 1;
                    } else {
                        self.stats.indexed_draws += 1;
                    }
                }
                _ => {}
            }
        }
        assert!(pass.is_none(), "command buffer ended inside a render pass");
    }

    fn check_sampled_layouts(&self, set: vk::DescriptorSet) {
        let Some(state) = self.sets.get(&set) else {
            panic!("draw uses freed descriptor set {set:?}");
        };
        for resource in state.writes.values() {
            if let DescriptorResource::CombinedImageSampler { view, layout, .. } = *resource {
                let image = self.view_image(view);
                let current = self.images.get(&image).map(|i| i.layout);
                assert_eq!(
                    current,
                    Some(layout),
                    "sampled image {image:?} is in {current:?}, descriptor expects {layout:?}"
                );
            }
        }
    }
}

fn image_is_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM
    )
}

impl Backend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn supports_location(&self, location: MemoryLocation) -> bool {
        location != MemoryLocation::Unknown
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<vk::Buffer> {
        if !self.supports_location(desc.location) {
            return Err(GpuError::UnsupportedMemoryType(desc.location));
        }
        let len = usize::try_from(desc.size)
            .map_err(|_| GpuError::AllocationFailed(format!("{} bytes", desc.size)))?;
        let mut state = self.state.lock();
        self.check_budget(&state, desc.size)?;
        let raw = self.handle();
        state.buffers.insert(
            raw,
            BufferState {
                data: vec![0; len].into(),
                mapped: false,
                writes: BufferWrites::default(),
            },
        );
        tracing::trace!(name = desc.name, size = desc.size, "headless buffer created");
        Ok(raw)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        assert!(
            !state.pending_references().buffers.contains(&buffer),
            "buffer {buffer:?} destroyed while in use by pending GPU work"
        );
        match state.buffers.remove(&buffer) {
            Some(b) => assert!(!b.mapped, "buffer {buffer:?} destroyed while mapped"),
            None => panic!("destroy of unknown buffer {buffer:?}"),
        }
    }

    fn map_buffer(&self, buffer: vk::Buffer) -> Result<MappedMemory<'_>> {
        let mut state = self.state.lock();
        assert!(
            !state.pending_references().buffers.contains(&buffer),
            "host access to buffer {buffer:?} while pending GPU work uses it"
        );
        state.stats.host_maps += 1;
        let Some(b) = state.buffers.get_mut(&buffer) else {
            panic!("map of unknown buffer {buffer:?}");
        };
        assert!(!b.mapped, "buffer {buffer:?} mapped twice");
        b.mapped = true;
        b.writes.host_maps += 1;
        let len = b.data.len();
        let ptr = NonNull::new(b.data.as_mut_ptr()).unwrap_or(NonNull::dangling());
        drop(state);
        // SAFETY: the allocation lives until destroy_buffer, which refuses
        // mapped buffers, and the mapped flag prevents a second alias.
        Ok(unsafe { MappedMemory::new(ptr, len, Some(Box::new(move || self.unmap(buffer)))) })
    }

    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<vk::Image> {
        if !self.supports_location(desc.location) {
            return Err(GpuError::UnsupportedMemoryType(desc.location));
        }
        let mut state = self.state.lock();
        let bytes = u64::from(desc.extent.width)
            * u64::from(desc.extent.height)
            * texel_size(desc.format) as u64;
        self.check_budget(&state, bytes)?;
        Ok(self.new_image(&mut state, desc.extent, desc.format))
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        assert!(
            !state.pending_references().images.contains(&image),
            "image {image:?} destroyed while in use by pending GPU work"
        );
        if state.images.remove(&image).is_none() {
            panic!("destroy of unknown image {image:?}");
        }
    }

    fn create_image_view(&self, image: vk::Image, _desc: &ImageViewDesc) -> Result<vk::ImageView> {
        let mut state = self.state.lock();
        assert!(state.images.contains_key(&image), "view of unknown image {image:?}");
        let raw = self.handle();
        state.views.insert(raw, image);
        Ok(raw)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().views.remove(&view);
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<vk::Sampler> {
        Ok(self.handle())
    }

    fn destroy_sampler(&self, _sampler: vk::Sampler) {}

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let raw = self.handle();
        self.state.lock().fences.insert(raw, signaled);
        Ok(raw)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        assert!(!state.fence_queued(fence), "fence {fence:?} destroyed while pending");
        state.fences.remove(&fence);
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout_ns: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.fence_waits += 1;
        for &fence in fences {
            state.run_until_signaled(fence);
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        let mut state = self.state.lock();
        for &fence in fences {
            assert!(!state.fence_queued(fence), "reset of fence {fence:?} while pending");
            match state.fences.get_mut(&fence) {
                Some(signaled) => *signaled = false,
                None => panic!("reset of unknown fence {fence:?}"),
            }
        }
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        match self.state.lock().fences.get(&fence) {
            Some(signaled) => Ok(*signaled),
            None => panic!("status of unknown fence {fence:?}"),
        }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let raw = self.handle();
        self.state.lock().semaphores.insert(raw, false);
        Ok(raw)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    fn create_command_pool(&self, _transient: bool) -> Result<vk::CommandPool> {
        let raw = self.handle();
        self.state.lock().pools.insert(raw);
        Ok(raw)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        assert!(
            !state
                .cmds
                .values()
                .any(|c| c.pool == pool && c.state == CmdState::Pending),
            "command pool {pool:?} destroyed with pending command buffers"
        );
        state.cmds.retain(|_, c| c.pool != pool);
        state.pools.remove(&pool);
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        let mut state = self.state.lock();
        for cmd in state.cmds.values_mut().filter(|c| c.pool == pool) {
            assert!(
                cmd.state != CmdState::Pending,
                "command pool {pool:?} reset while one of its command buffers is pending"
            );
            cmd.state = CmdState::Initial;
            cmd.commands.clear();
        }
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let mut state = self.state.lock();
        assert!(state.pools.contains(&pool), "allocation from unknown pool {pool:?}");
        let raw = self.handle();
        state.cmds.insert(
            raw,
            CmdBuffer {
                pool,
                state: CmdState::Initial,
                commands: Vec::new(),
            },
        );
        Ok(raw)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let Some(c) = state.cmds.get_mut(&cmd) else {
            panic!("begin of unknown command buffer {cmd:?}");
        };
        assert!(
            c.state != CmdState::Pending,
            "command buffer {cmd:?} begun while pending execution"
        );
        c.state = CmdState::Recording;
        c.commands.clear();
        Ok(())
    }

    fn record(&self, cmd: vk::CommandBuffer, command: &Command) {
        let mut state = self.state.lock();
        let Some(c) = state.cmds.get_mut(&cmd) else {
            panic!("record into unknown command buffer {cmd:?}");
        };
        assert_eq!(
            c.state,
            CmdState::Recording,
            "command recorded into {cmd:?} outside begin/end"
        );
        c.commands.push(command.clone());
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let Some(c) = state.cmds.get_mut(&cmd) else {
            panic!("end of unknown command buffer {cmd:?}");
        };
        assert_eq!(c.state, CmdState::Recording, "end of {cmd:?} without begin");
        c.state = CmdState::Executable;
        Ok(())
    }

    fn submit(&self, submit: &SubmitInfo<'_>) -> Result<()> {
        let mut state = self.state.lock();
        if submit.fence != vk::Fence::null() {
            match state.fences.get(&submit.fence) {
                Some(false) => {}
                Some(true) => panic!("submit with fence {:?} that is already signaled", submit.fence),
                None => panic!("submit with unknown fence {:?}", submit.fence),
            }
            assert!(
                !state.fence_queued(submit.fence),
                "submit with fence {:?} that is already pending",
                submit.fence
            );
        }

        let mut refs = References::default();
        for cmd in submit.command_buffers {
            let Some(c) = state.cmds.get(cmd) else {
                panic!("submit of unknown command buffer {cmd:?}");
            };
            match c.state {
                CmdState::Executable => {}
                CmdState::Pending => panic!("command buffer {cmd:?} submitted while pending"),
                other => panic!("command buffer {cmd:?} submitted in state {other:?}"),
            }
            state.collect_commands(&c.commands, &mut refs);
        }
        for buffer in &refs.buffers {
            assert!(
                !state.buffers.get(buffer).is_some_and(|b| b.mapped),
                "submitted work uses buffer {buffer:?} while it is mapped"
            );
        }

        for cmd in submit.command_buffers {
            if let Some(c) = state.cmds.get_mut(cmd) {
                c.state = CmdState::Pending;
            }
        }
        state.queue.push_back(Op::Submit {
            command_buffers: submit.command_buffers.to_vec(),
            waits: submit.waits.iter().map(|(s, _)| *s).collect(),
            signals: submit.signals.to_vec(),
            fence: submit.fence,
        });
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.execute_next() {}
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let raw = self.handle();
        self.state.lock().set_layouts.insert(raw, bindings.to_vec());
        Ok(raw)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.lock().set_layouts.remove(&layout);
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let raw = self.handle();
        self.state.lock().descriptor_pools.insert(raw);
        Ok(raw)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let _ = self.reset_descriptor_pool(pool);
        self.state.lock().descriptor_pools.remove(&pool);
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        let mut state = self.state.lock();
        let pending = state.pending_references().sets;
        assert!(
            !state
                .sets
                .iter()
                .any(|(set, s)| s.pool == pool && pending.contains(set)),
            "descriptor pool {pool:?} reset while pending work uses its sets"
        );
        state.sets.retain(|_, s| s.pool != pool);
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let mut state = self.state.lock();
        assert!(
            state.descriptor_pools.contains(&pool),
            "allocation from unknown descriptor pool {pool:?}"
        );
        let Some(bindings) = state.set_layouts.get(&layout).cloned() else {
            panic!("allocation with unknown set layout {layout:?}");
        };
        let raw = self.handle();
        state.sets.insert(
            raw,
            DescriptorSetState {
                pool,
                bindings,
                writes: HashMap::new(),
            },
        );
        Ok(raw)
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        assert!(
            !state.pending_references().sets.contains(&set),
            "descriptor set {set:?} updated while pending work uses it"
        );
        let Some(s) = state.sets.get_mut(&set) else {
            panic!("update of unknown descriptor set {set:?}");
        };
        for write in writes {
            let Some(binding) = s.bindings.iter().find(|b| b.binding == write.binding) else {
                panic!("descriptor write to undeclared binding {}", write.binding);
            };
            assert_eq!(
                binding.ty,
                write.resource.descriptor_type(),
                "descriptor write type mismatch at binding {}",
                write.binding
            );
            s.writes
                .insert((write.binding, write.array_element), write.resource);
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass> {
        let raw = self.handle();
        self.state.lock().render_passes.insert(raw, desc.clone());
        Ok(raw)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state.lock().render_passes.remove(&render_pass);
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc<'_>) -> Result<vk::Framebuffer> {
        let mut state = self.state.lock();
        let Some(pass) = state.render_passes.get(&desc.render_pass) else {
            panic!("framebuffer for unknown render pass {:?}", desc.render_pass);
        };
        assert_eq!(
            pass.attachments().count(),
            desc.attachments.len(),
            "framebuffer attachment count does not match render pass"
        );
        for view in desc.attachments {
            let image = state.view_image(*view);
            let extent = state.images.get(&image).map(|i| i.extent);
            assert_eq!(
                extent,
                Some(desc.extent),
                "framebuffer attachment {view:?} does not match framebuffer extent"
            );
        }
        let raw = self.handle();
        state.framebuffers.insert(
            raw,
            FramebufferState {
                attachments: desc.attachments.to_vec(),
            },
        );
        Ok(raw)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state.lock().framebuffers.remove(&framebuffer);
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        Ok(self.handle())
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {}

    fn create_graphics_pipeline(
        &self,
        config: &GraphicsPipelineConfig,
        _layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
    ) -> Result<vk::Pipeline> {
        validate_spirv(&config.vertex_shader)?;
        validate_spirv(&config.fragment_shader)?;
        let state = self.state.lock();
        match state.render_passes.get(&render_pass) {
            Some(desc) if desc.colors.len() == config.color_attachment_count as usize => {}
            Some(_) => {
                return Err(GpuError::PipelineCreation(
                    "color attachment count does not match render pass".into(),
                ))
            }
            None => panic!("pipeline for unknown render pass {render_pass:?}"),
        }
        Ok(self.handle())
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {}

    fn swapchain(&self) -> Result<SwapchainInfo> {
        let state = self.state.lock();
        let Some(swapchain) = state.swapchain.as_ref() else {
            return Err(GpuError::SwapchainCreation("headless backend has no swapchain".into()));
        };
        Ok(SwapchainInfo {
            images: swapchain.images.clone(),
            format: self.config.format,
            extent: swapchain.extent,
        })
    }

    fn recreate_swapchain(&self, extent: vk::Extent2D) -> Result<SwapchainInfo> {
        {
            let mut state = self.state.lock();
            while state.execute_next() {}
            if let Some(old) = state.swapchain.take() {
                for image in old.images {
                    state.images.remove(&image);
                }
            }
            let swapchain = self.build_swapchain(&mut state, extent);
            state.swapchain = Some(swapchain);
        }
        self.swapchain()
    }

    fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<u32> {
        let mut state = self.state.lock();
        let Some(swapchain) = state.swapchain.as_mut() else {
            return Err(GpuError::SwapchainCreation("headless backend has no swapchain".into()));
        };
        if swapchain.out_of_date {
            return Err(GpuError::SwapchainOutOfDate);
        }
        let index = match &self.config.acquire_order {
            Some(order) => order[swapchain.acquisitions % order.len()],
            None => (swapchain.acquisitions % swapchain.images.len()) as u32,
        };
        swapchain.acquisitions += 1;
        assert!(
            !swapchain.held[index as usize],
            "acquired present image {index} which the application still holds"
        );
        swapchain.held[index as usize] = true;
        state.queue.push_back(Op::Acquire { semaphore: signal });
        Ok(index)
    }

    fn present(&self, image_index: u32, waits: &[vk::Semaphore]) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(swapchain) = state.swapchain.as_mut() else {
            return Err(GpuError::SwapchainCreation("headless backend has no swapchain".into()));
        };
        let Some(held) = swapchain.held.get_mut(image_index as usize) else {
            panic!("present of unknown image {image_index}");
        };
        assert!(*held, "present of image {image_index} that was not acquired");
        *held = false;
        state.queue.push_back(Op::Present {
            image: image_index,
            waits: waits.to_vec(),
        });
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(backend: &HeadlessBackend, size: u64) -> vk::Buffer {
        backend
            .create_buffer(&BufferDesc {
                size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                location: MemoryLocation::CpuToGpu,
                name: "test",
            })
            .unwrap()
    }

    fn recorded(backend: &HeadlessBackend, commands: &[Command]) -> vk::CommandBuffer {
        let pool = backend.create_command_pool(false).unwrap();
        let cmd = backend.allocate_command_buffer(pool).unwrap();
        backend.begin_command_buffer(cmd).unwrap();
        for command in commands {
            backend.record(cmd, command);
        }
        backend.end_command_buffer(cmd).unwrap();
        cmd
    }

    fn submit(backend: &HeadlessBackend, cmd: vk::CommandBuffer, fence: vk::Fence) {
        backend
            .submit(&SubmitInfo {
                command_buffers: &[cmd],
                waits: &[],
                signals: &[],
                fence,
            })
            .unwrap();
    }

    fn copy(src: vk::Buffer, dst: vk::Buffer, size: u64) -> Command {
        Command::CopyBuffer {
            src,
            dst,
            regions: vec![vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            }],
        }
    }

    #[test]
    fn work_runs_only_when_waited() {
        let backend = HeadlessBackend::default();
        let (src, dst) = (buffer(&backend, 4), buffer(&backend, 4));
        backend.map_buffer(src).unwrap().write(0, &[1, 2, 3, 4]);
        let cmd = recorded(&backend, &[copy(src, dst, 4)]);
        let fence = backend.create_fence(false).unwrap();

        submit(&backend, cmd, fence);
        assert_eq!(backend.buffer_contents(dst), [0; 4]);
        assert!(!backend.fence_signaled(fence).unwrap());

        backend.wait_for_fences(&[fence], u64::MAX).unwrap();
        assert_eq!(backend.buffer_contents(dst), [1, 2, 3, 4]);
        assert_eq!(backend.stats().bytes_copied, 4);
    }

    #[test]
    #[should_panic(expected = "while pending GPU work uses it")]
    fn mapping_buffer_in_flight_panics() {
        let backend = HeadlessBackend::default();
        let (src, dst) = (buffer(&backend, 4), buffer(&backend, 4));
        let cmd = recorded(&backend, &[copy(src, dst, 4)]);
        submit(&backend, cmd, vk::Fence::null());
        let _ = backend.map_buffer(src);
    }

    #[test]
    #[should_panic(expected = "submitted while pending")]
    fn resubmitting_pending_command_buffer_panics() {
        let backend = HeadlessBackend::default();
        let cmd = recorded(&backend, &[]);
        submit(&backend, cmd, vk::Fence::null());
        submit(&backend, cmd, vk::Fence::null());
    }

    #[test]
    #[should_panic(expected = "no signal operation before it")]
    fn waiting_on_unsignaled_semaphore_panics() {
        let backend = HeadlessBackend::default();
        let semaphore = backend.create_semaphore().unwrap();
        let cmd = recorded(&backend, &[]);
        backend
            .submit(&SubmitInfo {
                command_buffers: &[cmd],
                waits: &[(semaphore, vk::PipelineStageFlags::TOP_OF_PIPE)],
                signals: &[],
                fence: vk::Fence::null(),
            })
            .unwrap();
        backend.wait_idle().unwrap();
    }

    #[test]
    fn acquire_follows_configured_order() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            acquire_order: Some(vec![2, 0]),
            ..HeadlessConfig::default()
        });
        let semaphore = backend.create_semaphore().unwrap();
        let first = backend.acquire_next_image(semaphore).unwrap();
        assert_eq!(first, 2);
        backend.present(first, &[]).unwrap();
        assert_eq!(backend.acquire_next_image(semaphore).unwrap(), 0);
    }

    #[test]
    #[should_panic(expected = "still holds")]
    fn double_acquire_of_held_image_panics() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            acquire_order: Some(vec![1]),
            ..HeadlessConfig::default()
        });
        let semaphore = backend.create_semaphore().unwrap();
        backend.acquire_next_image(semaphore).unwrap();
        backend.acquire_next_image(semaphore).unwrap();
    }

    #[test]
    fn out_of_date_until_recreated() {
        let backend = HeadlessBackend::default();
        let semaphore = backend.create_semaphore().unwrap();
        backend.mark_out_of_date();
        assert!(matches!(
            backend.acquire_next_image(semaphore),
            Err(GpuError::SwapchainOutOfDate)
        ));
        let info = backend
            .recreate_swapchain(vk::Extent2D {
                width: 32,
                height: 16,
            })
            .unwrap();
        assert_eq!(info.extent.width, 32);
        assert_eq!(backend.acquire_next_image(semaphore).unwrap(), 0);
    }

    #[test]
    fn unknown_memory_location_unsupported() {
        let backend = HeadlessBackend::default();
        let result = backend.create_buffer(&BufferDesc {
            size: 4,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            location: MemoryLocation::Unknown,
            name: "bad",
        });
        assert!(matches!(result, Err(GpuError::UnsupportedMemoryType(_))));
    }

    #[test]
    fn allocations_beyond_budget_fail() {
        // One 1x1 present image holds 4 bytes.
        let backend = HeadlessBackend::new(HeadlessConfig {
            image_count: 1,
            extent: vk::Extent2D { width: 1, height: 1 },
            memory_budget: Some(100),
            ..HeadlessConfig::default()
        });
        let desc = |size| BufferDesc {
            size,
            usage: vk::BufferUsageFlags::VERTEX_BUFFER,
            location: MemoryLocation::GpuOnly,
            name: "budgeted",
        };
        let first = backend.create_buffer(&desc(64)).unwrap();
        assert!(matches!(
            backend.create_buffer(&desc(64)),
            Err(GpuError::AllocationFailed(_))
        ));
        assert_eq!(backend.stats().memory_used, 68);
        backend.destroy_buffer(first);
        backend.create_buffer(&desc(64)).unwrap();
    }
}
