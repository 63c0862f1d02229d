//! End-to-end frame loop on the headless backend.

use glam::Mat4;
use image::{Rgba, RgbaImage};

use umbra_core::{EngineConfig, Material, MeshData, Model};
use umbra_gpu::headless::{BufferWrites, HeadlessConfig};
use umbra_gpu::{BufferId, FrameIndex};
use umbra_render::{FrameOutcome, TextLine};
use umbra_test::{cube_scene, image_difference, HeadlessRenderer};

fn config() -> EngineConfig {
    EngineConfig::default().with_frames_in_flight(3)
}

fn renderer(objects: usize) -> HeadlessRenderer {
    HeadlessRenderer::new(HeadlessConfig::default(), &config(), cube_scene(objects).unwrap()).unwrap()
}

fn presented(outcome: FrameOutcome) -> FrameIndex {
    match outcome {
        FrameOutcome::Presented { frame, .. } => frame,
        FrameOutcome::Skipped => panic!("frame was skipped"),
    }
}

#[test]
fn uploaded_assets_match_source_bytes() {
    let harness = renderer(4);
    let (device, backend, scene) = (harness.device(), harness.backend(), harness.scene());

    for model in scene.models() {
        let source = scene.assets.model(model);
        let gpu = harness.streamer().model(model);
        let vertices = backend.buffer_contents(device.buffer(gpu.vertex_buffer).raw);
        let indices = backend.buffer_contents(device.buffer(gpu.index_buffer).raw);
        assert_eq!(&vertices[..source.mesh.vertex_bytes().len()], source.mesh.vertex_bytes());
        assert_eq!(&indices[..source.mesh.index_bytes().len()], source.mesh.index_bytes());
        assert_eq!(gpu.index_count, source.mesh.index_count());

        let material = scene.assets.material(source.material);
        let params = backend.buffer_contents(device.buffer(harness.streamer().material(source.material).params).raw);
        assert_eq!(&params[..material.raw().len()], material.raw());
    }

    for texture in scene.assets.textures_of(&scene.models()) {
        let gpu = harness.streamer().texture(texture);
        let image = device.image(gpu.image);
        assert_eq!(backend.image_contents(image.raw), scene.assets.texture(texture).raw());
        assert_eq!(backend.image_layout(image.raw), ash::vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }
}

#[test]
fn shared_texture_is_uploaded_once() {
    let mut harness = renderer(6);
    // Two models, two materials, the shared checkerboard plus the white
    // fallback and the glyph atlas.
    assert_eq!(harness.streamer().resident_counts(), (2, 2, 3));
    assert_eq!(harness.composer().gbuffer().prepared_materials(), 2);

    let report = harness.upload_scene().unwrap();
    assert!(report.is_empty(), "{report:?}");
}

#[test]
fn instances_beyond_capacity_are_not_drawn() {
    let mut harness = renderer(600);
    let frame = presented(harness.render_frame().unwrap());
    harness.device().wait_idle();

    let max_objects = harness.composer().gbuffer().max_objects();
    assert_eq!(max_objects, 512);
    assert_eq!(harness.composer().gbuffer().draw_count(frame), max_objects);
    assert_eq!(harness.stats().indexed_draws, max_objects as u64);
}

#[test]
fn capacity_beyond_shader_arrays_is_rejected() {
    let config = config().with_max_objects(600);
    let result = HeadlessRenderer::new(HeadlessConfig::default(), &config, cube_scene(4).unwrap());
    assert!(matches!(
        result,
        Err(umbra_test::TestError::Gpu(umbra_gpu::GpuError::Core(umbra_core::Error::InvalidConfig(_))))
    ));
}

#[test]
fn debug_overlay_draws_only_when_enabled() {
    let mut harness = renderer(5);
    assert!(!harness.composer().debug_overlay());

    let frame = presented(harness.render_frame().unwrap());
    harness.device().wait_idle();
    // Lighting only; the text overlay has no lines.
    assert_eq!(harness.stats().draws, 1);
    assert_eq!(harness.composer().debug_pass().vertex_count(frame), 0);

    harness.composer_mut().set_debug_overlay(true);
    let frame = presented(harness.render_frame().unwrap());
    harness.device().wait_idle();
    assert_eq!(harness.stats().draws, 3);
    assert_eq!(harness.composer().debug_pass().vertex_count(frame), 5 * 24);
}

fn slot_buffers(harness: &HeadlessRenderer, buffers: impl Fn(FrameIndex) -> [BufferId; 3]) -> Vec<BufferId> {
    (0..harness.renderer().frame_slots() as u32)
        .flat_map(|slot| buffers(FrameIndex::new(slot)))
        .collect()
}

fn writes(harness: &HeadlessRenderer, buffers: &[BufferId]) -> Vec<BufferWrites> {
    buffers
        .iter()
        .map(|&id| harness.backend().buffer_writes(harness.device().buffer(id).raw))
        .collect()
}

#[test]
fn inactive_overlays_touch_no_buffers() {
    let mut harness = renderer(5);
    let debug = slot_buffers(&harness, |frame| harness.composer().debug_pass().frame_buffers(frame));
    let text = slot_buffers(&harness, |frame| harness.composer().text_pass().frame_buffers(frame));
    let (debug_setup, text_setup) = (writes(&harness, &debug), writes(&harness, &text));

    harness.render_frames(4).unwrap();
    harness.device().wait_idle();
    assert_eq!(writes(&harness, &debug), debug_setup);
    assert_eq!(writes(&harness, &text), text_setup);

    harness.composer_mut().set_debug_overlay(true);
    let frame = presented(harness.render_frame().unwrap());
    harness.device().wait_idle();
    let [staging, uniform, vertices] = harness.composer().debug_pass().frame_buffers(frame);
    let written = |id: BufferId| harness.backend().buffer_writes(harness.device().buffer(id).raw);
    let slot = frame.get() * 3;
    assert_eq!(written(staging).host_maps, debug_setup[slot].host_maps + 1);
    assert_eq!(written(uniform).transfers, debug_setup[slot + 1].transfers + 1);
    assert_eq!(written(vertices).host_maps, debug_setup[slot + 2].host_maps + 1);
    assert_eq!(writes(&harness, &text), text_setup);
}

#[test]
fn requested_upload_streams_with_the_next_frame() {
    let mut harness = renderer(2);
    let scene = harness.scene_mut();
    let green = scene
        .assets
        .materials
        .insert(Material::new("green").with_albedo([0.2, 1.0, 0.2, 1.0]));
    let slab = scene.assets.models.insert(Model::new("slab", MeshData::cube(0.1), green));
    scene.spawn(slab, Mat4::IDENTITY);

    harness.composer_mut().request_upload();
    let submissions = harness.stats().submissions;
    let frame = presented(harness.render_frame().unwrap());

    assert!(!harness.composer().upload_pending());
    assert_eq!(harness.streamer().resident_counts(), (3, 3, 3));
    assert_eq!(harness.composer().gbuffer().prepared_materials(), 3);
    assert_eq!(harness.composer().gbuffer().draw_count(frame), 3);
    assert_eq!(harness.streamer().pending_staging(), 1);

    harness.device().wait_idle();
    assert_eq!(harness.stats().submissions, submissions + 2);
    let gpu = harness.streamer().model(slab);
    let mesh = &harness.scene().assets.model(slab).mesh;
    let vertices = harness.backend().buffer_contents(harness.device().buffer(gpu.vertex_buffer).raw);
    assert_eq!(&vertices[..mesh.vertex_bytes().len()], mesh.vertex_bytes());

    harness.render_frame().unwrap();
    assert_eq!(harness.streamer().pending_staging(), 0);
    assert_eq!(harness.shutdown().live_buffers, 0);
}

#[test]
fn text_overlay_draws_glyph_quads() {
    let mut harness = renderer(1);
    harness.composer_mut().set_text(vec![TextLine::new("FPS 60", [8.0, 8.0])]);
    let frame = presented(harness.render_frame().unwrap());
    harness.device().wait_idle();

    // Five glyphs; the space only advances.
    assert_eq!(harness.composer().text_pass().vertex_count(frame), 30);
    assert_eq!(harness.stats().draws, 2);

    harness.composer_mut().set_text_overlay(false);
    harness.render_frame().unwrap();
    harness.device().wait_idle();
    assert_eq!(harness.stats().draws, 3);
}

#[test]
fn frames_follow_acquisition_order() {
    let headless = HeadlessConfig {
        acquire_order: Some(vec![2, 0, 1]),
        ..HeadlessConfig::default()
    };
    let mut harness = HeadlessRenderer::new(headless, &config(), cube_scene(3).unwrap()).unwrap();
    let frames: Vec<usize> = harness
        .render_frames(7)
        .unwrap()
        .into_iter()
        .map(|outcome| presented(outcome).get())
        .collect();
    assert_eq!(frames, vec![2, 0, 1, 2, 0, 1, 2]);
    assert_eq!(harness.composer().frames_rendered(), 7);
}

#[test]
fn lit_image_reaches_present() {
    let mut harness = renderer(2);
    let frame = presented(harness.render_frame().unwrap());
    let image = harness.present_image(frame).unwrap();
    assert_eq!(image.dimensions(), (64, 64));
    // Placeholder shaders leave the lighting clear colour.
    let black = RgbaImage::from_pixel(64, 64, Rgba([0, 0, 0, 255]));
    assert!(image_difference(&black, &image).unwrap() < f64::EPSILON);
    assert_eq!(
        harness.backend().image_layout(harness.device().image(harness.renderer().present_target(frame).image).raw),
        ash::vk::ImageLayout::PRESENT_SRC_KHR
    );
}

#[test]
fn resize_rebuilds_size_dependent_targets() {
    let mut harness = renderer(2);
    harness.render_frames(2).unwrap();
    harness.resize(128, 96).unwrap();

    let frame = presented(harness.render_frame().unwrap());
    let image = harness.present_image(frame).unwrap();
    assert_eq!(image.dimensions(), (128, 96));
    let albedo = harness.composer().gbuffer().color_images(frame)[0];
    let extent = harness.device().image(albedo).extent;
    assert_eq!((extent.width, extent.height), (128, 96));
}

#[test]
fn stale_swapchain_skips_one_frame() {
    let mut harness = renderer(2);
    harness.render_frame().unwrap();
    harness.backend().mark_out_of_date();

    assert_eq!(harness.render_frame().unwrap(), FrameOutcome::Skipped);
    assert!(matches!(
        harness.render_frame().unwrap(),
        FrameOutcome::Presented { recreated: false, .. }
    ));
    assert_eq!(harness.composer().frames_rendered(), 2);
}

#[test]
fn shutdown_releases_every_buffer() {
    let mut harness = renderer(8);
    harness.composer_mut().set_debug_overlay(true);
    harness.composer_mut().set_text(vec![TextLine::new("HELLO", [0.0, 0.0])]);
    harness.render_frames(5).unwrap();

    let stats = harness.shutdown();
    assert_eq!(stats.live_buffers, 0);
    assert!(stats.presents >= 5);
}

#[test]
fn present_image_saves_as_png() {
    let mut harness = renderer(1);
    let frame = presented(harness.render_frame().unwrap());
    let path = std::env::temp_dir()
        .join(format!("umbra-test-{}", std::process::id()))
        .join("frame.png");
    harness.save_present_image(frame, &path).unwrap();

    let saved = image::open(&path).unwrap().to_rgba8();
    assert_eq!(saved, harness.present_image(frame).unwrap());
    std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
}
