//! Draws a textured quad for a few frames on the headless backend.
//!
//! Run with `RUST_LOG=debug` to see every object as it is created.

use std::{rc::Rc, time::Instant};

use bytemuck::{Pod, Zeroable};
use log::info;
use render_device::{
    backend::{
        headless::{HeadlessBackend, HeadlessConfig},
        InputElement, PipelineDesc,
    },
    command::PrimitiveTopology,
    logging::{init_logging, LoggingConfig},
    resource::Format,
    surface::FrameSurface,
    GraphicsConfig, GraphicsContext, MipChain, SurfaceTarget, TextureRegistry,
};

const FRAME_COUNT: u64 = 120;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    uv: [f32; 2],
}

fn main() -> render_device::Result<()> {
    init_logging(&LoggingConfig::default());

    let backend = HeadlessBackend::new(HeadlessConfig::default());
    let probe = backend.probe();

    let mut context = GraphicsContext::new(
        Rc::new(backend),
        SurfaceTarget::Offscreen,
        GraphicsConfig::default(),
    )?;

    let mut textures = TextureRegistry::default();
    let checkerboard = textures.insert(
        &mut context,
        "checkerboard",
        &MipChain::checkerboard(256, 32, [20, 20, 20, 255], [230, 230, 230, 255])
            .with_generated_mips(),
    )?;

    let vertices = context.create_gpu_buffer(&[
        Vertex { position: [-0.5, -0.5], uv: [0.0, 1.0] },
        Vertex { position: [-0.5, 0.5], uv: [0.0, 0.0] },
        Vertex { position: [0.5, -0.5], uv: [1.0, 1.0] },
        Vertex { position: [0.5, 0.5], uv: [1.0, 0.0] },
    ])?;

    // Bytecode would normally come from `shader::compile_shader`.
    let pipeline = context.create_pipeline(&PipelineDesc {
        name: Some("Checkerboard".to_owned()),
        vertex_shader: b"DXBC-vertex".to_vec(),
        pixel_shader: b"DXBC-pixel".to_vec(),
        root_signature: None,
        input_layout: vec![
            InputElement {
                semantic: "POSITION",
                format: Format::Rg32Float,
                offset: 0,
            },
            InputElement {
                semantic: "TEXCOORD",
                format: Format::Rg32Float,
                offset: 8,
            },
        ],
        render_target_format: FrameSurface::RTV_FORMAT,
        depth_format: Some(FrameSurface::DEPTH_FORMAT),
        alpha_blend: false,
    })?;

    let start = Instant::now();
    for _ in 0..FRAME_COUNT {
        let mut frame = context.begin_frame()?;
        frame.set_pipeline(pipeline)?;
        frame.set_topology(PrimitiveTopology::TriangleStrip)?;
        frame.set_vertex_buffer(&vertices, std::mem::size_of::<Vertex>() as u32)?;
        frame.set_texture(0, checkerboard.slot())?;
        frame.draw(4, 1)?;
        context.end_frame()?;
    }

    let elapsed = start.elapsed();
    info!(
        "{} frames in {:.2?} ({:.1} fps), {} draws, {} validation errors",
        FRAME_COUNT,
        elapsed,
        FRAME_COUNT as f64 / elapsed.as_secs_f64(),
        probe.draw_calls(),
        probe.validation_errors().len()
    );

    Ok(())
}
