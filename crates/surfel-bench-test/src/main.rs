//! Renders a seeded random scene forward and backward and reports timings as JSON.

mod scene;

use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use glam::{UVec2, Vec3};
use serde::Serialize;
use surfel_render::{Camera, RenderArenas, RenderConfig, RenderImage, render_forward};
use surfel_render_bwd::{PixelGrads, SplatGrads, render_backward};

use crate::scene::RandomScene;

#[derive(Parser, Debug)]
#[command(version, about = "Benchmark the surfel rasterizer on a random scene")]
struct Args {
    /// Number of random splats.
    #[arg(long, default_value = "10000")]
    num_splats: usize,
    #[arg(long, default_value = "512")]
    width: u32,
    #[arg(long, default_value = "512")]
    height: u32,
    /// SH degree of the random colors.
    #[arg(long, default_value = "3")]
    sh_degree: u32,
    #[arg(long, default_value = "42")]
    seed: u64,
    /// Timed forward and backward passes, after one warmup pass.
    #[arg(long, default_value = "10")]
    iterations: u32,
    /// Print a span for every render stage.
    #[arg(long, default_value = "false")]
    trace: bool,
    #[command(flatten)]
    render: RenderConfig,
}

#[derive(Serialize, Debug)]
struct Summary {
    num_splats: usize,
    img_size: [u32; 2],
    num_visible: u32,
    num_intersections: u32,
    forward_ms: f64,
    backward_ms: f64,
    mean_opacity: f32,
    grad_norm: f32,
    config: RenderConfig,
}

fn mean_ms(total: Duration, iterations: u32) -> f64 {
    total.as_secs_f64() * 1000.0 / f64::from(iterations.max(1))
}

fn run(args: &Args) -> anyhow::Result<Summary> {
    args.render.validate()?;
    let img_size = UVec2::new(args.width, args.height);
    let camera = Camera::look_at(Vec3::ZERO, Vec3::Z, Vec3::NEG_Y, 0.9, img_size)
        .with_background(Vec3::splat(0.1));
    let scene = RandomScene::new(args.num_splats, args.sh_degree, args.seed);
    let inputs = scene.inputs();

    let num_pixels = camera.num_pixels();
    let weights = scene::pixel_weights(num_pixels, args.seed);
    let zeros = vec![0.0; 3 * num_pixels];
    let pixel_grads = PixelGrads {
        v_color: &weights,
        v_depth: &zeros[..num_pixels],
        v_normal: &zeros,
        v_opacity: &zeros[..num_pixels],
        v_distortion: &zeros[..num_pixels],
    };

    let mut image = RenderImage::new(img_size, inputs.len());
    let mut grads = SplatGrads::new(&inputs);
    let mut geometry = Vec::<u64>::new();
    let mut binning = Vec::<u64>::new();
    let mut arena = Vec::<u64>::new();

    let mut forward = Duration::ZERO;
    let mut backward = Duration::ZERO;
    let mut stats = None;

    // The first pass warms up the rayon pool and sizes the arenas.
    for i in 0..=args.iterations {
        let start = Instant::now();
        let session = render_forward(
            &inputs,
            &camera,
            &args.render,
            RenderArenas {
                geometry: &mut geometry,
                binning: &mut binning,
                image: &mut arena,
            },
            image.targets(),
        )
        .context("Forward render failed")?;
        let forward_time = start.elapsed();

        let start = Instant::now();
        render_backward(&inputs, &camera, &session, &pixel_grads, grads.targets())
            .context("Backward pass failed")?;
        let backward_time = start.elapsed();

        if i > 0 {
            forward += forward_time;
            backward += backward_time;
        }
        log::debug!("Iteration {i}: forward {forward_time:?}, backward {backward_time:?}");
        stats = Some(session.stats);
    }
    let stats = stats.unwrap_or_default();

    let mean_opacity = image.opacity.iter().sum::<f32>() / num_pixels.max(1) as f32;
    let grad_norm = grads
        .v_means
        .iter()
        .chain(&grads.v_scales)
        .map(|g| g.length_squared())
        .sum::<f32>()
        .sqrt();

    Ok(Summary {
        num_splats: inputs.len(),
        img_size: img_size.to_array(),
        num_visible: stats.num_visible,
        num_intersections: stats.num_intersections,
        forward_ms: mean_ms(forward, args.iterations),
        backward_ms: mean_ms(backward, args.iterations),
        mean_opacity,
        grad_norm,
        config: args.render.clone(),
    })
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .target(env_logger::Target::Stdout)
        .init();

    if args.trace {
        use tracing_subscriber::fmt::format::FmtSpan;
        use tracing_subscriber::layer::SubscriberExt;

        tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE),
            ),
        )
        .context("Failed to set tracing subscriber")?;
    }

    log::info!(
        "Rendering {} splats at {}x{}",
        args.num_splats,
        args.width,
        args.height
    );
    let summary = run(&args)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
