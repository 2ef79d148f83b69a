use assert_approx_eq::assert_approx_eq;
use glam::{Vec3, vec3};

use super::{TestArenas, TestSplats, front_camera, new_image};
use crate::render::{RenderTargets, render_forward};
use crate::render_aux::RenderSession;
use crate::validation::session_violations;
use crate::{MIN_TRANSMITTANCE, RenderConfig, RenderError};

#[test]
fn single_splat_covers_image() {
    let camera = front_camera(4, 4, 1.0);
    let mut splats = TestSplats::default();
    splats.push(vec3(0.0, 0.0, 3.0), vec3(100.0, 100.0, 1.0), 1.0, Vec3::X);

    let mut image = new_image(&camera, &splats);
    let mut arenas = TestArenas::default();
    let session = render_forward(
        &splats.inputs(),
        &camera,
        &RenderConfig::default(),
        arenas.arenas(),
        image.targets(),
    )
    .expect("Valid render");

    assert_eq!(session.num_visible(), 1);
    assert_eq!(session.stats.num_intersections, 1);
    for y in 0..4 {
        for x in 0..4 {
            let color = image.color_at(x, y);
            assert_approx_eq!(color.x, 1.0, 0.02);
            assert_eq!(color.y, 0.0);
            assert_eq!(color.z, 0.0);
            assert_approx_eq!(image.opacity_at(x, y), 1.0, 0.02);
            assert_approx_eq!(image.depth_at(x, y), 3.0 * image.opacity_at(x, y), 1e-3);
            // The disk faces the camera, so its normal points back along -z.
            assert_approx_eq!(image.normal_at(x, y).z, -image.opacity_at(x, y), 1e-5);
        }
    }
    assert!(
        session.image.n_contrib.iter().all(|&n| n == 1),
        "One splat per pixel: {:?}",
        session.image.n_contrib
    );
    assert_eq!(image.stats.pixel_count, vec![16]);
    assert_approx_eq!(image.stats.weight_sum[0], 16.0 * image.opacity_at(0, 0), 1e-4);
    assert!(image.radii[0] > 2, "Covers the image");
}

#[test]
fn no_splats_shows_background() {
    let background = vec3(0.2, 0.4, 0.6);
    let camera = front_camera(20, 18, 1.0).with_background(background);
    let splats = TestSplats::default();
    let mut image = new_image(&camera, &splats);
    let mut arenas = TestArenas::default();
    let session = render_forward(
        &splats.inputs(),
        &camera,
        &RenderConfig::default(),
        arenas.arenas(),
        image.targets(),
    )
    .expect("Empty scenes render");

    assert_eq!(session.num_visible(), 0);
    assert_eq!(session.stats.num_intersections, 0);
    assert!(session.image.n_contrib.iter().all(|&n| n == 0), "Nothing composited");
    assert!(session.image.final_t.iter().all(|&t| t == 1.0), "Untouched");
    for y in 0..18 {
        for x in 0..20 {
            assert_eq!(image.color_at(x, y), background);
            assert_eq!(image.opacity_at(x, y), 0.0);
        }
    }
}

#[test]
fn invisible_splats_touch_nothing() {
    let background = vec3(0.0, 0.0, 1.0);
    let camera = front_camera(32, 32, 1.0).with_background(background);
    let mut splats = TestSplats::default();
    splats
        .push(vec3(0.0, 0.0, 3.0), vec3(1.0, 1.0, 1.0), 0.0, Vec3::X)
        .push(vec3(40.0, 0.0, 3.0), vec3(1.0, 1.0, 1.0), 1.0, Vec3::X)
        .push(vec3(0.0, 0.0, -3.0), vec3(1.0, 1.0, 1.0), 1.0, Vec3::X);

    let mut image = new_image(&camera, &splats);
    let mut arenas = TestArenas::default();
    let session = render_forward(
        &splats.inputs(),
        &camera,
        &RenderConfig::default(),
        arenas.arenas(),
        image.targets(),
    )
    .expect("Valid render");

    assert_eq!(session.num_visible(), 0);
    assert_eq!(session.geometry.tiles_touched, &[0, 0, 0]);
    assert_eq!(image.radii, vec![0, 0, 0]);
    assert!(
        image
            .color
            .chunks(32 * 32)
            .zip(background.to_array())
            .all(|(plane, bg)| plane.iter().all(|&c| c == bg)),
        "Only background"
    );
}

#[test]
fn front_splat_occludes() {
    let camera = front_camera(8, 8, 1.0);
    let mut splats = TestSplats::default();
    splats
        .push(vec3(0.0, 0.0, 4.0), vec3(50.0, 50.0, 1.0), 0.5, Vec3::Y)
        .push(vec3(0.0, 0.0, 2.0), vec3(50.0, 50.0, 1.0), 1.0, Vec3::X);

    let mut image = new_image(&camera, &splats);
    let mut arenas = TestArenas::default();
    let session = render_forward(
        &splats.inputs(),
        &camera,
        &RenderConfig::default(),
        arenas.arenas(),
        image.targets(),
    )
    .expect("Valid render");

    // Sorted front to back regardless of input order.
    assert_eq!(session.binning.values, &[1, 0]);
    let color = image.color_at(3, 4);
    assert_approx_eq!(color.x, 0.99, 1e-4);
    assert!(
        color.y < 0.006,
        "Back splat only shows through the alpha cap: {color}"
    );
    // Both composite, the back one with a tiny weight.
    assert_eq!(session.image.n_contrib[3 + 4 * 8], 2);
    assert!(
        image.stats.max_weight[0] < 0.006 && image.stats.max_weight[1] > 0.98,
        "{:?}",
        image.stats
    );
}

#[test]
fn transmittance_is_conserved() {
    let camera = front_camera(70, 45, 1.2);
    let splats = TestSplats::random(3000, 7);
    let mut image = new_image(&camera, &splats);
    let mut arenas = TestArenas::default();
    let session = render_forward(
        &splats.inputs(),
        &camera,
        &RenderConfig::default(),
        arenas.arenas(),
        image.targets(),
    )
    .expect("Valid render");

    assert!(session.num_visible() > 100, "Most splats are in view");
    assert!(session_violations(&session).is_empty(), "Valid buffers");
    for (&t, &opacity) in session.image.final_t.iter().zip(&image.opacity) {
        assert!(
            (MIN_TRANSMITTANCE..=1.0).contains(&t),
            "Transmittance {t} out of range"
        );
        assert_approx_eq!(t + opacity, 1.0, 1e-6);
    }
    let composited: u32 = session.image.n_contrib.iter().sum();
    let counted: u32 = image.stats.pixel_count.iter().sum();
    assert_eq!(composited, counted);
}

#[test]
fn rendering_is_deterministic() {
    let camera = front_camera(40, 40, 1.0);
    let splats = TestSplats::random(800, 3);
    let config = RenderConfig::default();

    let mut first = new_image(&camera, &splats);
    let mut arenas = TestArenas::default();
    render_forward(
        &splats.inputs(),
        &camera,
        &config,
        arenas.arenas(),
        first.targets(),
    )
    .expect("Valid render");

    // Reused, already grown arenas give the same result.
    let mut second = new_image(&camera, &splats);
    render_forward(
        &splats.inputs(),
        &camera,
        &config,
        arenas.arenas(),
        second.targets(),
    )
    .expect("Valid render");

    assert_eq!(first.color, second.color);
    assert_eq!(first.distortion, second.distortion);
    assert_eq!(first.stats.pixel_count, second.stats.pixel_count);
}

#[test]
fn session_restores_from_arenas() {
    let camera = front_camera(33, 17, 1.0);
    let splats = TestSplats::random(200, 11);
    let config = RenderConfig::default();
    let mut image = new_image(&camera, &splats);
    let mut arenas = TestArenas::default();

    let (num_visible, num_intersections, n_contrib) = {
        let session = render_forward(
            &splats.inputs(),
            &camera,
            &config,
            arenas.arenas(),
            image.targets(),
        )
        .expect("Valid render");
        (
            session.num_visible(),
            session.stats.num_intersections,
            session.image.n_contrib.to_vec(),
        )
    };

    let restored = RenderSession::restore(
        &splats.inputs(),
        &camera,
        &config,
        num_visible,
        &arenas.geometry,
        &arenas.binning,
        &arenas.image,
    )
    .expect("Arenas match");
    assert_eq!(restored.stats.num_intersections, num_intersections);
    assert_eq!(restored.image.n_contrib, n_contrib.as_slice());
    assert!(
        restored.check_inputs(&splats.inputs(), &camera).is_ok(),
        "Same inputs"
    );
    assert!(
        matches!(
            restored.check_inputs(&splats.inputs(), &camera.with_background(Vec3::ONE)),
            Err(RenderError::SessionMismatch(_))
        ),
        "Different camera"
    );

    let wrong = RenderSession::restore(
        &splats.inputs(),
        &camera,
        &config,
        num_visible + 1,
        &arenas.geometry,
        &arenas.binning,
        &arenas.image,
    );
    assert!(
        matches!(wrong, Err(RenderError::SessionMismatch(_))),
        "Visible count doesn't match"
    );
}

#[test]
fn contract_violations() {
    let camera = front_camera(8, 8, 1.0);
    let mut splats = TestSplats::default();
    splats.push(vec3(0.0, 0.0, 3.0), Vec3::ONE, 0.5, Vec3::X);
    let mut arenas = TestArenas::default();

    let mut short = vec![0.0; 10];
    let (mut depth, mut normal, mut opacity, mut distortion) =
        (vec![0.0; 64], vec![0.0; 192], vec![0.0; 64], vec![0.0; 64]);
    let result = render_forward(
        &splats.inputs(),
        &camera,
        &RenderConfig::default(),
        arenas.arenas(),
        RenderTargets {
            color: &mut short,
            depth: &mut depth,
            normal: &mut normal,
            opacity: &mut opacity,
            distortion: &mut distortion,
            radii: None,
            stats: None,
        },
    );
    assert!(
        matches!(
            result,
            Err(RenderError::BufferSize {
                name: "out_color",
                ..
            })
        ),
        "Color buffer is too short"
    );

    let empty = front_camera(0, 8, 1.0);
    let mut image = new_image(&empty, &splats);
    let result = render_forward(
        &splats.inputs(),
        &empty,
        &RenderConfig::default(),
        arenas.arenas(),
        image.targets(),
    );
    assert!(
        matches!(result, Err(RenderError::EmptyImage { width: 0, .. })),
        "Zero width"
    );
}

#[test]
fn scale_modifier_shrinks_footprint() {
    let camera = front_camera(64, 64, 1.0);
    let mut splats = TestSplats::default();
    splats.push(vec3(0.0, 0.0, 4.0), vec3(0.5, 0.5, 1.0), 0.8, Vec3::ONE);

    let radius = |scale_modifier: f32| {
        let mut image = new_image(&camera, &splats);
        let mut arenas = TestArenas::default();
        let config = RenderConfig {
            scale_modifier,
            ..Default::default()
        };
        render_forward(
            &splats.inputs(),
            &camera,
            &config,
            arenas.arenas(),
            image.targets(),
        )
        .expect("Valid render");
        image.radii[0]
    };
    assert!(radius(0.5) < radius(1.0), "Half scale, smaller radius");
}

#[test]
fn prefiltered_render_matches_culled_render() {
    let camera = front_camera(48, 40, 1.0);
    let splats = TestSplats::random(500, 19);

    let render = |prefiltered: bool| {
        let mut image = new_image(&camera, &splats);
        let mut arenas = TestArenas::default();
        let config = RenderConfig {
            prefiltered,
            ..Default::default()
        };
        let num_visible = render_forward(
            &splats.inputs(),
            &camera,
            &config,
            arenas.arenas(),
            image.targets(),
        )
        .expect("Valid render")
        .num_visible();
        (image, num_visible)
    };

    let (culled, culled_visible) = render(false);
    let (prefiltered, prefiltered_visible) = render(true);
    assert!(culled_visible > 0, "Some splats are in view");
    assert_eq!(prefiltered_visible, culled_visible);
    assert_eq!(prefiltered.radii, culled.radii);
    assert_eq!(prefiltered.color, culled.color);
    assert_eq!(prefiltered.depth, culled.depth);
    assert_eq!(prefiltered.distortion, culled.distortion);
}

#[test]
fn prefiltered_render_skips_splats_behind_camera() {
    let camera = front_camera(32, 32, 1.0);
    let mut splats = TestSplats::default();
    splats
        .push(vec3(0.0, 0.0, 3.0), vec3(0.5, 0.5, 1.0), 0.8, Vec3::X)
        .push(vec3(0.0, 0.0, -3.0), vec3(0.5, 0.5, 1.0), 0.8, Vec3::Y)
        .push(vec3(0.0, 0.0, 0.1), vec3(0.5, 0.5, 1.0), 0.8, Vec3::Z);

    let mut image = new_image(&camera, &splats);
    let mut arenas = TestArenas::default();
    let config = RenderConfig {
        prefiltered: true,
        ..Default::default()
    };
    let session = render_forward(
        &splats.inputs(),
        &camera,
        &config,
        arenas.arenas(),
        image.targets(),
    )
    .expect("Valid render");

    assert_eq!(session.num_visible(), 1);
    assert_eq!(image.radii[1..], [0, 0]);
    assert_eq!(session.geometry.tiles_touched[1..], [0, 0]);
    assert!(
        session.binning.values.iter().all(|&v| v == 0),
        "Only the front splat is binned"
    );
}

#[test]
fn restore_rejects_other_options() {
    let camera = front_camera(24, 24, 1.0);
    let splats = TestSplats::random(100, 5);
    let config = RenderConfig::default();
    let mut image = new_image(&camera, &splats);
    let mut arenas = TestArenas::default();
    let num_visible = render_forward(
        &splats.inputs(),
        &camera,
        &config,
        arenas.arenas(),
        image.targets(),
    )
    .expect("Valid render")
    .num_visible();

    let restore = |camera: &crate::Camera, config: &RenderConfig| {
        RenderSession::restore(
            &splats.inputs(),
            camera,
            config,
            num_visible,
            &arenas.geometry,
            &arenas.binning,
            &arenas.image,
        )
        .map(|session| session.num_visible())
    };
    assert_eq!(restore(&camera, &config).ok(), Some(num_visible));

    let sharper = RenderConfig {
        sigma: 2.0,
        ..config.clone()
    };
    let smaller = RenderConfig {
        scale_modifier: 0.5,
        ..config.clone()
    };
    let debug = RenderConfig {
        debug: true,
        ..config.clone()
    };
    for other in [&sharper, &smaller] {
        assert!(
            matches!(restore(&camera, other), Err(RenderError::SessionMismatch(_))),
            "Options {other:?} differ from the render"
        );
    }
    assert!(restore(&camera, &debug).is_ok(), "Debug checks don't change the render");
    assert!(
        matches!(
            restore(&camera.with_background(Vec3::ONE), &config),
            Err(RenderError::SessionMismatch(_))
        ),
        "Different camera"
    );
}
