//! Invariant checks over the buffers a render leaves behind.
//!
//! Enabled by [`RenderConfig::debug`](crate::RenderConfig::debug), the `debug-validation`
//! feature, or any test build. Violations are logged, and fail the render in tests.

use crate::render_aux::RenderSession;

/// Describe every violated invariant of a finished render.
pub fn session_violations(session: &RenderSession<'_>) -> Vec<String> {
    let mut issues = vec![];
    let geometry = &session.geometry;

    for (idx, p) in geometry.projected.iter().enumerate() {
        if !p.is_visible() {
            if p.tiles_touched != 0 {
                issues.push(format!("Culled splat {idx} touches {} tiles", p.tiles_touched));
            }
            continue;
        }
        let finite = p.center_opacity.iter().all(|v| v.is_finite())
            && p.kwh.is_finite()
            && p.normal.is_finite()
            && p.color.is_finite();
        if !finite {
            issues.push(format!("Splat {idx} has non finite projected values: {p:?}"));
        }
    }

    let mut prev = 0;
    for (idx, (&cum, &count)) in geometry
        .cum_tiles_hit
        .iter()
        .zip(geometry.tiles_touched)
        .enumerate()
    {
        if cum != prev + count {
            issues.push(format!(
                "Prefix sum broken at splat {idx}: {prev} + {count} != {cum}"
            ));
        }
        prev = cum;
    }

    let num_intersections = session.binning.values.len() as u32;
    let mut expected_start = 0;
    for (tile, &[start, end]) in session.image.ranges.iter().enumerate() {
        if start != expected_start || end < start {
            issues.push(format!(
                "Tile {tile} range [{start}, {end}) doesn't continue from {expected_start}"
            ));
        }
        expected_start = end;
        let run_end = end.min(num_intersections) as usize;
        let run = &session.binning.values[(start as usize).min(run_end)..run_end];
        if run.windows(2).any(|w| {
            geometry.projected[w[0] as usize].depth() > geometry.projected[w[1] as usize].depth()
        }) {
            issues.push(format!("Tile {tile} isn't sorted front to back"));
        }
    }
    if expected_start != num_intersections {
        issues.push(format!(
            "Tile ranges cover {expected_start} of {num_intersections} intersections"
        ));
    }

    for (pix, &t) in session.image.final_t.iter().enumerate() {
        if !(t > 0.0 && t <= 1.0) {
            issues.push(format!("Pixel {pix} has transmittance {t} outside (0, 1]"));
        }
    }
    issues
}

/// Log every violated invariant of a finished render.
pub fn validate_session(session: &RenderSession<'_>) {
    let issues = session_violations(session);
    for issue in &issues {
        log::error!("Render validation: {issue}");
    }
    #[cfg(test)]
    assert!(issues.is_empty(), "Render failed validation: {issues:#?}");
}
