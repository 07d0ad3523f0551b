//! SVG precision-recall chart.
//!
//! The curve is drawn as short segments coloured by decision threshold, with
//! a colorbar mapping colours back to thresholds.

use std::fs;
use std::path::Path;

use crate::metrics::PrCurve;

const CHART_WIDTH: f64 = 800.0;
const CHART_HEIGHT: f64 = 600.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_RIGHT: f64 = 120.0;
const MARGIN_BOTTOM: f64 = 80.0;
const MARGIN_LEFT: f64 = 80.0;
const COLORBAR_WIDTH: f64 = 20.0;

const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";
const COLOR_TEXT: &str = "#2c3e50";

/// Points the curve is resampled to
pub const CURVE_SAMPLES: usize = 100;

/// Viridis anchor colours at 0, 0.25, 0.5, 0.75 and 1
const VIRIDIS: [(f64, [u8; 3]); 5] = [
    (0.0, [68, 1, 84]),
    (0.25, [59, 82, 139]),
    (0.5, [33, 145, 140]),
    (0.75, [94, 201, 98]),
    (1.0, [253, 231, 37]),
];

/// One resampled point of the chart
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrChartPoint {
    pub recall: f64,
    pub precision: f64,
    pub threshold: f64,
}

/// Maps `t` in `[0, 1]` onto the viridis colormap as `#rrggbb`
pub fn viridis(t: f64) -> String {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    let upper = VIRIDIS.iter().position(|(stop, _)| *stop >= t).unwrap_or(4).max(1);
    let (t0, c0) = VIRIDIS[upper - 1];
    let (t1, c1) = VIRIDIS[upper];
    let w = (t - t0) / (t1 - t0);
    let mix = |a: u8, b: u8| (f64::from(a) + (f64::from(b) - f64::from(a)) * w).round() as u8;
    format!(
        "#{:02x}{:02x}{:02x}",
        mix(c0[0], c1[0]),
        mix(c0[1], c1[1]),
        mix(c0[2], c1[2])
    )
}

/// Collapses points sharing a recall value into their mean precision and
/// threshold, then resamples linearly to `samples` points across the recall range.
///
/// The curve carries one threshold fewer than points; the last point reuses the
/// largest threshold.
pub fn pr_chart_points(curve: &PrCurve, samples: usize) -> Vec<PrChartPoint> {
    let max_threshold = curve
        .thresholds
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let max_threshold = if max_threshold.is_finite() {
        max_threshold
    } else {
        1.0
    };

    let mut raw: Vec<PrChartPoint> = curve
        .recall
        .iter()
        .zip(&curve.precision)
        .enumerate()
        .map(|(i, (&recall, &precision))| PrChartPoint {
            recall,
            precision,
            threshold: curve.thresholds.get(i).copied().unwrap_or(max_threshold),
        })
        .collect();
    raw.sort_by(|a, b| a.recall.total_cmp(&b.recall));

    let mut grouped: Vec<PrChartPoint> = Vec::new();
    let mut start = 0;
    while start < raw.len() {
        let end = raw[start..]
            .iter()
            .position(|p| p.recall != raw[start].recall)
            .map_or(raw.len(), |offset| start + offset);
        let group = &raw[start..end];
        let n = group.len() as f64;
        grouped.push(PrChartPoint {
            recall: raw[start].recall,
            precision: group.iter().map(|p| p.precision).sum::<f64>() / n,
            threshold: group.iter().map(|p| p.threshold).sum::<f64>() / n,
        });
        start = end;
    }

    if grouped.len() < 2 || samples < 2 {
        return grouped;
    }

    let lo = grouped[0].recall;
    let hi = grouped[grouped.len() - 1].recall;
    let mut segment = 0;
    (0..samples)
        .map(|i| {
            let recall = lo + (hi - lo) * i as f64 / (samples - 1) as f64;
            while segment + 2 < grouped.len() && grouped[segment + 1].recall < recall {
                segment += 1;
            }
            let (a, b) = (grouped[segment], grouped[segment + 1]);
            let w = ((recall - a.recall) / (b.recall - a.recall)).clamp(0.0, 1.0);
            PrChartPoint {
                recall,
                precision: a.precision + (b.precision - a.precision) * w,
                threshold: a.threshold + (b.threshold - a.threshold) * w,
            }
        })
        .collect()
}

/// Writes the precision-recall curve as an SVG chart
pub fn write_pr_curve_svg(title: &str, curve: &PrCurve, output_path: &Path) -> std::io::Result<()> {
    let plot_width = CHART_WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_height = CHART_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
    let to_x = |recall: f64| MARGIN_LEFT + recall.clamp(0.0, 1.0) * plot_width;
    let to_y = |precision: f64| MARGIN_TOP + plot_height - precision.clamp(0.0, 1.0) * plot_height;

    let points = pr_chart_points(curve, CURVE_SAMPLES);
    let (t_min, t_max) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
        (lo.min(p.threshold), hi.max(p.threshold))
    });
    let t_range = t_max - t_min;
    let color_of = |t: f64| {
        if t_range > 0.0 {
            viridis((t - t_min) / t_range)
        } else {
            viridis(0.5)
        }
    };

    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {} {}" width="{}" height="{}">"#,
        CHART_WIDTH, CHART_HEIGHT, CHART_WIDTH, CHART_HEIGHT
    ));
    svg.push_str(&format!(
        r#"<rect width="{}" height="{}" fill="white"/>"#,
        CHART_WIDTH, CHART_HEIGHT
    ));
    svg.push_str(&format!(
        r#"<text x="{}" y="35" text-anchor="middle" font-family="Arial, sans-serif" font-size="18" font-weight="bold" fill="{}">{}</text>"#,
        MARGIN_LEFT + plot_width / 2.0, COLOR_TEXT, escape_xml(title)
    ));

    // Grid and tick labels on both axes
    for i in 0..=5 {
        let value = i as f64 / 5.0;
        let (x, y) = (to_x(value), to_y(value));
        svg.push_str(&format!(
            r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="1"/>"#,
            MARGIN_LEFT, y, MARGIN_LEFT + plot_width, y, COLOR_GRID
        ));
        svg.push_str(&format!(
            r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="1"/>"#,
            x, MARGIN_TOP, x, MARGIN_TOP + plot_height, COLOR_GRID
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="end" font-family="Arial, sans-serif" font-size="12" fill="{}">{:.1}</text>"#,
            MARGIN_LEFT - 10.0, y + 4.0, COLOR_TEXT, value
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="12" fill="{}">{:.1}</text>"#,
            x, MARGIN_TOP + plot_height + 20.0, COLOR_TEXT, value
        ));
    }

    svg.push_str(&format!(
        r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="2"/>"#,
        MARGIN_LEFT, MARGIN_TOP + plot_height, MARGIN_LEFT + plot_width, MARGIN_TOP + plot_height, COLOR_AXIS
    ));
    svg.push_str(&format!(
        r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="2"/>"#,
        MARGIN_LEFT, MARGIN_TOP, MARGIN_LEFT, MARGIN_TOP + plot_height, COLOR_AXIS
    ));
    svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}">Recall</text>"#,
        MARGIN_LEFT + plot_width / 2.0, CHART_HEIGHT - 20.0, COLOR_TEXT
    ));
    svg.push_str(&format!(
        r#"<text x="20" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}" transform="rotate(-90 20 {})">Precision</text>"#,
        MARGIN_TOP + plot_height / 2.0, COLOR_TEXT, MARGIN_TOP + plot_height / 2.0
    ));

    for pair in points.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        svg.push_str(&format!(
            r#"<line x1="{:.2}" y1="{:.2}" x2="{:.2}" y2="{:.2}" stroke="{}" stroke-width="3" stroke-linecap="round"/>"#,
            to_x(a.recall),
            to_y(a.precision),
            to_x(b.recall),
            to_y(b.precision),
            color_of((a.threshold + b.threshold) / 2.0)
        ));
    }
    if let [only] = points.as_slice() {
        svg.push_str(&format!(
            r#"<circle cx="{:.2}" cy="{:.2}" r="5" fill="{}"/>"#,
            to_x(only.recall),
            to_y(only.precision),
            color_of(only.threshold)
        ));
    }

    // Colorbar, highest threshold on top
    let bar_x = CHART_WIDTH - MARGIN_RIGHT + 30.0;
    let steps = 50;
    let step_height = plot_height / steps as f64;
    for i in 0..steps {
        let t = 1.0 - (i as f64 + 0.5) / steps as f64;
        svg.push_str(&format!(
            r#"<rect x="{}" y="{:.2}" width="{}" height="{:.2}" fill="{}"/>"#,
            bar_x,
            MARGIN_TOP + i as f64 * step_height,
            COLORBAR_WIDTH,
            step_height + 0.5,
            viridis(t)
        ));
    }
    if t_min.is_finite() && t_max.is_finite() {
        for (y, value) in [(MARGIN_TOP, t_max), (MARGIN_TOP + plot_height, t_min)] {
            svg.push_str(&format!(
                r#"<text x="{}" y="{}" font-family="Arial, sans-serif" font-size="11" fill="{}">{:.2}</text>"#,
                bar_x + COLORBAR_WIDTH + 5.0, y + 4.0, COLOR_TEXT, value
            ));
        }
    }
    svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="12" fill="{}">Threshold</text>"#,
        bar_x + COLORBAR_WIDTH / 2.0, MARGIN_TOP - 10.0, COLOR_TEXT
    ));

    svg.push_str("</svg>");

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(output_path, svg)
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
