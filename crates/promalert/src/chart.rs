//! Chart rendering.
//!
//! A chart is a line plot of the selected series with the violation region of
//! the threshold shaded in translucent red, an optional legend, and a box with
//! the latest evaluated value near the right edge. Geometry follows a 12x6 cm
//! canvas at 96 DPI, scaled by the configured factor.
//!
//! Text needs a TrueType font, registered once per process from the configured
//! path or a well-known system location. DejaVu Sans is compiled in as the last
//! resort, so hosts without fonts still get charts.

use chrono::{DateTime, Utc};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use plotters::style::FontStyle;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::error::RenderError;
use crate::expr::{Comparison, PlotExpression};
use crate::series::{SampleValue, Series};

/// Qualitative line colors, cycled by series index.
pub const PALETTE: [RGBColor; 8] = [
    RGBColor(0x1b, 0x9e, 0x77),
    RGBColor(0xd9, 0x5f, 0x02),
    RGBColor(0x75, 0x70, 0xb3),
    RGBColor(0xe7, 0x29, 0x8a),
    RGBColor(0x66, 0xa6, 0x1e),
    RGBColor(0xe6, 0xab, 0x02),
    RGBColor(0xa6, 0x76, 0x1d),
    RGBColor(0x66, 0x66, 0x66),
];

const FONT_FAMILY: &str = "sans-serif";

/// Fonts tried when none is configured.
pub const DEFAULT_FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
];

/// DejaVu Sans, see `assets/DejaVuSans-LICENSE`.
const BUNDLED_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// Largest canvas drawn, in pixels.
pub const MAX_PIXELS: u64 = 16_000_000;

/// Where the registered font came from.
static FONT: OnceLock<Result<String, String>> = OnceLock::new();

const WIDTH_MM: f64 = 120.0;
const HEIGHT_MM: f64 = 60.0;
const MARGIN_MM: f64 = 3.0;
const TICK_FONT_MM: f64 = 2.5;
const EVAL_FONT_MM: f64 = 3.0;
const PX_PER_MM: f64 = 96.0 / 25.4;

/// A drawn chart.
#[derive(Debug, Clone)]
pub struct RenderedChart {
    /// PNG encoded image
    pub png: Vec<u8>,
    /// `formula operator level`, length-limited
    pub title: String,
}

/// One series reduced to drawable segments.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub color: RGBColor,
    /// Legend text, only set when several series are drawn
    pub label: Option<String>,
    /// Runs of consecutive numeric points; gaps separate runs
    pub segments: Vec<Vec<(f64, f64)>>,
}

/// Everything needed to draw, computed without touching the canvas.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartLayout {
    pub lines: Vec<Line>,
    pub x_range: (f64, f64),
    pub y_range: (f64, f64),
    pub violation: Vec<(f64, f64)>,
    /// Last numeric value seen, in draw order
    pub last_value: Option<f64>,
}

/// Split a series into segments at gaps. Returns the segments and the last
/// numeric value.
pub fn split_segments(series: &Series) -> Result<(Vec<Vec<(f64, f64)>>, Option<f64>), RenderError> {
    let mut segments = Vec::new();
    let mut current = Vec::new();
    let mut last = None;

    for sample in &series.samples {
        match sample.read()? {
            SampleValue::Number(value) => {
                current.push((timestamp_secs(sample.timestamp), value));
                last = Some(value);
            }
            SampleValue::Gap => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }

    Ok((segments, last))
}

/// Corners of the shaded violation region.
#[must_use]
pub fn violation_polygon(
    operator: Comparison,
    level: f64,
    x_range: (f64, f64),
    y_range: (f64, f64),
) -> Vec<(f64, f64)> {
    let edge = match operator {
        Comparison::LessThan => y_range.0,
        Comparison::GreaterThan => y_range.1,
    };
    vec![
        (x_range.0, level),
        (x_range.1, level),
        (x_range.1, edge),
        (x_range.0, edge),
    ]
}

/// Vertical range covering every point and the threshold, padded by 5%.
#[must_use]
pub fn value_bounds(lines: &[Line], level: f64) -> (f64, f64) {
    let (lo, hi) = lines
        .iter()
        .flat_map(|l| l.segments.iter().flatten())
        .fold((level, level), |(lo, hi), &(_, y)| (lo.min(y), hi.max(y)));

    let span = hi - lo;
    let pad = if span > 0.0 {
        span * 0.05
    } else {
        (hi.abs() * 0.05).max(1.0)
    };
    (lo - pad, hi + pad)
}

fn time_bounds(lines: &[Line], fallback: (f64, f64)) -> (f64, f64) {
    let bounds = lines
        .iter()
        .flat_map(|l| l.segments.iter().flatten())
        .fold(None, |acc: Option<(f64, f64)>, &(x, _)| match acc {
            Some((lo, hi)) => Some((lo.min(x), hi.max(x))),
            None => Some((x, x)),
        });

    match bounds {
        Some((lo, hi)) if hi > lo => (lo, hi),
        Some((lo, _)) => (lo - 60.0, lo + 60.0),
        None => fallback,
    }
}

fn timestamp_secs(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

/// Compute the chart layout. Fails on samples that are neither numbers nor gaps.
pub fn layout(
    series: &[Series],
    expr: &PlotExpression,
    range: (DateTime<Utc>, DateTime<Utc>),
) -> Result<ChartLayout, RenderError> {
    let with_legend = series.len() > 1;
    let mut lines = Vec::with_capacity(series.len());
    let mut last_value = None;

    for (index, s) in series.iter().enumerate() {
        let (segments, last) = split_segments(s)?;
        if last.is_some() {
            last_value = last;
        }
        let label = Some(s.legend_label()).filter(|l| with_legend && !l.is_empty());
        lines.push(Line {
            color: PALETTE[index % PALETTE.len()],
            label,
            segments,
        });
    }

    let x_range = time_bounds(&lines, (timestamp_secs(range.0), timestamp_secs(range.1)));
    let y_range = value_bounds(&lines, expr.level);
    let violation = violation_polygon(expr.operator, expr.level, x_range, y_range);

    Ok(ChartLayout {
        lines,
        x_range,
        y_range,
        violation,
        last_value,
    })
}

fn format_tick(x: &f64) -> String {
    DateTime::from_timestamp(x.round() as i64, 0)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_default()
}

fn register(bytes: &'static [u8]) -> Result<(), String> {
    plotters::style::register_font(FONT_FAMILY, FontStyle::Normal, bytes)
        .map_err(|_| "not a usable TrueType font".to_string())
}

fn load_font(path: &Path) -> Result<(), String> {
    let bytes = std::fs::read(path).map_err(|e| format!("{}: {e}", path.display()))?;
    // Registered fonts live for the whole process.
    let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
    register(bytes).map_err(|e| format!("{}: {e}", path.display()))
}

fn load_bundled_font() -> Result<(), String> {
    register(BUNDLED_FONT).map_err(|e| format!("bundled font: {e}"))
}

/// Register the chart font once for the process.
fn ensure_font(configured: Option<&Path>) -> Result<(), RenderError> {
    let loaded = FONT.get_or_init(|| {
        let candidates: Vec<PathBuf> = match configured {
            Some(path) => vec![path.to_path_buf()],
            None => DEFAULT_FONT_PATHS.iter().map(PathBuf::from).collect(),
        };

        let mut failures = Vec::new();
        for path in candidates {
            match load_font(&path) {
                Ok(()) => {
                    info!(font = %path.display(), "Chart font loaded");
                    return Ok(path.display().to_string());
                }
                Err(e) => failures.push(e),
            }
        }

        if configured.is_some() {
            warn!(errors = %failures.join("; "), "Configured font unusable, using bundled font");
        } else {
            info!("No system font found, using bundled font");
        }
        load_bundled_font().map(|()| "bundled".to_string())
    });

    loaded
        .as_ref()
        .map(|_| ())
        .map_err(|e| RenderError::Font(e.clone()))
}

/// Draws charts as PNG images.
#[derive(Debug, Clone)]
pub struct ChartRenderer {
    scale: f64,
    font_path: Option<PathBuf>,
}

impl Default for ChartRenderer {
    fn default() -> Self {
        Self::new(1.0, None)
    }
}

impl ChartRenderer {
    #[must_use]
    pub fn new(scale: f64, font_path: Option<PathBuf>) -> Self {
        let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
        Self { scale, font_path }
    }

    fn px(&self, mm: f64) -> f64 {
        mm * PX_PER_MM * self.scale
    }

    /// Canvas size in pixels.
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (
            self.px(WIDTH_MM).round() as u32,
            self.px(HEIGHT_MM).round() as u32,
        )
    }

    /// Draw `series` for `expr`. `range` is the queried time range, used when
    /// no series has data.
    pub fn render(
        &self,
        series: &[Series],
        expr: &PlotExpression,
        range: (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<RenderedChart, RenderError> {
        let layout = layout(series, expr, range)?;

        let (width, height) = self.dimensions();
        if u64::from(width) * u64::from(height) > MAX_PIXELS {
            return Err(RenderError::Draw(format!(
                "canvas {width}x{height} exceeds {MAX_PIXELS} pixels"
            )));
        }
        ensure_font(self.font_path.as_deref())?;

        let mut buffer = vec![0u8; width as usize * height as usize * 3];
        self.draw(&layout, &mut buffer, (width, height))
            .map_err(RenderError::Draw)?;

        let mut png = Vec::new();
        PngEncoder::new(&mut png)
            .write_image(&buffer, width, height, ExtendedColorType::Rgb8)
            .map_err(|e| RenderError::Encode(e.to_string()))?;

        debug!(
            formula = %expr.formula,
            series = series.len(),
            bytes = png.len(),
            "Chart rendered"
        );

        Ok(RenderedChart {
            png,
            title: expr.title(),
        })
    }

    fn draw(&self, layout: &ChartLayout, buffer: &mut [u8], size: (u32, u32)) -> Result<(), String> {
        let err = |e: &dyn std::fmt::Display| e.to_string();
        let tick_font = self.px(TICK_FONT_MM);
        let eval_font = self.px(EVAL_FONT_MM);
        let margin = self.px(MARGIN_MM).round() as u32;

        let root = BitMapBackend::with_buffer(buffer, size).into_drawing_area();
        root.fill(&WHITE).map_err(|e| err(&e))?;
        let area = root.margin(margin, margin, margin, margin);

        let (x0, x1) = layout.x_range;
        let (y0, y1) = layout.y_range;
        let mut chart = ChartBuilder::on(&area)
            .x_label_area_size((tick_font * 2.0) as u32)
            .y_label_area_size((tick_font * 5.0) as u32)
            .build_cartesian_2d(x0..x1, y0..y1)
            .map_err(|e| err(&e))?;

        chart
            .configure_mesh()
            .x_labels(6)
            .y_labels(5)
            .x_label_formatter(&format_tick)
            .label_style((FONT_FAMILY, tick_font))
            .light_line_style(BLACK.mix(0.05))
            .draw()
            .map_err(|e| err(&e))?;

        chart
            .draw_series(std::iter::once(Polygon::new(
                layout.violation.clone(),
                RED.mix(40.0 / 255.0).filled(),
            )))
            .map_err(|e| err(&e))?;

        let mut has_legend = false;
        for line in &layout.lines {
            let color = line.color;
            for (index, segment) in line.segments.iter().enumerate() {
                let anno = chart
                    .draw_series(LineSeries::new(segment.iter().copied(), color.stroke_width(1)))
                    .map_err(|e| err(&e))?;
                if let (0, Some(label)) = (index, &line.label) {
                    anno.label(label.clone()).legend(move |(x, y)| {
                        PathElement::new(vec![(x, y), (x + 12, y)], color.stroke_width(2))
                    });
                    has_legend = true;
                }
            }
        }

        if has_legend {
            chart
                .configure_series_labels()
                .position(SeriesLabelPosition::UpperLeft)
                .label_font((FONT_FAMILY, tick_font))
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK.mix(0.3))
                .draw()
                .map_err(|e| err(&e))?;
        }

        if let Some(value) = layout.last_value {
            let text = format!("latest evaluation: {value:.2}");
            let text_color = BLACK.mix(150.0 / 255.0);
            let style = TextStyle::from((FONT_FAMILY, eval_font).into_font())
                .color(&text_color)
                .pos(Pos::new(HPos::Right, VPos::Bottom));

            let (px, py) = chart.backend_coord(&(x1, value));
            let right = px - self.px(6.0).round() as i32;
            let pad = self.px(1.0).round() as i32;
            let (tw, th) = root.estimate_text_size(&text, &style).map_err(|e| err(&e))?;

            root.draw(&Rectangle::new(
                [
                    (right - tw as i32 - pad, py - th as i32 - pad),
                    (right + pad, py + pad),
                ],
                WHITE.mix(90.0 / 255.0).filled(),
            ))
            .map_err(|e| err(&e))?;
            root.draw(&Text::new(text, (right, py), style))
                .map_err(|e| err(&e))?;
        }

        root.present().map_err(|e| err(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::SeriesSample;
    use chrono::{TimeDelta, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn series(labels: &[(&str, &str)], values: &[&str]) -> Series {
        Series {
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            samples: values
                .iter()
                .enumerate()
                .map(|(i, v)| SeriesSample::new(base() + TimeDelta::seconds(i as i64 * 15), *v))
                .collect(),
        }
    }

    fn expr(operator: Comparison, level: f64) -> PlotExpression {
        PlotExpression {
            formula: "up".to_string(),
            operator,
            level,
        }
    }

    fn range() -> (DateTime<Utc>, DateTime<Utc>) {
        (base(), base() + TimeDelta::minutes(20))
    }

    #[test]
    fn test_gaps_split_lines() {
        let s = series(&[], &["1", "2", "NaN", "NaN", "4", "+Inf", "5"]);
        let (segments, last) = split_segments(&s).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].len(), 2);
        assert_eq!(segments[1], vec![(timestamp_secs(base()) + 60.0, 4.0)]);
        assert_eq!(last, Some(5.0));
    }

    #[test]
    fn test_invalid_sample_is_fatal() {
        let s = series(&[], &["1", "oops"]);
        assert!(matches!(
            layout(&[s], &expr(Comparison::GreaterThan, 1.0), range()),
            Err(RenderError::InvalidSample { .. })
        ));
    }

    #[test]
    fn test_violation_polygon_direction() {
        let below = violation_polygon(Comparison::LessThan, 5.0, (0.0, 10.0), (-1.0, 20.0));
        assert_eq!(below, vec![(0.0, 5.0), (10.0, 5.0), (10.0, -1.0), (0.0, -1.0)]);

        let above = violation_polygon(Comparison::GreaterThan, 5.0, (0.0, 10.0), (-1.0, 20.0));
        assert_eq!(above[2], (10.0, 20.0));
        assert_eq!(above[3], (0.0, 20.0));
    }

    #[test]
    fn test_bounds_include_threshold() {
        let s = series(&[], &["1", "2", "3"]);
        let layout = layout(&[s], &expr(Comparison::GreaterThan, 10.0), range()).unwrap();
        let (lo, hi) = layout.y_range;
        assert!(lo < 1.0);
        assert!(hi > 10.0);
        assert!((hi - 10.45).abs() < 1e-9);
    }

    #[test]
    fn test_flat_series_gets_padding() {
        let (lo, hi) = value_bounds(&[], 0.0);
        assert!(lo < 0.0 && hi > 0.0);
    }

    #[test]
    fn test_legend_only_for_several_series() {
        let one = layout(
            &[series(&[("job", "a")], &["1"])],
            &expr(Comparison::GreaterThan, 0.0),
            range(),
        )
        .unwrap();
        assert_eq!(one.lines[0].label, None);

        let two = layout(
            &[
                series(&[("job", "a")], &["1"]),
                series(&[("job", "b")], &["2"]),
            ],
            &expr(Comparison::GreaterThan, 0.0),
            range(),
        )
        .unwrap();
        assert_eq!(two.lines[1].label.as_deref(), Some(r#"job="b""#));
        assert_eq!(two.lines[1].color, PALETTE[1]);
        assert_eq!(two.last_value, Some(2.0));
    }

    #[test]
    fn test_palette_cycles() {
        let many: Vec<Series> = (0..10).map(|_| series(&[], &["1"])).collect();
        let layout = layout(&many, &expr(Comparison::LessThan, 0.0), range()).unwrap();
        assert_eq!(layout.lines[8].color, PALETTE[0]);
        assert_eq!(layout.lines[9].color, PALETTE[1]);
    }

    #[test]
    fn test_empty_result_uses_query_range() {
        let layout = layout(&[], &expr(Comparison::LessThan, 1.0), range()).unwrap();
        assert_eq!(layout.x_range.0, timestamp_secs(base()));
        assert_eq!(layout.last_value, None);
    }

    #[test]
    fn test_dimensions_scale() {
        assert_eq!(ChartRenderer::default().dimensions(), (454, 227));
        assert_eq!(ChartRenderer::new(2.0, None).dimensions(), (907, 454));
        assert_eq!(ChartRenderer::new(-1.0, None).dimensions(), (454, 227));
    }

    #[test]
    fn test_render_png() {
        let renderer = ChartRenderer::default();
        let chart = renderer
            .render(
                &[
                    series(&[("job", "a")], &["1", "3", "NaN", "2"]),
                    series(&[("job", "b")], &["2", "2.5", "4"]),
                ],
                &expr(Comparison::GreaterThan, 3.0),
                range(),
            )
            .unwrap();

        assert_eq!(&chart.png[..8], b"\x89PNG\r\n\x1a\n");
        assert_eq!(chart.title, "up > 3.00");
        let decoded = image::load_from_memory(&chart.png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), renderer.dimensions());
    }

    #[test]
    fn test_bundled_font_is_usable() {
        assert_eq!(load_bundled_font(), Ok(()));
    }

    #[test]
    fn test_render_without_usable_font_file() {
        let renderer = ChartRenderer::new(1.0, Some(PathBuf::from("/nonexistent/font.ttf")));
        let chart = renderer
            .render(
                &[series(&[("job", "a")], &["1", "2"])],
                &expr(Comparison::LessThan, 1.5),
                range(),
            )
            .unwrap();
        assert_eq!(&chart.png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_oversized_canvas_rejected() {
        let renderer = ChartRenderer::new(1.0e5, None);
        let result = renderer.render(
            &[series(&[("job", "a")], &["1", "2"])],
            &expr(Comparison::GreaterThan, 1.0),
            range(),
        );
        assert!(matches!(result, Err(RenderError::Draw(_))));
    }
}
