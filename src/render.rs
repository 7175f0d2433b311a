use std::error::Error;

use plotters::coord::ranged1d::{IntoSegmentedCoord, SegmentValue};
use plotters::coord::Shift;
use plotters::prelude::*;
use tracing::debug;

use crate::error::{AnalyticsError, AnalyticsResult};
use crate::models::{Aggregate, ChartArtifact, ChartKind};

pub const SVG_CONTENT_TYPE: &str = "image/svg+xml";
pub const PLACEHOLDER_NAME: &str = "no_data";

const CANVAS: (u32, u32) = (1200, 700);
const BAR_COLOR: RGBColor = RGBColor(0, 128, 128);
const LINE_COLOR: RGBColor = RGBColor(31, 119, 180);

type DrawResult = Result<(), Box<dyn Error>>;

fn title(kind: ChartKind) -> &'static str {
    match kind {
        ChartKind::CumulativeHours => "Cumulative Volunteer Hours Over Time",
        ChartKind::HoursByDate => "Total Volunteer Hours by Date (Highest to Lowest)",
        ChartKind::HoursByCategory => "Total Volunteer Hours by Category",
        ChartKind::HoursByVolunteer => "Top Volunteers by Hours",
    }
}

fn axis_descriptions(kind: ChartKind) -> (&'static str, &'static str) {
    match kind {
        ChartKind::CumulativeHours => ("Date", "Cumulative Hours"),
        ChartKind::HoursByDate => ("Date", "Total Hours"),
        ChartKind::HoursByCategory => ("Category", "Total Hours"),
        ChartKind::HoursByVolunteer => ("Volunteer", "Total Hours"),
    }
}

/// Leaves headroom above the tallest value for the bar labels.
fn y_upper_bound(points: &[(String, f64)]) -> f64 {
    let max = points.iter().map(|(_, v)| *v).fold(0.0, f64::max);
    if max > 0.0 {
        max * 1.15
    } else {
        1.0
    }
}

fn format_hours(hours: f64) -> String {
    let rounded = (hours * 100.0).round() / 100.0;
    format!("{rounded}")
}

fn draw_bars(root: &DrawingArea<SVGBackend<'_>, Shift>, aggregate: &Aggregate) -> DrawResult {
    let (x_desc, y_desc) = axis_descriptions(aggregate.kind);
    let labels: Vec<&str> = aggregate.points.iter().map(|(l, _)| l.as_str()).collect();

    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(root)
        .caption(title(aggregate.kind), ("sans-serif", 32).into_font())
        .margin(30)
        .x_label_area_size(80)
        .y_label_area_size(80)
        .build_cartesian_2d(
            (0..labels.len()).into_segmented(),
            0f64..y_upper_bound(&aggregate.points),
        )?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_desc(x_desc)
        .y_desc(y_desc)
        .x_labels(labels.len())
        .x_label_formatter(&|value| match value {
            SegmentValue::CenterOf(i) => labels.get(*i).map(|l| l.to_string()).unwrap_or_default(),
            _ => String::new(),
        })
        .draw()?;

    chart.draw_series(aggregate.points.iter().enumerate().map(|(i, (_, hours))| {
        let mut bar = Rectangle::new(
            [(SegmentValue::Exact(i), 0.0), (SegmentValue::Exact(i + 1), *hours)],
            BAR_COLOR.filled(),
        );
        bar.set_margin(0, 0, 6, 6);
        bar
    }))?;

    chart.draw_series(aggregate.points.iter().enumerate().map(|(i, (_, hours))| {
        Text::new(
            format_hours(*hours),
            (SegmentValue::CenterOf(i), *hours),
            ("sans-serif", 16).into_font(),
        )
    }))?;

    Ok(())
}

fn draw_line(root: &DrawingArea<SVGBackend<'_>, Shift>, aggregate: &Aggregate) -> DrawResult {
    let (x_desc, y_desc) = axis_descriptions(aggregate.kind);
    let labels: Vec<&str> = aggregate.points.iter().map(|(l, _)| l.as_str()).collect();
    // A single point still needs a non-empty x range.
    let x_end = labels.len().max(2) - 1;

    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(root)
        .caption(title(aggregate.kind), ("sans-serif", 32).into_font())
        .margin(30)
        .x_label_area_size(80)
        .y_label_area_size(80)
        .build_cartesian_2d(0usize..x_end, 0f64..y_upper_bound(&aggregate.points))?;

    chart
        .configure_mesh()
        .x_desc(x_desc)
        .y_desc(y_desc)
        .x_labels(labels.len().min(12))
        .x_label_formatter(&|i| labels.get(*i).map(|l| l.to_string()).unwrap_or_default())
        .draw()?;

    chart.draw_series(LineSeries::new(
        aggregate.points.iter().enumerate().map(|(i, (_, v))| (i, *v)),
        LINE_COLOR.stroke_width(2),
    ))?;
    chart.draw_series(
        aggregate
            .points
            .iter()
            .enumerate()
            .map(|(i, (_, v))| Circle::new((i, *v), 4, LINE_COLOR.filled())),
    )?;

    Ok(())
}

fn draw_placeholder(root: &DrawingArea<SVGBackend<'_>, Shift>) -> DrawResult {
    root.fill(&WHITE)?;
    root.draw(&Text::new(
        "No volunteer hours recorded yet",
        (CANVAS.0 as i32 / 2 - 220, CANVAS.1 as i32 / 2),
        ("sans-serif", 32).into_font(),
    ))?;
    root.present()?;
    Ok(())
}

/// Renders one aggregate as an SVG chart. An aggregate without points has
/// nothing to draw and is rejected.
pub fn render(aggregate: &Aggregate) -> AnalyticsResult<ChartArtifact> {
    let chart = aggregate.kind.name();
    if aggregate.is_empty() {
        return Err(AnalyticsError::render(chart, "aggregate has no data points"));
    }

    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, CANVAS).into_drawing_area();
        let drawn = match aggregate.kind {
            ChartKind::CumulativeHours => draw_line(&root, aggregate),
            _ => draw_bars(&root, aggregate),
        };
        drawn.map_err(|e| AnalyticsError::render(chart, e))?;
        root.present().map_err(|e| AnalyticsError::render(chart, e))?;
    }

    debug!(chart, bytes = svg.len(), "rendered chart");

    Ok(ChartArtifact {
        name: chart.to_string(),
        file_name: format!("{}.svg", aggregate.kind.file_stem()),
        content_type: SVG_CONTENT_TYPE,
        bytes: svg.into_bytes(),
        series: aggregate.points.clone(),
    })
}

pub fn render_placeholder() -> AnalyticsResult<ChartArtifact> {
    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, CANVAS).into_drawing_area();
        draw_placeholder(&root).map_err(|e| AnalyticsError::render(PLACEHOLDER_NAME, e))?;
    }

    Ok(ChartArtifact {
        name: PLACEHOLDER_NAME.to_string(),
        file_name: format!("{PLACEHOLDER_NAME}_plot.svg"),
        content_type: SVG_CONTENT_TYPE,
        bytes: svg.into_bytes(),
        series: Vec::new(),
    })
}
