//! Elevation profile chart.

use std::panic;
use std::path::Path;

use anyhow::Result;
use plotters::prelude::*;
use plotters::style::{FontDesc, FontFamily, FontStyle, FontTransform};
use plotters_backend::{
    text_anchor, BackendColor, BackendCoord, BackendStyle, BackendTextStyle, DrawingBackend,
    DrawingErrorKind,
};
use roadbook::ProfileAnnotations;

const FLOOR_MARGIN_M: f64 = 50.0;
const LABEL_OFFSET_M: f64 = 10.0;
const LINE_COLOR: RGBColor = RGBColor(220, 20, 20);
const FILL_COLOR: RGBColor = RGBColor(144, 238, 144);
const ENDPOINT_COLOR: RGBColor = RGBColor(30, 60, 220);
const MARKER_COLOR: RGBColor = RGBColor(255, 140, 0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChartKind {
    Png,
    Svg,
}

/// Render without letting a backend panic take the process down.
pub fn render_profile_guard(
    profile: &ProfileAnnotations,
    title: &str,
    path: &Path,
    kind: ChartKind,
) -> Result<(), String> {
    // Font fallbacks unwind through the backend; keep them off stderr.
    let hook = panic::take_hook();
    panic::set_hook(Box::new(|_| {}));
    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        render_profile(profile, title, path, kind).map_err(|e| format!("plotting error: {e}"))
    }));
    panic::set_hook(hook);
    outcome.map_err(|_| "plotting backend panicked".to_string())?
}

fn render_profile(
    profile: &ProfileAnnotations,
    title: &str,
    path: &Path,
    kind: ChartKind,
) -> Result<()> {
    match kind {
        ChartKind::Png => {
            let backend = BitMapBackend::new(path, (1600, 700));
            let root = FontSafeBackend::new(backend).into_drawing_area();
            draw_profile(root, profile, title)
        }
        ChartKind::Svg => {
            let backend = SVGBackend::new(path, (1600, 700));
            let root = FontSafeBackend::new(backend).into_drawing_area();
            draw_profile(root, profile, title)
        }
    }
}

fn elevation_at(profile: &ProfileAnnotations, idx: usize) -> Option<f64> {
    profile.elevations_m.get(idx).copied().flatten()
}

fn draw_profile<DB>(
    root: DrawingArea<DB, plotters::coord::Shift>,
    profile: &ProfileAnnotations,
    title: &str,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;

    let series: Vec<(f64, f64)> = profile
        .distances_km
        .iter()
        .zip(&profile.elevations_m)
        .filter_map(|(&km, ele)| Some((km, (*ele)?)))
        .collect();
    if series.is_empty() {
        root.present()?;
        return Ok(());
    }

    let floor = profile.min_elevation_m.unwrap_or(0.0) - FLOOR_MARGIN_M;
    let top = profile.max_elevation_m.unwrap_or(0.0);
    // Headroom for the vertical labels.
    let ceiling = top + (top - floor).max(1.0) * 0.6;
    let x_max = profile.total_km.max(0.001);

    let mut chart = ChartBuilder::on(&root)
        .caption(title, FontDesc::new(FontFamily::SansSerif, 26.0, FontStyle::Normal))
        .margin(25)
        .set_label_area_size(LabelAreaPosition::Left, 60)
        .set_label_area_size(LabelAreaPosition::Bottom, 45)
        .build_cartesian_2d(0.0..x_max, floor..ceiling)?;

    chart
        .configure_mesh()
        .light_line_style(&BLACK.mix(0.06))
        .bold_line_style(&BLACK.mix(0.15))
        .x_desc("Distance (km)")
        .y_desc("Elevation (m)")
        .x_label_formatter(&|v| format!("{:.0}", v))
        .y_label_formatter(&|v| format!("{:.0}", v))
        .draw()?;

    chart.draw_series(
        AreaSeries::new(series.iter().copied(), floor, FILL_COLOR.mix(0.4))
            .border_style(ShapeStyle {
                color: LINE_COLOR.to_rgba(),
                filled: false,
                stroke_width: 2,
            }),
    )?;

    let vertical = FontDesc::new(FontFamily::SansSerif, 13.0, FontStyle::Normal)
        .transform(FontTransform::Rotate270);

    chart.draw_series(profile.labels.iter().map(|l| {
        let y = elevation_at(profile, l.index).unwrap_or(floor) + LABEL_OFFSET_M;
        Text::new(l.label.clone(), (l.km, y), vertical.color(&BLACK))
    }))?;

    let (first, last) = (series[0], series[series.len() - 1]);
    let endpoint_font = FontDesc::new(FontFamily::SansSerif, 15.0, FontStyle::Normal);
    for (point, name) in [(first, "Start"), (last, "Finish")] {
        chart.draw_series(std::iter::once(Circle::new(point, 5, ENDPOINT_COLOR.filled())))?;
        chart.draw_series(std::iter::once(Text::new(
            name,
            (point.0, point.1 + LABEL_OFFSET_M * 2.0),
            endpoint_font.color(&ENDPOINT_COLOR),
        )))?;
    }

    chart.draw_series(
        profile
            .markers
            .iter()
            .map(|m| TriangleMarker::new((m.km, m.elevation_m), 8, MARKER_COLOR.filled())),
    )?;
    chart.draw_series(profile.markers.iter().map(|m| {
        Text::new(
            m.label.clone(),
            (m.km, m.elevation_m + LABEL_OFFSET_M),
            vertical.color(&MARKER_COLOR),
        )
    }))?;

    root.present()?;
    Ok(())
}

/// Forwards to `inner`, drawing text with a built-in bitmap font when the
/// inner backend has no usable font.
struct FontSafeBackend<DB> {
    inner: DB,
}

impl<DB> FontSafeBackend<DB> {
    fn new(inner: DB) -> Self {
        Self { inner }
    }
}

impl<DB: DrawingBackend> DrawingBackend for FontSafeBackend<DB> {
    type ErrorType = DB::ErrorType;

    fn get_size(&self) -> (u32, u32) {
        self.inner.get_size()
    }

    fn ensure_prepared(&mut self) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.ensure_prepared()
    }

    fn present(&mut self) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.present()
    }

    fn draw_pixel(
        &mut self,
        point: BackendCoord,
        color: BackendColor,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_pixel(point, color)
    }

    fn draw_line<S: BackendStyle>(
        &mut self,
        from: BackendCoord,
        to: BackendCoord,
        style: &S,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_line(from, to, style)
    }

    fn draw_rect<S: BackendStyle>(
        &mut self,
        upper_left: BackendCoord,
        bottom_right: BackendCoord,
        style: &S,
        fill: bool,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_rect(upper_left, bottom_right, style, fill)
    }

    fn draw_path<S: BackendStyle, I: IntoIterator<Item = BackendCoord>>(
        &mut self,
        path: I,
        style: &S,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_path(path, style)
    }

    fn fill_polygon<S: BackendStyle, I: IntoIterator<Item = BackendCoord>>(
        &mut self,
        vert: I,
        style: &S,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.fill_polygon(vert, style)
    }

    fn draw_circle<S: BackendStyle>(
        &mut self,
        center: BackendCoord,
        radius: u32,
        style: &S,
        fill: bool,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_circle(center, radius, style, fill)
    }

    fn blit_bitmap(
        &mut self,
        pos: BackendCoord,
        (iw, ih): (u32, u32),
        src: &[u8],
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.blit_bitmap(pos, (iw, ih), src)
    }

    fn draw_text<TStyle: BackendTextStyle>(
        &mut self,
        text: &str,
        style: &TStyle,
        pos: BackendCoord,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        match panic::catch_unwind(panic::AssertUnwindSafe(|| {
            self.inner.draw_text(text, style, pos)
        })) {
            Ok(result) => result,
            Err(_) => self.draw_text_fallback(text, style, pos),
        }
    }

    fn estimate_text_size<TStyle: BackendTextStyle>(
        &self,
        text: &str,
        style: &TStyle,
    ) -> Result<(u32, u32), DrawingErrorKind<Self::ErrorType>> {
        self.inner.estimate_text_size(text, style)
    }
}

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;

impl<DB: DrawingBackend> FontSafeBackend<DB> {
    fn draw_text_fallback<TStyle: BackendTextStyle>(
        &mut self,
        text: &str,
        style: &TStyle,
        pos: BackendCoord,
    ) -> Result<(), DrawingErrorKind<DB::ErrorType>> {
        let color = style.color();
        if color.alpha == 0.0 || text.trim().is_empty() {
            return Ok(());
        }

        let ((_, min_y), (_, max_y)) = style
            .layout_box(text)
            .map_err(|e| DrawingErrorKind::FontError(Box::new(e)))?;
        let scale = ((max_y - min_y).max(1) as f64 / GLYPH_HEIGHT as f64)
            .round()
            .max(1.0) as i32;
        let advance = (GLYPH_WIDTH + 1) * scale;
        let width = advance * text.chars().count() as i32;
        let height = GLYPH_HEIGHT * scale;

        let dx = match style.anchor().h_pos {
            text_anchor::HPos::Left => 0,
            text_anchor::HPos::Right => -width,
            text_anchor::HPos::Center => -width / 2,
        };
        let dy = match style.anchor().v_pos {
            text_anchor::VPos::Top => 0,
            text_anchor::VPos::Center => -height / 2,
            text_anchor::VPos::Bottom => -height,
        };
        let transform = style.transform();

        for (n, ch) in text.chars().enumerate() {
            let Some(rows) = glyph(ch) else {
                continue;
            };
            let origin_x = dx + n as i32 * advance;
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                        continue;
                    }
                    let x = origin_x + col * scale;
                    let y = dy + row as i32 * scale;
                    for sx in 0..scale {
                        for sy in 0..scale {
                            let (tx, ty) = transform.transform(x + sx, y + sy);
                            self.inner
                                .draw_pixel((pos.0 + tx, pos.1 + ty), color)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// 5x7 bitmap, one byte per row, bit 4 is the leftmost column. Accented
/// vowels fold onto their base letter.
fn glyph(ch: char) -> Option<[u8; 7]> {
    let folded = match ch {
        'à' | 'á' | 'â' | 'À' => 'A',
        'è' | 'é' | 'ê' | 'È' | 'É' => 'E',
        'ì' | 'í' | 'Ì' => 'I',
        'ò' | 'ó' | 'Ò' => 'O',
        'ù' | 'ú' | 'Ù' => 'U',
        other => other.to_ascii_uppercase(),
    };
    Some(match folded {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '(' => [0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02],
        ')' => [0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ',' => [0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '/' => [0x01, 0x01, 0x02, 0x04, 0x08, 0x10, 0x10],
        '\'' => [0x04, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00],
        _ => return None,
    })
}
