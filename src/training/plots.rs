//! Diagnostic line plots of the training run.
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use std::path::{Path, PathBuf};

const WIDTH: u32 = 1000;
const HEIGHT: u32 = 500;
const MARGIN: u32 = 60;
const N_TICKS: u32 = 10;
const TITLE_SCALE: f32 = 22.;
const LABEL_SCALE: f32 = 16.;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXES: Rgb<u8> = Rgb([0, 0, 0]);
const LINE: Rgb<u8> = Rgb([31, 119, 180]);

/// Fonts tried when no font file is configured.
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/Library/Fonts/Arial.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Captions of a plot.
#[derive(Debug, Clone, Copy)]
pub struct PlotLabels<'a> {
    pub title: &'a str,
    pub x_label: &'a str,
    pub y_label: &'a str,
    pub legend: &'a str,
}

pub fn load_font<P: AsRef<Path>>(path: P) -> anyhow::Result<Font<'static>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    match Font::try_from_vec(bytes) {
        Some(font) => Ok(font),
        None => anyhow::bail!("{} is not a TrueType font", path.display()),
    }
}

/// The first readable font of a few usual system locations.
pub fn system_font() -> Option<(PathBuf, Font<'static>)> {
    SYSTEM_FONTS.iter().find_map(|path| {
        let path = PathBuf::from(path);
        load_font(&path).ok().map(|font| (path, font))
    })
}

fn draw_caption(img: &mut RgbImage, font: &Font, size: f32, x: i32, y: i32, text: &str) {
    draw_text_mut(img, AXES, x, y, Scale::uniform(size), font, text)
}

/// Renders `values` against their index as a polyline inside an axis box with evenly
/// spaced ticks and a legend swatch. The vertical axis spans the value range. Title, axis
/// labels and legend text are only drawn when a font is given.
pub fn render_line_plot(values: &[f64], labels: &PlotLabels, font: Option<&Font>) -> RgbImage {
    let mut img = RgbImage::new(WIDTH, HEIGHT);
    draw_filled_rect_mut(&mut img, Rect::at(0, 0).of_size(WIDTH, HEIGHT), BACKGROUND);
    let (left, top) = (MARGIN as f32, MARGIN as f32);
    let (right, bottom) = ((WIDTH - MARGIN) as f32, (HEIGHT - MARGIN) as f32);
    draw_hollow_rect_mut(
        &mut img,
        Rect::at(MARGIN as i32, MARGIN as i32).of_size(WIDTH - 2 * MARGIN, HEIGHT - 2 * MARGIN),
        AXES,
    );
    for i in 0..=N_TICKS {
        let x = left + (right - left) * i as f32 / N_TICKS as f32;
        draw_line_segment_mut(&mut img, (x, bottom), (x, bottom + 6.), AXES);
        let y = bottom - (bottom - top) * i as f32 / N_TICKS as f32;
        draw_line_segment_mut(&mut img, (left - 6., y), (left, y), AXES);
    }

    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if !finite.is_empty() {
        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = if max > min { max - min } else { 1. };
        let last = (values.len().max(2) - 1) as f32;
        let point = |i: usize, v: f64| {
            let x = left + (right - left) * i as f32 / last;
            let y = bottom - (bottom - top) * ((v - min) / range) as f32;
            (x, y)
        };
        let points: Vec<Option<(f32, f32)>> =
            values.iter().enumerate().map(|(i, &v)| v.is_finite().then(|| point(i, v))).collect();
        for pair in points.windows(2) {
            if let (Some(start), Some(end)) = (pair[0], pair[1]) {
                draw_line_segment_mut(&mut img, start, end, LINE);
            }
        }
        if let [Some((x, y))] = points.as_slice() {
            draw_filled_rect_mut(&mut img, Rect::at(*x as i32 - 2, *y as i32 - 2).of_size(5, 5), LINE);
        }
    }

    // Legend box in the upper right corner of the axes.
    let (legend_x, legend_y) = (right as i32 - 200, top as i32 + 10);
    draw_filled_rect_mut(&mut img, Rect::at(legend_x, legend_y).of_size(190, 28), BACKGROUND);
    draw_hollow_rect_mut(&mut img, Rect::at(legend_x, legend_y).of_size(190, 28), AXES);
    let swatch_y = (legend_y + 14) as f32;
    for dy in [-1., 0., 1.] {
        let (x0, x1) = ((legend_x + 8) as f32, (legend_x + 38) as f32);
        draw_line_segment_mut(&mut img, (x0, swatch_y + dy), (x1, swatch_y + dy), LINE);
    }

    if let Some(font) = font {
        draw_caption(&mut img, font, LABEL_SCALE, legend_x + 46, legend_y + 6, labels.legend);
        let (title_w, _) = text_size(Scale::uniform(TITLE_SCALE), font, labels.title);
        draw_caption(&mut img, font, TITLE_SCALE, (WIDTH as i32 - title_w) / 2, 18, labels.title);
        let (x_label_w, _) = text_size(Scale::uniform(LABEL_SCALE), font, labels.x_label);
        let x_label_y = HEIGHT as i32 - MARGIN as i32 / 2 - 4;
        draw_caption(&mut img, font, LABEL_SCALE, (WIDTH as i32 - x_label_w) / 2, x_label_y, labels.x_label);
        draw_caption(&mut img, font, LABEL_SCALE, 8, MARGIN as i32 - 24, labels.y_label);
    }
    img
}

pub fn save_line_plot<P: AsRef<Path>>(
    values: &[f64],
    labels: &PlotLabels,
    font: Option<&Font>,
    path: P,
) -> anyhow::Result<()> {
    render_line_plot(values, labels, font).save(path.as_ref())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LABELS: PlotLabels<'static> = PlotLabels {
        title: "Training Loss over Iterations",
        x_label: "Iterations",
        y_label: "Loss",
        legend: "Training Loss",
    };

    fn ink_outside_axes(img: &RgbImage) -> usize {
        img.enumerate_pixels()
            .filter(|(x, y, p)| {
                let inside = (MARGIN - 8..=WIDTH - MARGIN).contains(x) && (MARGIN..=HEIGHT - MARGIN + 8).contains(y);
                !inside && **p != BACKGROUND
            })
            .count()
    }

    #[test]
    fn polyline_is_drawn() {
        let img = render_line_plot(&[3., 1., 2.], &LABELS, None);
        assert_eq!(img.dimensions(), (WIDTH, HEIGHT));
        let line_pixels = img.pixels().filter(|p| **p == LINE).count();
        assert!(line_pixels as u32 >= (WIDTH - 2 * MARGIN) / 2);
        assert_eq!(*img.get_pixel(WIDTH / 2, MARGIN + 10), BACKGROUND);
        // Legend swatch.
        assert_eq!(*img.get_pixel(WIDTH - MARGIN - 180, MARGIN + 24), LINE);
        assert_eq!(ink_outside_axes(&img), 0);
    }

    #[test]
    fn captions_are_drawn_with_a_font() {
        let Some((path, font)) = system_font() else {
            eprintln!("no system font found, skipping");
            return;
        };
        assert!(load_font(&path).is_ok());
        let img = render_line_plot(&[3., 1., 2.], &LABELS, Some(&font));
        assert!(ink_outside_axes(&img) > 0);
    }

    #[test]
    fn non_font_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("font.ttf");
        std::fs::write(&path, b"not a font").unwrap();
        assert!(load_font(&path).is_err());
    }

    #[test]
    fn degenerate_series_render() {
        let dir = tempfile::tempdir().unwrap();
        save_line_plot(&[], &LABELS, None, dir.path().join("empty.png")).unwrap();
        save_line_plot(&[1.], &LABELS, None, dir.path().join("single.png")).unwrap();
        save_line_plot(&[f64::NAN, 2., 2.], &LABELS, None, dir.path().join("flat.png")).unwrap();
        assert!(dir.path().join("flat.png").is_file());
    }
}
