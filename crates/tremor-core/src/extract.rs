//! Curve extraction: chart image bytes to an ordered list of samples.
//!
//! The chart is a log-scale amplitude plot. Each extraction mode carries its
//! own [`ExtractionProfile`] (plot rectangle, curve colour, axis calibration,
//! time span), so the primary and fallback charts share one algorithm:
//!
//! ```text
//! decode -> colour mask -> 3x3 neighbour filter -> per-column thinning
//!        -> row->value (log) / column->time -> samples
//! ```

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::ExtractionError;
use crate::sample::TremorSample;

// ---------------------------------------------------------------------------
// ExtractionMode
// ---------------------------------------------------------------------------

/// Which chart variant a run extracts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    #[default]
    Primary,
    Fallback,
}

impl ExtractionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Profile types
// ---------------------------------------------------------------------------

/// Plot rectangle in image pixels. `right` and `bottom` are exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotArea {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl PlotArea {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    fn check(&self, image_width: u32, image_height: u32) -> Result<(), ExtractionError> {
        if self.width() == 0
            || self.height() == 0
            || self.right > image_width
            || self.bottom > image_height
        {
            return Err(ExtractionError::PlotArea(format!(
                "[{},{})x[{},{}) in {image_width}x{image_height}",
                self.left, self.right, self.top, self.bottom
            )));
        }
        Ok(())
    }
}

/// Which pixels belong to the curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PixelFilter {
    /// Every channel within `tolerance` of `target`.
    Rgb { target: [u8; 3], tolerance: u8 },
    /// Rec. 601 luma in `[min, max]`.
    Luma { min: u8, max: u8 },
}

impl PixelFilter {
    pub fn matches(&self, px: &Rgb<u8>) -> bool {
        match self {
            Self::Rgb { target, tolerance } => px
                .0
                .iter()
                .zip(target.iter())
                .all(|(c, t)| c.abs_diff(*t) <= *tolerance),
            Self::Luma { min, max } => {
                let l = luma(px);
                l >= *min && l <= *max
            }
        }
    }
}

fn luma(px: &Rgb<u8>) -> u8 {
    let [r, g, b] = px.0;
    (0.299 * f64::from(r) + 0.587 * f64::from(g) + 0.114 * f64::from(b)).round() as u8
}

/// A legend tick: an image row and the amplitude printed next to it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisPoint {
    pub row: f64,
    pub value: f64,
}

/// Logarithmic y axis through two legend ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogCalibration {
    pub upper: AxisPoint,
    pub lower: AxisPoint,
}

impl LogCalibration {
    /// Amplitude at an image row; `log10(value)` is linear in row.
    pub fn value_at(&self, row: f64) -> f64 {
        let (r1, l1) = (self.upper.row, self.upper.value.log10());
        let (r2, l2) = (self.lower.row, self.lower.value.log10());
        let t = (row - r1) / (r2 - r1);
        10f64.powf(l1 + t * (l2 - l1))
    }

    pub fn is_well_formed(&self) -> bool {
        let finite = [
            self.upper.row,
            self.upper.value,
            self.lower.row,
            self.lower.value,
        ]
        .iter()
        .all(|v| v.is_finite());
        finite && self.upper.value > 0.0 && self.lower.value > 0.0 && self.upper.row < self.lower.row
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionProfile {
    pub plot: PlotArea,
    pub filter: PixelFilter,
    pub calibration: LogCalibration,
    /// Time covered by the full plot width.
    pub span_hours: f64,
    /// Sample timestamps are floored to this grid.
    #[serde(default = "default_resolution_secs")]
    pub resolution_secs: i64,
    /// Mask pixels with fewer set neighbours are treated as noise. 0 disables.
    #[serde(default = "default_min_neighbors")]
    pub min_neighbors: u8,
    #[serde(default = "default_min_columns")]
    pub min_columns: usize,
    #[serde(default = "default_rolling_window")]
    pub rolling_window: usize,
}

fn default_resolution_secs() -> i64 {
    600
}

fn default_min_neighbors() -> u8 {
    1
}

fn default_min_columns() -> usize {
    20
}

fn default_rolling_window() -> usize {
    6
}

impl ExtractionProfile {
    /// Seven-day RMS chart, blue trace, 0.1 to 100 over three decades.
    pub fn primary_default() -> Self {
        Self {
            plot: PlotArea {
                left: 60,
                top: 20,
                right: 980,
                bottom: 380,
            },
            filter: PixelFilter::Rgb {
                target: [0, 0, 255],
                tolerance: 90,
            },
            calibration: LogCalibration {
                upper: AxisPoint {
                    row: 20.0,
                    value: 100.0,
                },
                lower: AxisPoint {
                    row: 380.0,
                    value: 0.1,
                },
            },
            span_hours: 168.0,
            resolution_secs: default_resolution_secs(),
            min_neighbors: default_min_neighbors(),
            min_columns: default_min_columns(),
            rolling_window: default_rolling_window(),
        }
    }

    /// Two-day alternate chart, dark trace, 0.05 to 50.
    pub fn fallback_default() -> Self {
        Self {
            plot: PlotArea {
                left: 45,
                top: 15,
                right: 785,
                bottom: 285,
            },
            filter: PixelFilter::Luma { min: 0, max: 70 },
            calibration: LogCalibration {
                upper: AxisPoint {
                    row: 15.0,
                    value: 50.0,
                },
                lower: AxisPoint {
                    row: 285.0,
                    value: 0.05,
                },
            },
            span_hours: 48.0,
            resolution_secs: 120,
            min_neighbors: default_min_neighbors(),
            min_columns: default_min_columns(),
            rolling_window: default_rolling_window(),
        }
    }

    fn millis_per_column(&self) -> f64 {
        self.span_hours * 3_600_000.0 / f64::from(self.plot.width().max(1))
    }

    /// Floor `ts` to the profile's timestamp grid.
    pub fn snap(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let grid = self.resolution_secs.max(1);
        let secs = ts.timestamp();
        DateTime::from_timestamp(secs - secs.rem_euclid(grid), 0).unwrap_or(ts)
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Samples plus column diagnostics for the run record.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub samples: Vec<TremorSample>,
    /// Columns with any matching pixel before noise reduction.
    pub raw_columns: usize,
    /// Samples produced, after columns sharing a grid timestamp collapse
    /// into the rightmost one.
    pub parsed_columns: usize,
}

/// Decode `bytes` and extract the curve, pinning the right edge of the plot
/// to `anchor`.
pub fn extract(
    bytes: &[u8],
    profile: &ExtractionProfile,
    anchor: DateTime<Utc>,
) -> Result<Extraction, ExtractionError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| ExtractionError::Decode(e.to_string()))?
        .to_rgb8();
    extract_image(&img, profile, anchor)
}

pub fn extract_image(
    img: &RgbImage,
    profile: &ExtractionProfile,
    anchor: DateTime<Utc>,
) -> Result<Extraction, ExtractionError> {
    let plot = &profile.plot;
    plot.check(img.width(), img.height())?;

    let mask = CurveMask::build(img, plot, &profile.filter);
    let raw_columns = mask.occupied_columns();
    let mask = mask.denoise(profile.min_neighbors);

    let cal = &profile.calibration;
    let ms_per_col = profile.millis_per_column();
    let window_len = profile.rolling_window.max(1);
    let mut window: VecDeque<f64> = VecDeque::with_capacity(window_len);
    let mut samples: Vec<TremorSample> = Vec::new();
    let mut curve_columns = 0;

    for col in 0..mask.width {
        let rows = mask.rows_in(col);
        let (Some(&first), Some(&last)) = (rows.first(), rows.last()) else {
            continue;
        };
        curve_columns += 1;

        let top = f64::from(plot.top);
        let value = cal.value_at(median(&rows) + top);
        let peak = cal
            .value_at(f64::from(first) + top)
            .max(cal.value_at(f64::from(last) + top));

        if window.len() == window_len {
            window.pop_front();
        }
        window.push_back(value);
        let rolling_avg = window.iter().sum::<f64>() / window.len() as f64;

        let cols_from_right = f64::from(mask.width - 1 - col);
        let offset = Duration::milliseconds((cols_from_right * ms_per_col).round() as i64);
        let timestamp = profile.snap(anchor - offset);

        if samples.last().is_some_and(|s| s.timestamp == timestamp) {
            samples.pop();
        }
        samples.push(TremorSample::new(timestamp, value).with_secondary(peak, rolling_avg));
    }

    if curve_columns < profile.min_columns {
        return Err(ExtractionError::NoCurvePixels {
            found: curve_columns,
            required: profile.min_columns,
        });
    }

    Ok(Extraction {
        parsed_columns: samples.len(),
        samples,
        raw_columns,
    })
}

fn median(sorted: &[u32]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        f64::from(sorted[n / 2])
    } else {
        (f64::from(sorted[n / 2 - 1]) + f64::from(sorted[n / 2])) / 2.0
    }
}

/// Boolean curve mask over the plot area, row-major.
struct CurveMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl CurveMask {
    fn build(img: &RgbImage, plot: &PlotArea, filter: &PixelFilter) -> Self {
        let (width, height) = (plot.width(), plot.height());
        let mut bits = Vec::with_capacity((width * height) as usize);
        for y in plot.top..plot.bottom {
            for x in plot.left..plot.right {
                bits.push(filter.matches(img.get_pixel(x, y)));
            }
        }
        Self {
            width,
            height,
            bits,
        }
    }

    fn get(&self, x: i64, y: i64) -> bool {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return false;
        }
        self.bits[(y as usize) * self.width as usize + x as usize]
    }

    fn occupied_columns(&self) -> usize {
        (0..self.width)
            .filter(|&x| (0..self.height).any(|y| self.get(i64::from(x), i64::from(y))))
            .count()
    }

    fn denoise(self, min_neighbors: u8) -> Self {
        if min_neighbors == 0 {
            return self;
        }
        let mut bits = vec![false; self.bits.len()];
        for y in 0..i64::from(self.height) {
            for x in 0..i64::from(self.width) {
                if !self.get(x, y) {
                    continue;
                }
                let mut neighbours = 0u8;
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        if (dx, dy) != (0, 0) && self.get(x + dx, y + dy) {
                            neighbours += 1;
                        }
                    }
                }
                if neighbours >= min_neighbors {
                    bits[(y as usize) * self.width as usize + x as usize] = true;
                }
            }
        }
        Self { bits, ..self }
    }

    /// Set rows in column `x`, ascending.
    fn rows_in(&self, x: u32) -> Vec<u32> {
        (0..self.height)
            .filter(|&y| self.get(i64::from(x), i64::from(y)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub const BLUE: Rgb<u8> = Rgb([0, 0, 255]);
    pub const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    /// 100x100 plot filling the image, one minute per column, 100 at row 0
    /// down to 1 at row 100.
    pub fn test_profile() -> ExtractionProfile {
        ExtractionProfile {
            plot: PlotArea {
                left: 0,
                top: 0,
                right: 100,
                bottom: 100,
            },
            filter: PixelFilter::Rgb {
                target: [0, 0, 255],
                tolerance: 60,
            },
            calibration: LogCalibration {
                upper: AxisPoint {
                    row: 0.0,
                    value: 100.0,
                },
                lower: AxisPoint {
                    row: 100.0,
                    value: 1.0,
                },
            },
            span_hours: 100.0 / 60.0,
            resolution_secs: 60,
            min_neighbors: 1,
            min_columns: 10,
            rolling_window: 3,
        }
    }

    /// Render a white 100x100 chart with a 3px trace at `row_for(col)`.
    pub fn render(row_for: impl Fn(u32) -> Option<u32>, color: Rgb<u8>) -> RgbImage {
        let mut img = RgbImage::from_pixel(100, 100, Rgb([255, 255, 255]));
        for x in 0..100 {
            if let Some(row) = row_for(x) {
                for y in row.saturating_sub(1)..=(row + 1).min(99) {
                    img.put_pixel(x, y, color);
                }
            }
        }
        img
    }

    pub fn png(img: &RgbImage) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    /// PNG of a flat trace at `row`.
    pub fn flat_chart(row: u32) -> Vec<u8> {
        png(&render(|_| Some(row), BLUE))
    }
}
