use serde::{Deserialize, Serialize};

/// Smallest marker the transform will ever emit, whatever the configuration says.
pub const HARD_MIN_WIDTH: f64 = 50.0;
pub const HARD_MIN_HEIGHT: f64 = 30.0;

const FALLBACK_WIDTH: f64 = 100.0;
const FALLBACK_HEIGHT: f64 = 60.0;

const DEFAULT_MIN_WIDTH: f64 = 100.0;
const DEFAULT_MIN_HEIGHT: f64 = 60.0;
const DEFAULT_MAX_RATIO: f64 = 0.35;
const MAX_RATIO_RANGE: (f64, f64) = (0.30, 0.40);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSpace {
    #[default]
    Physical,
    Logical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub space: CoordinateSpace,
}

impl ScreenRect {
    pub fn physical(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            space: CoordinateSpace::Physical,
        }
    }

    pub fn logical(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            space: CoordinateSpace::Logical,
        }
    }

    pub fn is_finite(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
    }

    pub fn is_valid(&self) -> bool {
        self.is_finite() && self.width > 0.0 && self.height > 0.0
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogicalSize {
    pub width: f64,
    pub height: f64,
}

impl LogicalSize {
    fn is_usable(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }
}

/// Display geometry for one operation. Fetched fresh per call; displays change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenContext {
    pub logical_size: LogicalSize,
    pub scale_factor: f64,
}

impl Default for ScreenContext {
    fn default() -> Self {
        Self {
            logical_size: LogicalSize {
                width: 1920.0,
                height: 1080.0,
            },
            scale_factor: 1.0,
        }
    }
}

impl ScreenContext {
    pub fn new(width: f64, height: f64, scale_factor: f64) -> Self {
        Self {
            logical_size: LogicalSize { width, height },
            scale_factor,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.logical_size.is_usable() && self.scale_factor.is_finite() && self.scale_factor > 0.0
    }

    /// Replaces unusable components with the default display.
    pub fn sanitized(&self) -> Self {
        let defaults = Self::default();
        Self {
            logical_size: if self.logical_size.is_usable() {
                self.logical_size
            } else {
                defaults.logical_size
            },
            scale_factor: if self.scale_factor.is_finite() && self.scale_factor > 0.0 {
                self.scale_factor
            } else {
                defaults.scale_factor
            },
        }
    }

    pub fn physical_size(&self) -> (f64, f64) {
        (
            self.logical_size.width * self.scale_factor,
            self.logical_size.height * self.scale_factor,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryLimits {
    pub min_width: f64,
    pub min_height: f64,
    pub max_width_ratio: f64,
    pub max_height_ratio: f64,
}

impl Default for GeometryLimits {
    fn default() -> Self {
        Self {
            min_width: DEFAULT_MIN_WIDTH,
            min_height: DEFAULT_MIN_HEIGHT,
            max_width_ratio: DEFAULT_MAX_RATIO,
            max_height_ratio: DEFAULT_MAX_RATIO,
        }
    }
}

impl GeometryLimits {
    /// Pulls every limit back into its accepted range.
    pub fn sanitized(&self) -> Self {
        Self {
            min_width: floor_or_default(self.min_width, HARD_MIN_WIDTH, DEFAULT_MIN_WIDTH),
            min_height: floor_or_default(self.min_height, HARD_MIN_HEIGHT, DEFAULT_MIN_HEIGHT),
            max_width_ratio: ratio_or_default(self.max_width_ratio),
            max_height_ratio: ratio_or_default(self.max_height_ratio),
        }
    }
}

fn floor_or_default(value: f64, floor: f64, default_value: f64) -> f64 {
    if value.is_finite() {
        value.max(floor)
    } else {
        default_value
    }
}

fn ratio_or_default(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(MAX_RATIO_RANGE.0, MAX_RATIO_RANGE.1)
    } else {
        DEFAULT_MAX_RATIO
    }
}

pub fn to_logical(rect: &ScreenRect, ctx: &ScreenContext) -> ScreenRect {
    to_logical_with(rect, ctx, &GeometryLimits::default())
}

/// Physical (or already logical) rectangle to a logical rectangle that is safe to
/// render: finite, inside the screen, and within the size limits. Total and pure.
pub fn to_logical_with(rect: &ScreenRect, ctx: &ScreenContext, limits: &GeometryLimits) -> ScreenRect {
    let limits = limits.sanitized();
    if !ctx.is_usable() || !rect.is_finite() {
        return fallback_rect(&ctx.sanitized());
    }

    let (x, y, w, h) = match rect.space {
        CoordinateSpace::Physical => (
            rect.x / ctx.scale_factor,
            rect.y / ctx.scale_factor,
            rect.width / ctx.scale_factor,
            rect.height / ctx.scale_factor,
        ),
        CoordinateSpace::Logical => (rect.x, rect.y, rect.width, rect.height),
    };
    // tiny scale factors can overflow the division
    if ![x, y, w, h].iter().all(|v| v.is_finite()) {
        return fallback_rect(ctx);
    }

    let screen = ctx.logical_size;
    let (x, width) = fit_axis(x, w, screen.width, limits.min_width, limits.max_width_ratio);
    let (y, height) = fit_axis(y, h, screen.height, limits.min_height, limits.max_height_ratio);
    ScreenRect::logical(x, y, width, height)
}

/// Fixed-size marker centered on the screen, used whenever the input is unusable.
pub fn fallback_rect(ctx: &ScreenContext) -> ScreenRect {
    let screen = ctx.sanitized().logical_size;
    let width = FALLBACK_WIDTH.min(screen.width);
    let height = FALLBACK_HEIGHT.min(screen.height);
    ScreenRect::logical(
        (screen.width - width) / 2.0,
        (screen.height - height) / 2.0,
        width,
        height,
    )
}

// Clip to [0, extent] first; only shift the origin when clipping would leave
// less than the minimum span.
fn fit_axis(origin: f64, span: f64, extent: f64, min_span: f64, max_ratio: f64) -> (f64, f64) {
    let max_span = (extent * max_ratio).max(min_span).min(extent);
    let min_span = min_span.min(max_span);
    let span = span.clamp(min_span, max_span);

    let start = origin.clamp(0.0, extent);
    let end = (origin + span).clamp(0.0, extent);
    let visible = end - start;
    if visible >= min_span {
        return (start, visible);
    }

    let start = start.min(extent - min_span).max(0.0);
    (start, min_span)
}
