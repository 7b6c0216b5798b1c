//! Recording requests.
//!
//! [`RequestSpec`] is the loosely-typed shape submitted by callers (every field
//! optional, camelCase on the wire). [`RecordingRequest::from_spec`] applies
//! defaults, coerces dimensions to even values and validates the URL and crop
//! origin. A `RecordingRequest` is immutable once built.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use siterec_common::error::{SiterecError, SiterecResult};
use url::Url;

/// Default recording duration in milliseconds.
pub const DEFAULT_DURATION_MS: u64 = 30_000;

/// Default output and viewport width.
pub const DEFAULT_WIDTH: u32 = 1920;

/// Default output and viewport height.
pub const DEFAULT_HEIGHT: u32 = 1080;

const MIN_DIMENSION: u32 = 2;

/// Request shape as submitted by a caller, before defaults and validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    pub url: Option<String>,
    /// Recording duration in milliseconds.
    pub duration: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub crop_x: Option<u32>,
    pub crop_y: Option<u32>,
    pub viewport_width: Option<u32>,
    pub viewport_height: Option<u32>,
}

impl RequestSpec {
    /// A request with only the URL set.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }
}

/// Crop rectangle in viewport pixels, applied before scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A validated recording request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingRequest {
    url: Url,
    duration_ms: u64,
    width: u32,
    height: u32,
    crop_x: u32,
    crop_y: u32,
    viewport_width: u32,
    viewport_height: u32,
}

impl RecordingRequest {
    /// Build a request for `url` with every other field defaulted.
    pub fn new(url: &str) -> SiterecResult<Self> {
        Self::from_spec(RequestSpec::for_url(url))
    }

    /// Apply defaults, even-coerce dimensions and validate.
    pub fn from_spec(spec: RequestSpec) -> SiterecResult<Self> {
        let raw_url = spec
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SiterecError::invalid_request("URL is required"))?;
        let url = parse_url(raw_url)?;

        let duration_ms = spec.duration.unwrap_or(DEFAULT_DURATION_MS);
        if duration_ms == 0 {
            return Err(SiterecError::invalid_request(
                "duration must be greater than zero",
            ));
        }

        let width = dimension("width", spec.width.unwrap_or(DEFAULT_WIDTH))?;
        let height = dimension("height", spec.height.unwrap_or(DEFAULT_HEIGHT))?;
        let viewport_width = dimension(
            "viewportWidth",
            spec.viewport_width.unwrap_or(DEFAULT_WIDTH),
        )?;
        let viewport_height = dimension(
            "viewportHeight",
            spec.viewport_height.unwrap_or(DEFAULT_HEIGHT),
        )?;

        let crop_x = spec.crop_x.unwrap_or(0);
        let crop_y = spec.crop_y.unwrap_or(0);
        if crop_x.saturating_add(MIN_DIMENSION) > viewport_width
            || crop_y.saturating_add(MIN_DIMENSION) > viewport_height
        {
            return Err(SiterecError::invalid_request(format!(
                "crop origin ({crop_x},{crop_y}) lies outside the {viewport_width}x{viewport_height} viewport"
            )));
        }

        Ok(Self {
            url,
            duration_ms,
            width,
            height,
            crop_x,
            crop_y,
            viewport_width,
            viewport_height,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Output width (even).
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Output height (even).
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn crop_x(&self) -> u32 {
        self.crop_x
    }

    pub fn crop_y(&self) -> u32 {
        self.crop_y
    }

    /// Browser viewport width (even).
    pub fn viewport_width(&self) -> u32 {
        self.viewport_width
    }

    /// Browser viewport height (even).
    pub fn viewport_height(&self) -> u32 {
        self.viewport_height
    }

    /// The crop applied to each frame, if any.
    ///
    /// Cropping applies whenever an origin offset is given or the output size
    /// differs from the viewport. The rectangle is clamped to the viewport and
    /// kept even.
    pub fn crop_rect(&self) -> Option<CropRect> {
        let needs_crop = self.crop_x > 0
            || self.crop_y > 0
            || self.width != self.viewport_width
            || self.height != self.viewport_height;
        if !needs_crop {
            return None;
        }

        let width = even(self.width.min(self.viewport_width - self.crop_x));
        let height = even(self.height.min(self.viewport_height - self.crop_y));
        Some(CropRect {
            x: self.crop_x,
            y: self.crop_y,
            width,
            height,
        })
    }
}

/// Round down to the nearest even number.
pub fn even(n: u32) -> u32 {
    n - n % 2
}

fn dimension(name: &str, value: u32) -> SiterecResult<u32> {
    let value = even(value);
    if value < MIN_DIMENSION {
        return Err(SiterecError::invalid_request(format!(
            "{name} must be at least {MIN_DIMENSION} pixels"
        )));
    }
    Ok(value)
}

fn parse_url(raw: &str) -> SiterecResult<Url> {
    let url = Url::parse(raw)
        .map_err(|e| SiterecError::invalid_request(format!("Invalid URL format: {e}")))?;
    match url.scheme() {
        "http" | "https" | "file" => Ok(url),
        other => Err(SiterecError::invalid_request(format!(
            "Unsupported URL scheme '{other}'"
        ))),
    }
}
