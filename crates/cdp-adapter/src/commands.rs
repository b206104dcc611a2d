//! Parameter and result types for page commands.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How long and how thoroughly `navigate` waits for a page to settle.
#[derive(Clone, Debug)]
pub struct NavigateOptions {
    pub timeout: Duration,
    /// Also wait for the network tap to report the page idle after DOM ready.
    pub wait_network_idle: bool,
}

impl Default for NavigateOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            wait_network_idle: true,
        }
    }
}

/// Result of a successful navigation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Navigation {
    pub url: String,
    pub loader_id: Option<String>,
    pub elapsed_ms: u64,
}

/// Region passed to `Page.captureScreenshot`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotClip {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub scale: f64,
}

impl ScreenshotClip {
    /// Clip covering the whole document, taken from a `Page.getLayoutMetrics` response.
    pub fn full_page(layout: &Value) -> Option<Self> {
        let size = layout
            .get("cssContentSize")
            .or_else(|| layout.get("contentSize"))?;
        let width = size.get("width")?.as_f64()?;
        let height = size.get("height")?.as_f64()?;
        if width <= 0.0 || height <= 0.0 {
            return None;
        }
        Some(Self {
            x: 0.0,
            y: 0.0,
            width: width.ceil(),
            height: height.ceil(),
            scale: 1.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_page_clip_prefers_css_size() {
        let layout = json!({
            "contentSize": {"x": 0, "y": 0, "width": 2560, "height": 8000},
            "cssContentSize": {"x": 0, "y": 0, "width": 1280.4, "height": 4000}
        });
        let clip = ScreenshotClip::full_page(&layout).expect("clip");
        assert_eq!(clip.width, 1281.0);
        assert_eq!(clip.height, 4000.0);
        assert_eq!(clip.scale, 1.0);
    }

    #[test]
    fn empty_layout_has_no_clip() {
        assert!(ScreenshotClip::full_page(&json!({})).is_none());
        let zero = json!({"contentSize": {"width": 0, "height": 10}});
        assert!(ScreenshotClip::full_page(&zero).is_none());
    }
}
