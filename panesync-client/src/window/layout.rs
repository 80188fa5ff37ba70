use serde::{Deserialize, Serialize};

use panesync_core::labels;

/// Window sizing (logical pixels).
pub const CALL_W_PX: u32 = 720;
pub const CALL_H_PX: u32 = 480;

pub const CALL_ACCEPT_W_PX: u32 = 280;
pub const CALL_ACCEPT_H_PX: u32 = 120;

pub const NOTIFY_W_PX: u32 = 220;
pub const NOTIFY_BASE_H_PX: u32 = 70;
pub const NOTIFY_ROW_H_PX: u32 = 48;
pub const NOTIFY_MAX_ROWS: usize = 6;

pub const PREVIEW_W_PX: u32 = 900;
pub const PREVIEW_H_PX: u32 = 650;

/// Gap between a bottom-right popup and the edge of the work area.
pub const POPUP_MARGIN_RIGHT_PX: i32 = 30;
pub const POPUP_MARGIN_BOTTOM_PX: i32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else {
            Self::Other
        }
    }
}

/// Usable screen area, taskbar and menu bar excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenArea {
    pub width: u32,
    pub height: u32,
}

/// Where a small popup of `width` x `height` should open. On Windows that is
/// the bottom-right corner, elsewhere the menu bar and dock make the corner
/// unreliable, so the popup is centered.
pub fn popup_position(platform: Platform, screen: ScreenArea, width: u32, height: u32) -> (i32, i32) {
    let (screen_w, screen_h) = (i64::from(screen.width), i64::from(screen.height));
    let (w, h) = (i64::from(width), i64::from(height));
    let (x, y) = match platform {
        Platform::Windows => (
            screen_w - w - i64::from(POPUP_MARGIN_RIGHT_PX),
            screen_h - h - i64::from(POPUP_MARGIN_BOTTOM_PX),
        ),
        _ => (screen_w / 2 - w / 2, screen_h / 2 - h / 2),
    };
    (clamp_coord(x), clamp_coord(y))
}

fn clamp_coord(value: i64) -> i32 {
    i32::try_from(value.max(0)).unwrap_or(i32::MAX)
}

/// Creation parameters handed to the host. Opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WindowDescriptor {
    pub url: String,
    pub title: Option<String>,
    pub width: u32,
    pub height: u32,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub center: bool,
    pub resizable: bool,
    pub decorations: bool,
    pub transparent: bool,
    pub always_on_top: bool,
    pub skip_taskbar: bool,
    pub visible: bool,
    pub focus: bool,
    pub shadow: bool,
    pub fullscreen: bool,
}

impl Default for WindowDescriptor {
    fn default() -> Self {
        Self {
            url: "/".to_owned(),
            title: None,
            width: 800,
            height: 600,
            x: None,
            y: None,
            center: false,
            resizable: true,
            decorations: true,
            transparent: false,
            always_on_top: false,
            skip_taskbar: false,
            visible: true,
            focus: true,
            shadow: true,
            fullscreen: false,
        }
    }
}

impl WindowDescriptor {
    pub fn call(
        title: impl Into<String>,
        url: impl Into<String>,
        visible: bool,
        fullscreen: bool,
    ) -> Self {
        Self {
            url: url.into(),
            title: Some(title.into()),
            width: CALL_W_PX,
            height: CALL_H_PX,
            center: true,
            decorations: false,
            visible,
            shadow: false,
            fullscreen,
            ..Self::default()
        }
    }

    pub fn call_accept(platform: Platform, screen: ScreenArea) -> Self {
        let (x, y) = popup_position(platform, screen, CALL_ACCEPT_W_PX, CALL_ACCEPT_H_PX);
        Self {
            url: "/accept".to_owned(),
            width: CALL_ACCEPT_W_PX,
            height: CALL_ACCEPT_H_PX,
            x: Some(x),
            y: Some(y),
            resizable: false,
            decorations: false,
            transparent: true,
            shadow: false,
            ..Self::default()
        }
    }

    /// `None` when there is nothing to show.
    pub fn notify(unread_sessions: usize) -> Option<Self> {
        if unread_sessions == 0 {
            return None;
        }
        let rows = unread_sessions.min(NOTIFY_MAX_ROWS) as u32;
        Some(Self {
            url: "/notify".to_owned(),
            width: NOTIFY_W_PX,
            height: NOTIFY_BASE_H_PX + rows * NOTIFY_ROW_H_PX,
            resizable: false,
            decorations: false,
            always_on_top: true,
            skip_taskbar: true,
            visible: false,
            focus: false,
            shadow: false,
            ..Self::default()
        })
    }

    pub fn preview_media() -> Self {
        Self::preview("/previewMedia", "Media preview")
    }

    pub fn preview_file() -> Self {
        Self::preview("/previewFile", "File preview")
    }

    fn preview(url: &str, title: &str) -> Self {
        Self {
            url: url.to_owned(),
            title: Some(title.to_owned()),
            width: PREVIEW_W_PX,
            height: PREVIEW_H_PX,
            center: true,
            resizable: false,
            ..Self::default()
        }
    }
}

/// Default descriptor for a well-known label, for flows that only know the label.
pub fn descriptor_for(label: &str) -> Option<WindowDescriptor> {
    match label {
        labels::CALL => Some(WindowDescriptor::call("Call", "/call", true, false)),
        labels::NOTIFY => WindowDescriptor::notify(1),
        labels::PREVIEW_MEDIA => Some(WindowDescriptor::preview_media()),
        labels::PREVIEW_FILE => Some(WindowDescriptor::preview_file()),
        _ => None,
    }
}
