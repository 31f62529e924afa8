//! Viewer input events forwarded to the surface

use serde::{Deserialize, Serialize};

/// Mouse button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Middle,
    Right,
}

/// Modifier key bitmask (alt=1, ctrl=2, meta=4, shift=8)
pub type Modifiers = u8;

/// An input event from the viewer
///
/// Pointer coordinates are in encoded-video pixels; the session maps them
/// to CSS pixels with [`InputEvent::to_viewport_space`] before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    MouseMove {
        x: f64,
        y: f64,
        #[serde(default)]
        modifiers: Modifiers,
    },
    MouseDown {
        x: f64,
        y: f64,
        #[serde(default)]
        button: MouseButton,
        #[serde(default = "default_click_count")]
        click_count: u32,
        #[serde(default)]
        modifiers: Modifiers,
    },
    MouseUp {
        x: f64,
        y: f64,
        #[serde(default)]
        button: MouseButton,
        #[serde(default = "default_click_count")]
        click_count: u32,
        #[serde(default)]
        modifiers: Modifiers,
    },
    Wheel {
        x: f64,
        y: f64,
        delta_x: f64,
        delta_y: f64,
    },
    KeyDown {
        key: String,
        #[serde(default)]
        code: String,
        #[serde(default)]
        modifiers: Modifiers,
    },
    KeyUp {
        key: String,
        #[serde(default)]
        code: String,
        #[serde(default)]
        modifiers: Modifiers,
    },
    InsertText {
        text: String,
    },
    Navigate {
        url: String,
    },
    GoBack,
    GoForward,
    Reload,
}

fn default_click_count() -> u32 {
    1
}

impl InputEvent {
    /// Event type name
    pub fn name(&self) -> &'static str {
        match self {
            InputEvent::MouseMove { .. } => "mouse_move",
            InputEvent::MouseDown { .. } => "mouse_down",
            InputEvent::MouseUp { .. } => "mouse_up",
            InputEvent::Wheel { .. } => "wheel",
            InputEvent::KeyDown { .. } => "key_down",
            InputEvent::KeyUp { .. } => "key_up",
            InputEvent::InsertText { .. } => "insert_text",
            InputEvent::Navigate { .. } => "navigate",
            InputEvent::GoBack => "go_back",
            InputEvent::GoForward => "go_forward",
            InputEvent::Reload => "reload",
        }
    }

    /// Pointer position, if this event has one
    pub fn position(&self) -> Option<(f64, f64)> {
        match self {
            InputEvent::MouseMove { x, y, .. }
            | InputEvent::MouseDown { x, y, .. }
            | InputEvent::MouseUp { x, y, .. }
            | InputEvent::Wheel { x, y, .. } => Some((*x, *y)),
            _ => None,
        }
    }

    /// Whether this event replaces the current document
    pub fn is_navigation(&self) -> bool {
        matches!(
            self,
            InputEvent::Navigate { .. }
                | InputEvent::GoBack
                | InputEvent::GoForward
                | InputEvent::Reload
        )
    }

    /// Map pointer coordinates from encoded pixels to CSS pixels
    ///
    /// Wheel deltas are already in CSS pixels and are left untouched.
    pub fn to_viewport_space(mut self, scale: f64) -> Self {
        if !(scale.is_finite() && scale > 0.0) {
            return self;
        }
        match &mut self {
            InputEvent::MouseMove { x, y, .. }
            | InputEvent::MouseDown { x, y, .. }
            | InputEvent::MouseUp { x, y, .. }
            | InputEvent::Wheel { x, y, .. } => {
                *x /= scale;
                *y /= scale;
            }
            _ => {}
        }
        self
    }
}
