use crate::expr::CompiledExpression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, Sub};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// TimeMs
// ---------------------------------------------------------------------------

/// A millisecond-resolution timestamp or duration. Milliseconds are the
/// canonical unit throughout the compiler; seconds only appear at the
/// boundary with the external encoder's argument strings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeMs(pub i64);

impl TimeMs {
    pub const ZERO: Self = Self(0);

    pub fn as_seconds(&self) -> f64 {
        self.0 as f64 / 1_000.0
    }
}

impl Add for TimeMs {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for TimeMs {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl fmt::Display for TimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ---------------------------------------------------------------------------
// AssetKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AssetKind {
    Video,
    Image,
    Audio,
}

// ---------------------------------------------------------------------------
// Asset
// ---------------------------------------------------------------------------

/// A probed, immutable media reference. Identified by a unique name within
/// the project (§3 invariant 1), not by a synthetic id — the name is what
/// fragments reference in the markup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    pub name: String,
    pub path: PathBuf,
    pub kind: AssetKind,
    pub duration_ms: TimeMs,
    pub width: u32,
    pub height: u32,
    pub rotation: u16,
    pub has_video: bool,
    pub has_audio: bool,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Output {
    pub name: String,
    pub path: PathBuf,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub ffmpeg_preset: Option<String>,
}

// ---------------------------------------------------------------------------
// Timing — literal / percent / expression
// ---------------------------------------------------------------------------

/// How a fragment's duration was declared in markup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DurationSpec {
    Literal(i64),
    /// `100%` — the source asset's duration minus trim-start.
    FullSource,
    Expr(CompiledExpression),
    /// Declared via `-offset-end` instead of `-duration`: duration is
    /// computed as `end - start` once both resolve.
    UntilEnd(EndBound),
}

/// The `-offset-end` property's value — an absolute end point on the
/// timeline, resolved the same way as `StartSpec`'s literal/expr cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EndBound {
    Literal(i64),
    Expr(CompiledExpression),
}

/// How a fragment's start was declared in markup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StartSpec {
    /// No explicit start: previous fragment's end + this fragment's overlap-left.
    Auto,
    Literal(i64),
    Expr(CompiledExpression),
}

// ---------------------------------------------------------------------------
// Object-fit / contain sub-modes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ContainMode {
    Letterbox,
    Ambient {
        blur: f64,
        brightness: f64,
        saturation: f64,
    },
    Pillarbox {
        color: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ObjectFit {
    Cover,
    Contain(ContainMode),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChromaKey {
    pub color: String,
    pub similarity: f64,
    pub blend: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub name: String,
    pub duration_ms: i64,
}

// ---------------------------------------------------------------------------
// Fragment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FragmentTarget {
    Asset(String),
    Container(String),
    App(String),
}

/// A scheduled use of exactly one Asset or one Container/App on a Sequence's
/// timeline, as parsed from markup — before resolution (§9: `FragmentSpec` +
/// `FragmentResolved` replace the teacher's multi-pass-mutated record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentSpec {
    pub id: String,
    pub target: FragmentTarget,
    pub enabled: bool,
    pub trim_start_ms: i64,
    pub duration: DurationSpec,
    pub object_fit: ObjectFit,
    pub start: StartSpec,
    pub overlap_left_ms: i64,
    pub transition_in: Option<Transition>,
    pub transition_out: Option<Transition>,
    pub z_index: i32,
    /// `-overlay-end-z-index`, when given alongside `-overlay-start-z-index`.
    /// Kept constant across a fragment's lifetime via `z_index`; the end
    /// value is carried for future interpolation support but not yet
    /// consumed by the timeline compiler.
    pub end_z_index: Option<i32>,
    pub chromakey: Option<ChromaKey>,
    pub blur_sigma: Option<f64>,
}

/// A fragment's canonical timing once pass resolution (§4.2/§4.7) has
/// converged. Never mutated in place — the Timeline Compiler inserts one of
/// these into the `ExpressionContext` per fragment id as it resolves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FragmentResolved {
    pub start_ms: i64,
    pub duration_ms: i64,
    pub end_ms: i64,
}

// ---------------------------------------------------------------------------
// Sequence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Option<String>,
    pub fragments: Vec<FragmentSpec>,
}

// ---------------------------------------------------------------------------
// Container / App
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub inner_html: String,
    pub css_text: String,
    /// Filled in by the Overlay Rasterizer once the PNG has been produced
    /// for a given output's dimensions.
    pub png_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub dir: PathBuf,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub title: Option<String>,
    pub date: Option<String>,
    pub tags: Vec<String>,
    pub png_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub assets: HashMap<String, Asset>,
    pub outputs: HashMap<String, Output>,
    pub sequences: Vec<Sequence>,
    pub containers: HashMap<String, Container>,
    pub apps: HashMap<String, App>,
    pub css_text: String,
    pub ffmpeg_presets: HashMap<String, String>,
    pub upload_configs: HashMap<String, serde_json::Value>,
}

impl Project {
    pub fn new() -> Self {
        Self {
            assets: HashMap::new(),
            outputs: HashMap::new(),
            sequences: Vec::new(),
            containers: HashMap::new(),
            apps: HashMap::new(),
            css_text: String::new(),
            ffmpeg_presets: HashMap::new(),
            upload_configs: HashMap::new(),
        }
    }
}

impl Default for Project {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
