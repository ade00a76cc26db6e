//! # Frame Rendering
//!
//! The wake cycle hands validated images and short text overlays to a
//! [`Renderer`]. Pixel work (decoding, dithering, panel refresh) belongs to
//! the implementation; the cycle only needs success or failure back.
//!
//! Two host renderers are included:
//! - [`FileRenderer`] writes the image as `frame.jpg` next to a
//!   `frame.json` sidecar describing dithering, overlays and status text.
//!   This is what an external panel driver picks up.
//! - [`ConsoleRenderer`] prints a boxed summary of the frame for development
//!   (`--stdout`).

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::fetch::MESSAGE_SLOTS;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("render I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("could not encode frame metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("message slot {0} does not exist")]
    InvalidSlot(usize),

    #[error("empty image")]
    EmptyImage,
}

/// Render collaborator for one frame.
///
/// `draw_jpeg` starts a new frame; messages and status drawn afterwards are
/// layered on top of it.
pub trait Renderer {
    fn draw_jpeg(&mut self, jpeg: &[u8], dither: bool) -> Result<(), RenderError>;

    /// Paint a short overlay in `slot` (0 = top, 1 = middle, 2 = bottom).
    fn draw_message(&mut self, slot: usize, text: &str) -> Result<(), RenderError>;

    /// Paint a full-screen status line, e.g. a splash or failure notice.
    fn draw_status(&mut self, text: &str) -> Result<(), RenderError>;
}

impl<R: Renderer + ?Sized> Renderer for &mut R {
    fn draw_jpeg(&mut self, jpeg: &[u8], dither: bool) -> Result<(), RenderError> {
        (**self).draw_jpeg(jpeg, dither)
    }

    fn draw_message(&mut self, slot: usize, text: &str) -> Result<(), RenderError> {
        (**self).draw_message(slot, text)
    }

    fn draw_status(&mut self, text: &str) -> Result<(), RenderError> {
        (**self).draw_status(text)
    }
}

fn check_slot(slot: usize) -> Result<(), RenderError> {
    if slot < MESSAGE_SLOTS {
        Ok(())
    } else {
        Err(RenderError::InvalidSlot(slot))
    }
}

/// Metadata written next to the image.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSidecar {
    pub updated_at: Option<DateTime<Local>>,
    pub image: Option<String>,
    pub image_bytes: usize,
    pub dither: bool,
    pub messages: [Option<String>; MESSAGE_SLOTS],
    pub status: Option<String>,
}

/// Writes frames into a directory for an external panel driver.
#[derive(Debug)]
pub struct FileRenderer {
    dir: PathBuf,
    frame: FrameSidecar,
}

impl FileRenderer {
    pub const IMAGE_FILE: &'static str = "frame.jpg";
    pub const SIDECAR_FILE: &'static str = "frame.json";

    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            frame: FrameSidecar::default(),
        }
    }

    pub fn image_path(&self) -> PathBuf {
        self.dir.join(Self::IMAGE_FILE)
    }

    pub fn sidecar_path(&self) -> PathBuf {
        self.dir.join(Self::SIDECAR_FILE)
    }

    pub fn frame(&self) -> &FrameSidecar {
        &self.frame
    }

    fn write_sidecar(&mut self) -> Result<(), RenderError> {
        self.frame.updated_at = Some(Local::now());
        fs::create_dir_all(&self.dir)?;
        let data = serde_json::to_vec_pretty(&self.frame)?;
        fs::write(self.sidecar_path(), data)?;
        Ok(())
    }
}

impl Renderer for FileRenderer {
    fn draw_jpeg(&mut self, jpeg: &[u8], dither: bool) -> Result<(), RenderError> {
        if jpeg.is_empty() {
            return Err(RenderError::EmptyImage);
        }
        fs::create_dir_all(&self.dir)?;
        // write then rename so a reader never sees half an image
        let tmp = self.dir.join(".frame.jpg.tmp");
        fs::write(&tmp, jpeg)?;
        fs::rename(&tmp, self.image_path())?;

        self.frame = FrameSidecar {
            image: Some(Self::IMAGE_FILE.to_string()),
            image_bytes: jpeg.len(),
            dither,
            ..FrameSidecar::default()
        };
        self.write_sidecar()
    }

    fn draw_message(&mut self, slot: usize, text: &str) -> Result<(), RenderError> {
        check_slot(slot)?;
        self.frame.messages[slot] = Some(text.to_string());
        self.write_sidecar()
    }

    fn draw_status(&mut self, text: &str) -> Result<(), RenderError> {
        self.frame.status = Some(text.to_string());
        self.write_sidecar()
    }
}

/// Prints frames to a terminal.
pub struct ConsoleRenderer<W = io::Stdout> {
    out: W,
    width: usize,
}

impl ConsoleRenderer {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsoleRenderer<W> {
    const BOX_WIDTH: usize = 60;

    pub fn new(out: W) -> Self {
        Self {
            out,
            width: Self::BOX_WIDTH,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn boxed(&mut self, tag: &str, text: &str) -> Result<(), RenderError> {
        let inner = self.width - 4;
        let body: String = text.chars().take(inner).collect();
        writeln!(self.out, "┌{}┐", "─".repeat(self.width - 2))?;
        writeln!(self.out, "│ {:<inner$} │", format!("[{tag}]"))?;
        writeln!(self.out, "│ {:<inner$} │", body)?;
        writeln!(self.out, "└{}┘", "─".repeat(self.width - 2))?;
        Ok(())
    }
}

impl<W: Write> Renderer for ConsoleRenderer<W> {
    fn draw_jpeg(&mut self, jpeg: &[u8], dither: bool) -> Result<(), RenderError> {
        if jpeg.is_empty() {
            return Err(RenderError::EmptyImage);
        }
        let mode = if dither { "dithered" } else { "no dithering" };
        self.boxed("image", &format!("{} bytes, {mode}", jpeg.len()))
    }

    fn draw_message(&mut self, slot: usize, text: &str) -> Result<(), RenderError> {
        check_slot(slot)?;
        let position = ["top", "middle", "bottom"][slot];
        self.boxed(position, text)
    }

    fn draw_status(&mut self, text: &str) -> Result<(), RenderError> {
        self.boxed("status", text)
    }
}
