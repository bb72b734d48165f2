use crate::error::PipelineError;
use crate::pipeline::geometry::BBox;
use image::{DynamicImage, ImageFormat};
use std::io::{Cursor, Write};
use std::process::{Command, Stdio};
use std::thread;

/// Reads the text of one line region.
pub trait TextRecognizer: Send + Sync {
    fn recognize(
        &self,
        image_name: &str,
        image: &DynamicImage,
        bbox: &BBox,
    ) -> Result<String, PipelineError>;
}

/// Runs `recognizer` and turns any failure into an empty string.
pub fn recognize_or_empty(
    recognizer: &dyn TextRecognizer,
    image_name: &str,
    image: &DynamicImage,
    bbox: &BBox,
) -> String {
    match recognizer.recognize(image_name, image, bbox) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Recognition skipped a region of {}: {}", image_name, e);
            String::new()
        }
    }
}

/// Cuts `bbox` out of the image, clipped to its bounds. None if nothing is left.
pub fn crop_bbox(image: &DynamicImage, bbox: &BBox) -> Option<DynamicImage> {
    let (w, h) = (image.width() as f64, image.height() as f64);
    let x0 = bbox.x.floor().clamp(0.0, w);
    let y0 = bbox.y.floor().clamp(0.0, h);
    let x1 = (bbox.x + bbox.w).ceil().clamp(0.0, w);
    let y1 = (bbox.y + bbox.h).ceil().clamp(0.0, h);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(image.crop_imm(
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    ))
}

/// Recognizer used when no backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlankRecognizer;

impl TextRecognizer for BlankRecognizer {
    fn recognize(&self, _: &str, _: &DynamicImage, _: &BBox) -> Result<String, PipelineError> {
        Ok(String::new())
    }
}

/// External OCR process: region crop as PNG on stdin, text on stdout.
#[derive(Debug, Clone)]
pub struct CommandRecognizer {
    program: String,
    args: Vec<String>,
}

impl CommandRecognizer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Splits a command line with shell quoting rules. None for a blank line.
    pub fn from_command_line(line: &str) -> Result<Option<Self>, shell_words::ParseError> {
        let mut parts = shell_words::split(line)?.into_iter();
        Ok(parts.next().map(|program| Self::new(program, parts.collect())))
    }

    fn run(&self, image_name: &str, png: Vec<u8>) -> Result<String, PipelineError> {
        let fail = |message: String| PipelineError::recognition(image_name, message);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| fail(format!("could not start {}: {}", self.program, e)))?;

        let stdin = child.stdin.take();
        let writer = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                // The process may exit without reading its input.
                let _ = stdin.write_all(&png);
            }
        });

        let output = child
            .wait_with_output()
            .map_err(|e| fail(format!("{} did not finish: {}", self.program, e)))?;
        let _ = writer.join();

        if !output.status.success() {
            return Err(fail(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl TextRecognizer for CommandRecognizer {
    fn recognize(
        &self,
        image_name: &str,
        image: &DynamicImage,
        bbox: &BBox,
    ) -> Result<String, PipelineError> {
        let Some(region) = crop_bbox(image, bbox) else {
            return Ok(String::new());
        };
        let mut png = Cursor::new(Vec::new());
        region
            .write_to(&mut png, ImageFormat::Png)
            .map_err(|e| PipelineError::image(image_name, e))?;
        self.run(image_name, png.into_inner())
    }
}
