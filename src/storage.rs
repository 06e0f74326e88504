//! On-disk screenshot store
//!
//! Files live under a configured root at
//! `{pageId}/{YYYY}/{MM}/{epochMs}_{tag}.png` with a `_thumb` sibling;
//! the database only ever stores root-relative paths. Captures append,
//! retention removes, nothing overwrites.

use chrono::{DateTime, Datelike, Utc};
use image::GenericImageView;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::models::ViewportTag;
use crate::WorkerError;

pub const THUMBNAIL_WIDTH: u32 = 400;

/// What landed on disk for one captured viewport.
#[derive(Debug, Clone)]
pub struct StoredScreenshot {
    pub file_path: String,
    pub thumbnail_path: String,
    pub file_size: i64,
    pub image_width: i64,
    pub image_height: i64,
}

#[derive(Debug, Clone)]
pub struct ScreenshotStore {
    root: PathBuf,
}

impl ScreenshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn init(&self) -> Result<(), WorkerError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_path(page_id: i64, tag: ViewportTag, at: DateTime<Utc>) -> String {
        format!(
            "{}/{:04}/{:02}/{}_{}.png",
            page_id,
            at.year(),
            at.month(),
            at.timestamp_millis(),
            tag.as_str()
        )
    }

    pub fn thumbnail_path_for(relative: &str) -> String {
        match relative.strip_suffix(".png") {
            Some(stem) => format!("{stem}_thumb.png"),
            None => format!("{relative}_thumb"),
        }
    }

    pub fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Write the full PNG plus its thumbnail, returning the relative
    /// paths and measured dimensions for the screenshot row.
    pub async fn write_screenshot(
        &self,
        page_id: i64,
        tag: ViewportTag,
        at: DateTime<Utc>,
        png: &[u8],
    ) -> Result<StoredScreenshot, WorkerError> {
        let relative = Self::relative_path(page_id, tag, at);
        let thumb_relative = Self::thumbnail_path_for(&relative);

        let full_path = self.absolute(&relative);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let decoded = image::load_from_memory(png)?;
        let (width, height) = decoded.dimensions();

        let thumb_bytes = encode_thumbnail(&decoded)?;

        tokio::fs::write(&full_path, png).await?;
        tokio::fs::write(self.absolute(&thumb_relative), &thumb_bytes).await?;

        Ok(StoredScreenshot {
            file_path: relative,
            thumbnail_path: thumb_relative,
            file_size: png.len() as i64,
            image_width: width as i64,
            image_height: height as i64,
        })
    }

    pub async fn read(&self, relative: &str) -> Result<Vec<u8>, WorkerError> {
        let path = self.absolute(relative);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(WorkerError::NotFound(
                format!("screenshot file missing: {relative}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a stored file. A file already gone is not an error: the
    /// row is the source of truth and disk may have been cleaned
    /// externally.
    pub async fn delete(&self, relative: &str) -> Result<(), WorkerError> {
        match tokio::fs::remove_file(self.absolute(relative)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("file already missing during delete: {relative}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Resize to a 400-wide thumbnail preserving aspect; images already
/// narrower are never enlarged.
fn encode_thumbnail(image: &image::DynamicImage) -> Result<Vec<u8>, WorkerError> {
    let (width, height) = image.dimensions();

    let thumb = if width > THUMBNAIL_WIDTH {
        let scaled_height =
            ((height as u64 * THUMBNAIL_WIDTH as u64) / width as u64).max(1) as u32;
        image.resize_exact(
            THUMBNAIL_WIDTH,
            scaled_height,
            image::imageops::FilterType::Triangle,
        )
    } else {
        image.clone()
    };

    let mut buf = Vec::new();
    thumb.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}
