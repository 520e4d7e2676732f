//! ALFA Vault Store - Thumbnails
//!
//! Thumbnail generation is an opaque collaborator: the store hands it raw
//! bytes and gets back an optional small image. The decrypted-thumbnail
//! cache is another collaborator the store writes to after every commit.

use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Read};

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use log::debug;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::allocator::SourceFile;
use crate::error::{VaultError, VaultResult};

/// Produces a thumbnail for raw content, or `None` when it cannot
pub trait ThumbnailGenerator: Send + Sync {
    fn generate(&self, data: &[u8], mime_type: &str) -> Option<Vec<u8>>;
}

/// Receives decrypted thumbnails keyed by file id
pub trait ThumbnailCache: Send + Sync {
    fn put(&self, file_id: Uuid, thumbnail: Vec<u8>);
    fn get(&self, file_id: &Uuid) -> Option<Vec<u8>>;
    fn remove(&self, file_id: &Uuid);
    fn clear(&self);
}

/// Thumbnail Engine: square crop, resize, JPEG
pub struct ThumbnailEngine {
    /// Thumbnail size (square)
    size: u32,
}

impl ThumbnailEngine {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    /// Render a square JPEG thumbnail from encoded image bytes
    pub fn render(&self, image_data: &[u8]) -> VaultResult<Vec<u8>> {
        let img = image::load_from_memory(image_data)?;
        let thumb = self.resize_to_thumbnail(&img);

        // JPEG has no alpha channel
        let rgb = DynamicImage::ImageRgb8(thumb.to_rgb8());
        let mut output = Vec::new();
        rgb.write_to(&mut Cursor::new(&mut output), image::ImageFormat::Jpeg)
            .map_err(|e| VaultError::ThumbnailFailed(e.to_string()))?;

        Ok(output)
    }

    fn resize_to_thumbnail(&self, img: &DynamicImage) -> DynamicImage {
        let (width, height) = img.dimensions();

        let (crop_x, crop_y, crop_size) = if width > height {
            ((width - height) / 2, 0, height)
        } else {
            (0, (height - width) / 2, width)
        };

        img.crop_imm(crop_x, crop_y, crop_size, crop_size)
            .resize_exact(self.size, self.size, FilterType::Triangle)
    }
}

impl ThumbnailGenerator for ThumbnailEngine {
    fn generate(&self, data: &[u8], mime_type: &str) -> Option<Vec<u8>> {
        if !mime_type.starts_with("image/") {
            return None;
        }
        match self.render(data) {
            Ok(thumb) => Some(thumb),
            Err(e) => {
                debug!("No thumbnail for {} source: {}", mime_type, e);
                None
            }
        }
    }
}

/// Read a source and ask `generator` for its thumbnail. Sources larger than
/// `max_source` bytes or that are not images are skipped without reading.
pub fn thumbnail_for_source(
    generator: &dyn ThumbnailGenerator,
    source: &SourceFile,
    max_source: u64,
) -> Option<Vec<u8>> {
    if !source.mime_type.starts_with("image/") {
        return None;
    }

    let file = std::fs::File::open(&source.path).ok()?;
    if file.metadata().ok()?.len() > max_source {
        return None;
    }

    let mut data = Vec::new();
    file.take(max_source).read_to_end(&mut data).ok()?;
    generator.generate(&data, &source.mime_type)
}

/// Bounded in-memory thumbnail cache; oldest insertions are evicted first
pub struct MemoryThumbnailCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<Uuid, Vec<u8>>,
    order: VecDeque<Uuid>,
}

impl MemoryThumbnailCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryThumbnailCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ThumbnailCache for MemoryThumbnailCache {
    fn put(&self, file_id: Uuid, thumbnail: Vec<u8>) {
        let mut inner = self.inner.lock();
        if inner.entries.insert(file_id, thumbnail).is_none() {
            inner.order.push_back(file_id);
        }
        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn get(&self, file_id: &Uuid) -> Option<Vec<u8>> {
        self.inner.lock().entries.get(file_id).cloned()
    }

    fn remove(&self, file_id: &Uuid) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(file_id).is_some() {
            inner.order.retain(|id| id != file_id);
        }
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::new_rgb8(width, height);
        let mut buffer = Vec::new();
        img.write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)
            .unwrap();
        buffer
    }

    #[test]
    fn test_thumbnail_generation() {
        let engine = ThumbnailEngine::new(256);
        let thumb = engine.generate(&png(800, 600), "image/png").unwrap();

        let decoded = image::load_from_memory(&thumb).unwrap();
        assert_eq!(decoded.dimensions(), (256, 256));
    }

    #[test]
    fn test_non_images_get_no_thumbnail() {
        let engine = ThumbnailEngine::new(64);
        assert!(engine.generate(b"not an image at all", "image/jpeg").is_none());
        assert!(engine.generate(&png(10, 10), "video/mp4").is_none());
    }

    #[test]
    fn test_thumbnail_for_source_respects_size_cap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pic.png");
        let data = png(40, 40);
        std::fs::write(&path, &data).unwrap();
        let source = SourceFile::from_path(&path).unwrap();
        let engine = ThumbnailEngine::new(16);

        assert!(thumbnail_for_source(&engine, &source, data.len() as u64).is_some());
        assert!(thumbnail_for_source(&engine, &source, data.len() as u64 - 1).is_none());
    }

    #[test]
    fn test_memory_cache_evicts_oldest() {
        let cache = MemoryThumbnailCache::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        cache.put(a, vec![1]);
        cache.put(b, vec![2]);
        cache.put(c, vec![3]);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a).is_none());
        assert_eq!(cache.get(&c), Some(vec![3]));

        cache.remove(&b);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
