//! Shared image buffer
//!
//! A named region of exactly `width * height * 4` bytes holding one guide
//! frame as row-major little-endian `u32` pixels. It is backed by a file in
//! the platform shared-memory directory (`/dev/shm` on Linux) and mapped
//! with `memmap2`, so the solving worker can map the same region by name.
//!
//! The coordinator creates the buffer; the worker attaches only after the
//! `image_ready` message and validates the geometry it was told against the
//! size of the region. A created region is never resized: a geometry change
//! unlinks it and creates a new one under the same name.

use crate::error::BufferError;
use mast_device::{ImageFrame, ImageGeometry, BYTES_PER_PIXEL};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Default logical name of the guide image buffer
pub const DEFAULT_BUFFER_NAME: &str = "PlateSolving_Image";

/// Directory where shared buffers live when none is configured
pub fn default_buffer_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if cfg!(target_os = "linux") && shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Names must not escape the buffer directory
fn validate_name(name: &str) -> Result<(), BufferError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(BufferError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn byte_len(geometry: ImageGeometry) -> Result<usize, BufferError> {
    geometry
        .byte_len()
        .map_err(|e| BufferError::InvalidGeometry(e.to_string()))
}

pub struct SharedImageBuffer {
    name: String,
    path: PathBuf,
    geometry: ImageGeometry,
    mmap: MmapMut,
}

impl SharedImageBuffer {
    /// Create (or re-create) the named buffer sized for `geometry`.
    /// An existing region with the same name is unlinked first, so anyone
    /// still mapping it keeps the old contents and size.
    pub fn create(dir: &Path, name: &str, geometry: ImageGeometry) -> Result<Self, BufferError> {
        validate_name(name)?;
        let len = byte_len(geometry)?;
        let path = dir.join(name);
        let io_err = |source| BufferError::Io {
            name: name.to_string(),
            path: path.clone(),
            source,
        };

        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("buffer: replaced existing '{}'", name),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(io_err)?;
        file.set_len(len as u64).map_err(io_err)?;

        // SAFETY: the file is new and was just sized to `len`. Nothing
        // resizes it afterwards; a re-create unlinks it and makes another.
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file) }.map_err(io_err)?;

        tracing::info!(
            "buffer: created '{}' ({}, {} bytes) at {:?}",
            name,
            geometry,
            len,
            path
        );
        Ok(Self {
            name: name.to_string(),
            path,
            geometry,
            mmap,
        })
    }

    /// Attach to an existing buffer, failing fast unless its size matches `geometry`
    pub fn attach(dir: &Path, name: &str, geometry: ImageGeometry) -> Result<Self, BufferError> {
        validate_name(name)?;
        let expected_len = byte_len(geometry)?;
        let path = dir.join(name);
        if !path.exists() {
            return Err(BufferError::NotFound {
                name: name.to_string(),
                path,
            });
        }
        let io_err = |source| BufferError::Io {
            name: name.to_string(),
            path: path.clone(),
            source,
        };

        let file = OpenOptions::new().read(true).write(true).open(&path).map_err(io_err)?;
        let actual_len = file.metadata().map_err(io_err)?.len();
        if actual_len != expected_len as u64 {
            return Err(BufferError::GeometryMismatch {
                name: name.to_string(),
                expected: geometry,
                expected_len,
                actual_len,
            });
        }

        // SAFETY: size validated above; a created file is never resized.
        let mmap = unsafe { MmapOptions::new().len(expected_len).map_mut(&file) }.map_err(io_err)?;
        tracing::debug!("buffer: attached '{}' ({})", name, geometry);
        Ok(Self {
            name: name.to_string(),
            path,
            geometry,
            mmap,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geometry(&self) -> ImageGeometry {
        self.geometry
    }

    /// Size of the region in bytes, always `width * height * 4`
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Copy a frame into the buffer
    pub fn write_frame(&mut self, frame: &ImageFrame) -> Result<(), BufferError> {
        if frame.geometry != self.geometry {
            return Err(BufferError::FrameMismatch {
                name: self.name.clone(),
                frame: frame.geometry,
                buffer: self.geometry,
            });
        }
        self.write_pixels(&frame.pixels)
    }

    pub fn write_pixels(&mut self, pixels: &[u32]) -> Result<(), BufferError> {
        if pixels.len() * BYTES_PER_PIXEL != self.mmap.len() {
            return Err(BufferError::InvalidGeometry(format!(
                "{} pixels do not fill buffer '{}' of {}",
                pixels.len(),
                self.name,
                self.geometry
            )));
        }
        for (chunk, pixel) in self.mmap.chunks_exact_mut(BYTES_PER_PIXEL).zip(pixels) {
            chunk.copy_from_slice(&pixel.to_le_bytes());
        }
        self.mmap
            .flush_async()
            .map_err(|source| BufferError::Io {
                name: self.name.clone(),
                path: self.path.clone(),
                source,
            })
    }

    /// Row-major copy of the pixels currently in the buffer
    pub fn read_pixels(&self) -> Vec<u32> {
        self.mmap
            .chunks_exact(BYTES_PER_PIXEL)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    /// Remove the backing region; mappings already held elsewhere stay valid
    pub fn unlink(self) -> Result<(), BufferError> {
        let Self { name, path, mmap, .. } = self;
        drop(mmap);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("buffer: unlinked '{}'", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BufferError::Io { name, path, source }),
        }
    }
}

impl std::fmt::Debug for SharedImageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedImageBuffer")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("geometry", &self.geometry)
            .field("len", &self.mmap.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(w: u32, h: u32) -> ImageGeometry {
        ImageGeometry::new(w, h).unwrap()
    }

    #[test]
    fn test_size_is_width_height_four() {
        let dir = tempfile::tempdir().unwrap();
        for (w, h) in [(1, 1), (100, 100), (64, 48)] {
            let buffer = SharedImageBuffer::create(dir.path(), "img", geometry(w, h)).unwrap();
            assert_eq!(buffer.len(), (w * h * 4) as usize);
            assert_eq!(
                std::fs::metadata(buffer.path()).unwrap().len(),
                (w * h * 4) as u64
            );
        }
    }

    #[test]
    fn test_writer_and_reader_share_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let g = geometry(4, 3);
        let mut writer = SharedImageBuffer::create(dir.path(), "img", g).unwrap();
        let pixels: Vec<u32> = (0..12).map(|i| i * 1000 + 7).collect();
        writer.write_pixels(&pixels).unwrap();

        let reader = SharedImageBuffer::attach(dir.path(), "img", g).unwrap();
        assert_eq!(reader.read_pixels(), pixels);
    }

    #[test]
    fn test_attach_with_wrong_geometry_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        SharedImageBuffer::create(dir.path(), "img", geometry(100, 100)).unwrap();

        let err = SharedImageBuffer::attach(dir.path(), "img", geometry(100, 50)).unwrap_err();
        match err {
            BufferError::GeometryMismatch {
                expected_len,
                actual_len,
                ..
            } => {
                assert_eq!(expected_len, 20_000);
                assert_eq!(actual_len, 40_000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_attach_missing_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let err = SharedImageBuffer::attach(dir.path(), "missing", geometry(2, 2)).unwrap_err();
        assert!(matches!(err, BufferError::NotFound { .. }));
    }

    #[test]
    fn test_frame_geometry_must_match() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = SharedImageBuffer::create(dir.path(), "img", geometry(2, 2)).unwrap();
        let frame = ImageFrame::new(geometry(3, 1), vec![1, 2, 3], 1.0).unwrap();
        assert!(matches!(
            buffer.write_frame(&frame),
            Err(BufferError::FrameMismatch { .. })
        ));
    }

    #[test]
    fn test_recreate_leaves_old_mappings_intact() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = SharedImageBuffer::create(dir.path(), "img", geometry(10, 10)).unwrap();
        first.write_pixels(&[3; 100]).unwrap();
        let reader = SharedImageBuffer::attach(dir.path(), "img", geometry(10, 10)).unwrap();

        let mut second = SharedImageBuffer::create(dir.path(), "img", geometry(5, 5)).unwrap();
        second.write_pixels(&[8; 25]).unwrap();
        assert_eq!(second.len(), 100);

        // The worker's mapping still sees the old region, whole
        assert_eq!(reader.len(), 400);
        assert_eq!(reader.read_pixels(), vec![3; 100]);

        let fresh = SharedImageBuffer::attach(dir.path(), "img", geometry(5, 5)).unwrap();
        assert_eq!(fresh.read_pixels(), vec![8; 25]);
        assert!(SharedImageBuffer::attach(dir.path(), "img", geometry(10, 10)).is_err());
    }

    #[test]
    fn test_unlink_removes_region() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = SharedImageBuffer::create(dir.path(), "img", geometry(2, 2)).unwrap();
        let path = buffer.path().to_path_buf();
        buffer.unlink().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SharedImageBuffer::create(dir.path(), "../escape", geometry(2, 2)).is_err());
        assert!(SharedImageBuffer::create(dir.path(), "", geometry(2, 2)).is_err());
    }
}
