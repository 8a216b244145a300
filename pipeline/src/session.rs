use score_capture_common::frame::Frame;
use std::path::PathBuf;

use crate::cutpoints::CutSet;
use crate::storage::{LocalStorage, StorageError};

/// An image handed to the downstream asset list.
#[derive(Debug, Clone)]
pub struct SavedImage {
    pub seq: u64,
    pub path: PathBuf,
    pub frame: Frame,
}

/// What a finished session produced.
#[derive(Debug, Clone)]
pub enum SessionOutput {
    /// Page-turn mode: every accepted page in sampling order.
    Pages(Vec<SavedImage>),
    /// Scroll mode: the assembled panorama, where it was cut, and the slices.
    Slices {
        panorama: Option<Frame>,
        cuts: CutSet,
        slices: Vec<SavedImage>,
    },
}

impl SessionOutput {
    pub fn images(&self) -> &[SavedImage] {
        match self {
            SessionOutput::Pages(pages) => pages,
            SessionOutput::Slices { slices, .. } => slices,
        }
    }

    pub fn len(&self) -> usize {
        self.images().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images().is_empty()
    }
}

/// Per start/stop cycle context: identity, output location and numbering.
///
/// Sequence numbers start at 1 and only advance when an image was actually
/// written, so file names stay gap-free and strictly increasing.
#[derive(Debug)]
pub struct CaptureSession {
    id: u64,
    storage: LocalStorage,
    next_seq: u64,
}

impl CaptureSession {
    pub fn new(id: u64, storage: LocalStorage) -> Self {
        Self {
            id,
            storage,
            next_seq: 1,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of images persisted so far.
    pub fn saved_count(&self) -> u64 {
        self.next_seq - 1
    }

    /// Store `frame` under the next sequence number.
    pub fn persist(&mut self, frame: Frame) -> Result<SavedImage, StorageError> {
        let seq = self.next_seq;
        let path = self.storage.put_image(seq, &frame)?;
        self.next_seq += 1;
        Ok(SavedImage { seq, path, frame })
    }
}
