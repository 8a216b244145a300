pub mod cutpoints;
pub mod detector;
pub mod processor;
pub mod session;
pub mod similarity;
pub mod stitch;
pub mod storage;

pub use cutpoints::{CutEdits, CutPointFinder, CutSet};
pub use detector::{ChangeDetector, Confirmation, Trigger};
pub use processor::{for_mode, Decision, Discard, PageTurnProcessor, Processor, ScrollStitchProcessor};
pub use session::{CaptureSession, SavedImage, SessionOutput};
pub use stitch::{ScrollBuffer, ScrollStitcher, StitchOutcome};
pub use storage::LocalStorage;
