//! Frame I/O over async byte streams.
//!
//! Reading and writing are split so that each half of a connection can be
//! driven by a different task.

mod framed;

pub use framed::{FrameWriter, read_frame};
