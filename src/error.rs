use thiserror::Error;

use crate::kms::{Fourcc, KmsError};

/// Scan-out buffer allocation and import failures.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error(transparent)]
    Kms(#[from] KmsError),

    #[error("scan-out pool exhausted ({0} buffers)")]
    PoolExhausted(usize),

    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(Fourcc),

    #[error("frame has no hardware surface descriptor")]
    NotPrime,

    #[error("frame has no CPU planes")]
    NotPlanar,

    #[error("prime descriptor has no objects")]
    EmptyDescriptor,

    #[error("{width}x{height} does not fit the mapped buffer")]
    Geometry { width: u32, height: u32 },
}

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("no hardware deinterlacer available")]
    NoHardwareDeinterlacer,

    #[error("no filter for {0}")]
    Unsupported(String),

    #[error("filter graph is flushed")]
    Flushed,

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Errors surfaced by the render context.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Kms(#[from] KmsError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}
