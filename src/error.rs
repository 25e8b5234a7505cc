use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("image and mask dimensions don't match, or image channels != 3")]
    InvalidShape,
    #[error("patch_size must be > 0 and smaller than both image dimensions")]
    InvalidPatchSize,
    #[error("every pixel of the input is masked; there is no source to sample from")]
    AllMasked,
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
    #[error("NDArray had an error during initialization of shape: {0}")]
    NDArray(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, Error>;
