mod http;
mod traits;

pub use {
    http::{HttpError, HttpUploader, HttpUploaderOpts},
    traits::BatchUploader,
};
