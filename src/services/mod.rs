pub mod archive_sync;
pub mod bundler;
pub mod differ;
pub mod lock;
pub mod metadata;
pub mod progress;
pub mod remote_index;
pub mod scanner;
pub mod transport;
pub mod uploader;
