pub mod crypto;
pub mod lifecycle;
pub mod ocr;
pub mod pipeline;
pub mod state;
pub mod storage;
pub mod watcher;
