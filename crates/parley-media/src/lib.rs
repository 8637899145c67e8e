pub mod storage;

pub use storage::{LocalStorage, MediaConfig, MediaStore, Storage, StorageError, StoredMedia};
