pub mod atomic_file;
pub mod image_helper;
