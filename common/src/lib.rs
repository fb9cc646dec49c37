pub mod file_format;
pub mod log_setup;
pub mod serde;
pub mod test_utils;

pub use file_format::FileFormat;

pub fn is_debug() -> bool {
    cfg!(debug_assertions)
}
