pub mod atomic_map;
pub mod buf_ext;
pub mod random;
