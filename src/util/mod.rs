pub mod byte_stream;
pub mod counter;
pub mod mutex_map;
pub mod mutex_slice;
pub mod random;
pub mod safe_converter;
