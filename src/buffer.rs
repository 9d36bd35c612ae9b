pub mod merge_buffer;
pub mod threshold;
