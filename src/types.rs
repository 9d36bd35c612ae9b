pub mod metric;
pub mod observation;
pub mod window;
