//! Data sources feeding the transcoder.

pub mod ring_buffer;
pub mod selector;

pub use ring_buffer::{spawn_producer, RingBuffer};
pub use selector::{estimate_byte_offset, seek_boost_range, select_data_source, DataSource};
