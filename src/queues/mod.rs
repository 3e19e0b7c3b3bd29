//! Work queues.

pub mod work;
