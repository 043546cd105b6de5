pub mod packet_queue;
pub mod surface;
pub mod timestamp;
