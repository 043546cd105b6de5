pub mod encoder;
pub mod muxer;
pub mod sink;
pub mod source;
pub mod streamer;
