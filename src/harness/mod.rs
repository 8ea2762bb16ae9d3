pub mod frame_extractor;
pub mod stream_reassembler;
