//! # Audio Processing Module
//!
//! Everything the gateway does to audio bytes lives here. The only CPU-bound work in
//! the data path is G.711 μ-law companding; the rest is validation and chunking.
//!
//! ## Key Components:
//! - **Codec functions**: `chunk`, `mulaw_to_pcm`, `pcm_to_mulaw`, `process_packet`
//! - **Audio Processor**: Applies the configured client encoding on the way in
//!   (client → upstream) and on the way out (upstream → client)
//!
//! ## Audio Format at the Upstream Edge:
//! - **Encoding**: 16-bit signed linear PCM
//! - **Byte order**: Little-endian

pub mod codec;      // G.711 μ-law, chunking, packet validation
