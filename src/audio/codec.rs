//! # Audio Codec
//!
//! Stateless conversions between the client's capture format and the 16-bit linear PCM
//! the speech API expects.
//!
//! ## μ-law (ITU-T G.711) layout:
//! Each 8-bit code is stored bit-inverted and holds
//! `sign (bit 7) | exponent (bits 6-4) | mantissa (bits 3-0)`.
//! Decoding rebuilds the magnitude as `(mantissa << (exponent + 3)) | 0x84`.
//!
//! Companding is lossy: `mulaw_to_pcm(pcm_to_mulaw(x))` is only close to `x`, with an
//! error that grows with the magnitude of the sample.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CodecError;

/// Chunk size used when a caller asks for zero-sized chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Bias OR-ed into every decoded magnitude.
const MULAW_BIAS: i32 = 0x84;

/// Largest exponent a μ-law code can carry.
const MULAW_MAX_EXPONENT: u8 = 7;

/// Sample encoding used on the client side of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// 16-bit little-endian linear PCM, forwarded as-is
    Pcm16,
    /// 8-bit G.711 μ-law (telephony)
    Mulaw,
}

/// Split `data` into consecutive slices of at most `size` bytes.
///
/// A `size` of zero falls back to [`DEFAULT_CHUNK_SIZE`]. Empty input yields no chunks.
pub fn chunk(data: &[u8], size: usize) -> Vec<&[u8]> {
    let size = if size == 0 { DEFAULT_CHUNK_SIZE } else { size };
    let chunks: Vec<&[u8]> = data.chunks(size).collect();

    debug!(
        total_size = data.len(),
        chunk_size = size,
        num_chunks = chunks.len(),
        "Chunked audio data"
    );

    chunks
}

/// Decode one μ-law code into a linear sample.
pub fn decode_sample(code: u8) -> i16 {
    let code = !code;
    let negative = code & 0x80 != 0;
    let exponent = i32::from((code >> 4) & 0x07);
    let mantissa = i32::from(code & 0x0F);

    let magnitude = (mantissa << (exponent + 3)) | MULAW_BIAS;
    // 15 << 10 | 0x84 is the largest magnitude, well inside i16
    let magnitude = magnitude as i16;
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// Encode one linear sample into a μ-law code.
pub fn encode_sample(sample: i16) -> u8 {
    let (sign, magnitude) = if sample < 0 {
        (0x80u8, -i32::from(sample))
    } else {
        (0x00u8, i32::from(sample))
    };

    let mut exponent = 0u8;
    let mut scaled = magnitude;
    while scaled > 0x1F && exponent < MULAW_MAX_EXPONENT {
        exponent += 1;
        scaled >>= 1;
    }

    // Saturate instead of wrapping for samples beyond the top segment
    let mantissa = (magnitude >> (exponent + 3)).min(0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

/// Decode μ-law bytes into little-endian 16-bit PCM.
///
/// Total over every byte value; the output is exactly twice as long as the input.
pub fn mulaw_to_pcm(mulaw: &[u8]) -> Vec<u8> {
    let samples: Vec<i16> = mulaw.iter().map(|&code| decode_sample(code)).collect();
    let mut pcm = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(&samples, &mut pcm);

    debug!(input_size = mulaw.len(), output_size = pcm.len(), "Converted μ-law to PCM");
    pcm
}

/// Encode little-endian 16-bit PCM into μ-law bytes.
///
/// ## Errors:
/// - `InvalidInput` when the input is not a whole number of 16-bit samples
pub fn pcm_to_mulaw(pcm: &[u8]) -> Result<Vec<u8>, CodecError> {
    if pcm.len() % 2 != 0 {
        return Err(CodecError::InvalidInput(format!(
            "PCM data must be even length, got {} bytes",
            pcm.len()
        )));
    }

    let mut samples = vec![0i16; pcm.len() / 2];
    LittleEndian::read_i16_into(pcm, &mut samples);
    let mulaw: Vec<u8> = samples.iter().map(|&sample| encode_sample(sample)).collect();

    debug!(input_size = pcm.len(), output_size = mulaw.len(), "Converted PCM to μ-law");
    Ok(mulaw)
}

/// Validate an audio packet.
///
/// Currently an identity transform for non-empty input. This is where format or
/// sample-rate normalization goes once the upstream needs it.
pub fn process_packet(data: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    if data.is_empty() {
        return Err(CodecError::EmptyPacket);
    }

    debug!(size = data.len(), "Processing audio packet");
    Ok(data)
}

/// Applies the client encoding at both edges of a session.
///
/// ## Directions:
/// - **Ingress** (client → upstream): validate, then decode μ-law to PCM if needed
/// - **Egress** (upstream → client): validate, encode PCM to μ-law if needed, then
///   split into frames no larger than `chunk_size`
#[derive(Debug, Clone)]
pub struct AudioProcessor {
    encoding: AudioEncoding,
    chunk_size: usize,
}

impl AudioProcessor {
    pub fn new(encoding: AudioEncoding, chunk_size: usize) -> Self {
        Self { encoding, chunk_size }
    }

    /// Turn one client frame into the bytes sent upstream.
    pub fn ingress(&self, frame: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        let frame = process_packet(frame)?;
        match self.encoding {
            AudioEncoding::Pcm16 => Ok(frame),
            AudioEncoding::Mulaw => Ok(mulaw_to_pcm(&frame)),
        }
    }

    /// Turn one upstream response into the frames written to the client, in order.
    pub fn egress(&self, response: Vec<u8>) -> Result<Vec<Vec<u8>>, CodecError> {
        let response = process_packet(response)?;
        let encoded = match self.encoding {
            AudioEncoding::Pcm16 => response,
            AudioEncoding::Mulaw => pcm_to_mulaw(&response)?,
        };

        if encoded.len() <= self.chunk_size {
            return Ok(vec![encoded]);
        }

        Ok(chunk(&encoded, self.chunk_size)
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect())
    }
}
