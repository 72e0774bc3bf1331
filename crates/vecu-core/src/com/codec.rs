//! Payload codec.
//!
//! Producers and consumers of a service agree on the wire form through
//! [`Codec`] implementations on the payload types. The canonical 32-bit
//! float event uses the numeric text representation.

/// Serialization of a payload type to and from transport bytes.
pub trait Codec: Sized {
    /// Encode the value to its wire form.
    fn encode(&self) -> Vec<u8>;

    /// Decode a value from its wire form.
    ///
    /// Decoding is total: malformed input maps to a defined default rather
    /// than an error, matching the tolerant handling of event payloads.
    fn decode(bytes: &[u8]) -> Self;
}

impl Codec for f32 {
    fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    fn decode(bytes: &[u8]) -> Self {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0.0)
    }
}

impl Codec for String {
    fn encode(&self) -> Vec<u8> {
        self.clone().into_bytes()
    }

    fn decode(bytes: &[u8]) -> Self {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

impl Codec for () {
    fn encode(&self) -> Vec<u8> {
        Vec::new()
    }

    fn decode(_bytes: &[u8]) -> Self {}
}

impl Codec for u32 {
    fn encode(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Self {
        match <[u8; 4]>::try_from(bytes) {
            Ok(raw) => Self::from_be_bytes(raw),
            Err(_) => 0,
        }
    }
}
