//! The [RecordCodec] trait, implemented by consumers for each stored type.

/// A bit-exact serializer for fixed-size records.
///
/// Every value of the stored type encodes into exactly
/// [RecordCodec::encoded_size] bytes, and decoding those bytes reproduces the
/// value field for field. Codecs carry no per-record framing; the stock
/// derives record offsets from the fixed size alone.
pub trait RecordCodec<T>: Send + Sync {
    /// The exact number of bytes every encoded record occupies.
    fn encoded_size(&self) -> usize;

    /// Encodes `value` into `out`, which is exactly
    /// [RecordCodec::encoded_size] bytes long.
    ///
    /// Returns a printable reason when the value cannot be represented in
    /// the record format.
    fn encode(&self, value: &T, out: &mut [u8]) -> Result<(), String>;

    /// Decodes a record from `bytes`, which is exactly
    /// [RecordCodec::encoded_size] bytes long.
    ///
    /// Returns a printable reason when the bytes violate the record format.
    fn decode(&self, bytes: &[u8]) -> Result<T, String>;
}
