//! Wire encoding. A transfer frame is the bincode-encoded [`TransferKey`] followed
//! by the raw tile bytes; nothing else is needed since both endpoints already
//! agree on the key and its size.

use crate::error::Result;
use crate::types::TransferKey;

/// Serializes data to a byte array.
pub fn serialize<S>(value: &S) -> Result<Vec<u8>>
where
    S: serde::Serialize,
{
    Ok(bincode::serialize(value)?)
}

/// Deserializes data from a byte array.
pub fn deserialize<D>(data: &[u8]) -> Result<D>
where
    D: serde::de::DeserializeOwned,
{
    Ok(bincode::deserialize(data)?)
}

/// Deserializes data from a reader.
fn deserialize_from<R, D>(reader: R) -> Result<D>
where
    R: std::io::Read,
    D: serde::de::DeserializeOwned,
{
    Ok(bincode::deserialize_from(reader)?)
}

/// Builds a transfer frame.
pub fn encode_frame(key: TransferKey, payload: &[u8]) -> Result<Vec<u8>> {
    let header_size = bincode::serialized_size(&key)? as usize;
    let mut frame = Vec::with_capacity(header_size + payload.len());
    bincode::serialize_into(&mut frame, &key)?;
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Splits a transfer frame into its key and payload.
pub fn decode_frame(frame: &[u8]) -> Result<(TransferKey, &[u8])> {
    let mut reader = frame;
    let key = deserialize_from(&mut reader)?;
    Ok((key, reader))
}
