use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 160-bit node identifier. Distance between two ids is the XOR metric.
/// Hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 20]);

impl NodeId {
    pub const LEN: usize = 20;

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Derive the stable per-session id from a public key.
    pub fn from_public_key(key_bytes: &[u8]) -> Self {
        let hash = blake3::hash(key_bytes);
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&hash.as_bytes()[..20]);
        Self(arr)
    }

    pub fn random() -> Self {
        let mut arr = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut arr);
        Self(arr)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 20 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// XOR distance to another id. Symmetric; zero iff the ids are equal.
    pub fn xor_distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Index of the k-bucket a node at `distance` belongs to:
    /// ⌊log2(distance)⌋. `None` for distance zero (the local node itself).
    pub fn bucket_index(distance: &Distance) -> Option<usize> {
        for (i, byte) in distance.0.iter().enumerate() {
            if *byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return Some((20 - 1 - i) * 8 + bit);
            }
        }
        None
    }

    /// A random id whose distance from `local` falls inside bucket `index`.
    /// Used to aim refresh lookups at a bucket's address range.
    pub fn random_in_bucket(local: &NodeId, index: usize) -> Self {
        debug_assert!(index < 160);
        let mut distance = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut distance);

        let byte_pos = 20 - 1 - index / 8;
        let bit_pos = index % 8;

        // Force the top set bit of the distance to land exactly at `index`.
        let mask = ((1u16 << (bit_pos + 1)) - 1) as u8;
        distance[byte_pos] = (distance[byte_pos] & mask) | (1 << bit_pos);
        for byte in distance.iter_mut().take(byte_pos) {
            *byte = 0;
        }

        let mut arr = [0u8; 20];
        for (i, byte) in arr.iter_mut().enumerate() {
            *byte = local.0[i] ^ distance[i];
        }
        Self(arr)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// XOR distance between two node ids, ordered as a 160-bit big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; 20]);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

/// 128-bit task identifier, random per submission. Hex-encoded on the
/// wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId([u8; 16]);

impl TaskId {
    pub fn random() -> Self {
        let mut arr = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut arr);
        Self(arr)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 16 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// 128-bit verification identifier. Hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VerificationId([u8; 16]);

impl VerificationId {
    pub fn random() -> Self {
        let mut arr = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut arr);
        Self(arr)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 16 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Serialize for VerificationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for VerificationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Debug for VerificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerificationId({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for VerificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_low_byte(b: u8) -> NodeId {
        let mut arr = [0u8; 20];
        arr[19] = b;
        NodeId::from_bytes(arr)
    }

    #[test]
    fn test_xor_distance_symmetric() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert!(a.xor_distance(&a).is_zero());
    }

    #[test]
    fn test_bucket_index() {
        let zero = id_with_low_byte(0);
        assert_eq!(NodeId::bucket_index(&zero.xor_distance(&zero)), None);
        assert_eq!(
            NodeId::bucket_index(&zero.xor_distance(&id_with_low_byte(1))),
            Some(0)
        );
        assert_eq!(
            NodeId::bucket_index(&zero.xor_distance(&id_with_low_byte(0x80))),
            Some(7)
        );

        let mut high = [0u8; 20];
        high[0] = 0x80;
        let far = NodeId::from_bytes(high);
        assert_eq!(NodeId::bucket_index(&zero.xor_distance(&far)), Some(159));
    }

    #[test]
    fn test_random_in_bucket() {
        let local = NodeId::random();
        for index in [0usize, 3, 17, 80, 159] {
            let target = NodeId::random_in_bucket(&local, index);
            let distance = local.xor_distance(&target);
            assert_eq!(NodeId::bucket_index(&distance), Some(index));
        }
    }

    #[test]
    fn test_hex_round_trip() {
        let id = NodeId::random();
        let hex = id.to_hex();
        assert_eq!(NodeId::from_hex(&hex).unwrap(), id);
        assert!(NodeId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_ids_are_hex_on_the_wire() {
        let id = NodeId::from_bytes([0xAB; 20]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(20)));
        assert_eq!(serde_json::from_str::<NodeId>(&json).unwrap(), id);

        let task = TaskId::random();
        let json = serde_json::to_string(&task).unwrap();
        assert_eq!(serde_json::from_str::<TaskId>(&json).unwrap(), task);

        let verification = VerificationId::random();
        let json = serde_json::to_string(&verification).unwrap();
        assert_eq!(
            serde_json::from_str::<VerificationId>(&json).unwrap(),
            verification
        );
    }

    #[test]
    fn test_derived_id_stable() {
        let key = [7u8; 32];
        assert_eq!(
            NodeId::from_public_key(&key),
            NodeId::from_public_key(&key)
        );
    }
}
