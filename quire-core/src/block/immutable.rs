use crate::address::Address;
use crate::encoding::hex_bytes;
use crate::error::{QuireError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Content-hashed block: the address is the SHA256 of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImmutableBlock {
    address: Address,
    #[serde(with = "hex_bytes")]
    data: Bytes,
}

impl ImmutableBlock {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            address: Address::hash(&data),
            data,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn validate(&self) -> Result<()> {
        let actual = Address::hash(&self.data);
        if actual != self.address {
            return Err(QuireError::invalid(
                self.address,
                format!("content hash mismatch, computed {}", actual.fmt_short()),
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn tamper(&mut self, data: Bytes) {
        self.data = data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_content_hash() {
        let block = ImmutableBlock::new(Bytes::from_static(b"content"));
        assert_eq!(block.address(), Address::hash(b"content"));
        assert!(block.validate().is_ok());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let mut block = ImmutableBlock::new(Bytes::from_static(b"content"));
        block.tamper(Bytes::from_static(b"c0ntent"));
        assert!(matches!(
            block.validate(),
            Err(QuireError::InvalidBlock { .. })
        ));
    }
}
