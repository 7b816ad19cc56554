use crate::address::Address;
use crate::crypto::{KeyPair, PublicKey, Signature};
use crate::encoding::hex_bytes;
use crate::error::{QuireError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Binds a mutable block address to its owner.
///
/// A throwaway block key is generated per block; the address is the hash of
/// that key and the key signs the owner's public key once, at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkbHeader {
    key: PublicKey,
    owner_key: PublicKey,
    owner_signature: Signature,
}

impl OkbHeader {
    pub fn new(owner: &PublicKey) -> Self {
        let block_keys = KeyPair::generate();
        Self {
            key: block_keys.public(),
            owner_key: *owner,
            owner_signature: block_keys.sign(owner.as_bytes()),
        }
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    pub fn owner_key(&self) -> &PublicKey {
        &self.owner_key
    }

    pub fn address(&self) -> Address {
        self.key.address()
    }

    pub fn validate(&self, address: &Address) -> Result<()> {
        let expected = self.address();
        if *address != expected {
            return Err(QuireError::invalid(
                *address,
                format!("address does not match block key, expected {}", expected.fmt_short()),
            ));
        }

        if !self
            .key
            .verify(self.owner_key.as_bytes(), &self.owner_signature)
        {
            return Err(QuireError::invalid(*address, "owner signature is invalid"));
        }

        Ok(())
    }
}

#[derive(Serialize)]
struct OkbSigned<'a> {
    block_key: &'a PublicKey,
    data: String,
    version: u64,
}

/// Owner-keyed mutable block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerKeyedBlock {
    address: Address,
    header: OkbHeader,
    version: u64,
    #[serde(with = "hex_bytes")]
    data: Bytes,
    #[serde(default)]
    signature: Option<Signature>,
}

impl OwnerKeyedBlock {
    pub fn new(owner: &PublicKey) -> Self {
        let header = OkbHeader::new(owner);
        Self {
            address: header.address(),
            header,
            version: 0,
            data: Bytes::new(),
            signature: None,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn header(&self) -> &OkbHeader {
        &self.header
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn set_data(&mut self, data: impl Into<Bytes>) {
        self.data = data.into();
    }

    /// Bump the version and sign the payload with the owner's key.
    pub fn seal(&mut self, keys: &KeyPair) -> Result<()> {
        if keys.public() != self.header.owner_key {
            return Err(QuireError::PermissionDenied(format!(
                "{} is not the owner of block {}",
                keys.public().fmt_short(),
                self.address.fmt_short()
            )));
        }

        self.version += 1;
        let payload = self.signing_payload()?;
        self.signature = Some(keys.sign(&payload));
        tracing::trace!("sealed block {} at version {}", self.address, self.version);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.header.validate(&self.address)?;

        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| QuireError::invalid(self.address, "block is not sealed"))?;

        let payload = self.signing_payload()?;
        if !self.header.owner_key.verify(&payload, signature) {
            return Err(QuireError::invalid(self.address, "payload signature is invalid"));
        }

        Ok(())
    }

    pub fn validate_against(&self, previous: &OwnerKeyedBlock) -> Result<()> {
        self.validate()?;
        if self.header != previous.header {
            return Err(QuireError::invalid(
                self.address,
                "block key or owner differs from stored version",
            ));
        }
        if self.version <= previous.version {
            return Err(QuireError::invalid(
                self.address,
                format!(
                    "version {} is not newer than stored version {}",
                    self.version, previous.version
                ),
            ));
        }
        Ok(())
    }

    fn signing_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&OkbSigned {
            block_key: &self.header.key,
            data: hex::encode(&self.data),
            version: self.version,
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(keys: &KeyPair, data: &'static [u8]) -> OwnerKeyedBlock {
        let mut block = OwnerKeyedBlock::new(&keys.public());
        block.set_data(Bytes::from_static(data));
        block.seal(keys).unwrap();
        block
    }

    #[test]
    fn test_seal_bumps_version_and_validates() {
        let keys = KeyPair::generate();
        let mut block = sealed(&keys, b"first");
        assert_eq!(block.version(), 1);
        assert!(block.validate().is_ok());

        block.seal(&keys).unwrap();
        assert_eq!(block.version(), 2);
        assert!(block.validate().is_ok());
    }

    #[test]
    fn test_unsealed_block_is_invalid() {
        let keys = KeyPair::generate();
        let block = OwnerKeyedBlock::new(&keys.public());
        assert!(block.validate().is_err());
    }

    #[test]
    fn test_any_payload_byte_flip_is_detected() {
        let keys = KeyPair::generate();
        let block = sealed(&keys, b"payload");
        for index in 0..block.data().len() {
            let mut bytes = block.data().to_vec();
            bytes[index] ^= 0x01;
            let mut tampered = block.clone();
            tampered.data = Bytes::from(bytes);
            assert!(tampered.validate().is_err(), "flip at {} not detected", index);
        }
    }

    #[test]
    fn test_address_rebinding_is_detected() {
        let keys = KeyPair::generate();
        let mut block = sealed(&keys, b"payload");
        block.address = Address::random();
        assert!(block.validate().is_err());
    }

    #[test]
    fn test_only_owner_can_seal() {
        let owner = KeyPair::generate();
        let intruder = KeyPair::generate();
        let mut block = OwnerKeyedBlock::new(&owner.public());
        assert!(matches!(
            block.seal(&intruder),
            Err(QuireError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_validate_against_requires_newer_version() {
        let keys = KeyPair::generate();
        let older = sealed(&keys, b"v1");
        let mut newer = older.clone();
        newer.set_data(Bytes::from_static(b"v2"));
        newer.seal(&keys).unwrap();

        assert!(newer.validate_against(&older).is_ok());
        assert!(older.validate_against(&newer).is_err());
        assert!(newer.validate_against(&newer).is_err());
    }
}
