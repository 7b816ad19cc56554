use crate::address::Address;
use crate::crypto::{KeyPair, PublicKey, Signature};
use crate::error::{QuireError, Result};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct UserSigned<'a> {
    name: &'a str,
    key: &'a PublicKey,
    reverse: bool,
}

/// Name/key binding for a registered user.
///
/// Each user is stored twice: once addressed by name (forward) and once
/// addressed by key (reverse). Both copies are self-signed by the user key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBlock {
    address: Address,
    name: String,
    key: PublicKey,
    reverse: bool,
    signature: Signature,
}

impl UserBlock {
    pub fn new(name: impl Into<String>, keys: &KeyPair, reverse: bool) -> Result<Self> {
        let name = name.into();
        let key = keys.public();
        let address = if reverse {
            Self::reverse_address(&key)
        } else {
            Self::forward_address(&name)
        };
        let payload = signing_payload(&name, &key, reverse)?;
        Ok(Self {
            address,
            name,
            key,
            reverse,
            signature: keys.sign(&payload),
        })
    }

    pub fn forward_address(name: &str) -> Address {
        Address::hash(format!("user:{}", name).as_bytes())
    }

    pub fn reverse_address(key: &PublicKey) -> Address {
        Address::hash(format!("user-key:{}", key).as_bytes())
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    pub fn validate(&self) -> Result<()> {
        let expected = if self.reverse {
            Self::reverse_address(&self.key)
        } else {
            Self::forward_address(&self.name)
        };
        if expected != self.address {
            return Err(QuireError::invalid(
                self.address,
                "address does not match user binding",
            ));
        }

        let payload = signing_payload(&self.name, &self.key, self.reverse)?;
        if !self.key.verify(&payload, &self.signature) {
            return Err(QuireError::invalid(self.address, "user signature is invalid"));
        }
        Ok(())
    }
}

fn signing_payload(name: &str, key: &PublicKey, reverse: bool) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&UserSigned { name, key, reverse })?)
}
