use super::okb::OkbHeader;
use crate::address::Address;
use crate::crypto::{KeyPair, PublicKey, Signature};
use crate::encoding::hex_bytes;
use crate::error::{QuireError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub user: PublicKey,
    pub read: bool,
    pub write: bool,
}

#[derive(Serialize)]
struct AclSigned<'a> {
    block_key: &'a PublicKey,
    data: String,
    version: u64,
    acl_version: u64,
    permissions: &'a [AclEntry],
    editor: &'a PublicKey,
}

// Signed by the owner alone, so a writer cannot grant itself anything.
#[derive(Serialize)]
struct PermissionsSigned<'a> {
    block_key: &'a PublicKey,
    acl_version: u64,
    permissions: &'a [AclEntry],
}

/// Owner-keyed block carrying a permission list.
///
/// Writers listed in the permissions may edit the payload; only the owner
/// may edit the permissions themselves. The list carries its own version
/// and owner signature, checked independently of the payload signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclBlock {
    address: Address,
    header: OkbHeader,
    version: u64,
    #[serde(with = "hex_bytes")]
    data: Bytes,
    // Sorted by user key.
    permissions: Vec<AclEntry>,
    acl_version: u64,
    #[serde(default)]
    acl_signature: Option<Signature>,
    #[serde(default)]
    editor: Option<PublicKey>,
    #[serde(default)]
    signature: Option<Signature>,
}

impl AclBlock {
    pub fn new(owner: &PublicKey) -> Self {
        let header = OkbHeader::new(owner);
        Self {
            address: header.address(),
            header,
            version: 0,
            data: Bytes::new(),
            permissions: Vec::new(),
            acl_version: 0,
            acl_signature: None,
            editor: None,
            signature: None,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn owner(&self) -> &PublicKey {
        self.header.owner_key()
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

    pub fn permissions(&self) -> &[AclEntry] {
        &self.permissions
    }

    pub fn acl_version(&self) -> u64 {
        self.acl_version
    }

    /// Grant or revoke access for `user`; clearing both bits drops the entry.
    pub fn set_permissions(&mut self, user: &PublicKey, read: bool, write: bool) -> Result<()> {
        if user == self.owner() {
            return Err(QuireError::PermissionDenied(
                "owner permissions cannot be changed".to_string(),
            ));
        }

        let entry = AclEntry {
            user: *user,
            read,
            write,
        };
        let position = self.permissions.binary_search_by(|entry| entry.user.cmp(user));
        let changed = match (position, read || write) {
            (Ok(index), true) => {
                let changed = self.permissions[index] != entry;
                self.permissions[index] = entry;
                changed
            }
            (Ok(index), false) => {
                self.permissions.remove(index);
                true
            }
            (Err(index), true) => {
                self.permissions.insert(index, entry);
                true
            }
            (Err(_), false) => false,
        };
        if changed {
            // Needs the owner's signature again.
            self.acl_signature = None;
        }

        tracing::trace!(
            "block {} permissions for {}: read={} write={}",
            self.address.fmt_short(),
            user.fmt_short(),
            read,
            write
        );
        Ok(())
    }

    pub fn can_read(&self, user: &PublicKey) -> bool {
        user == self.owner() || self.entry(user).is_some_and(|entry| entry.read)
    }

    pub fn can_write(&self, user: &PublicKey) -> bool {
        user == self.owner() || self.entry(user).is_some_and(|entry| entry.write)
    }

    fn entry(&self, user: &PublicKey) -> Option<&AclEntry> {
        self.permissions
            .binary_search_by(|entry| entry.user.cmp(user))
            .ok()
            .map(|index| &self.permissions[index])
    }

    pub fn seal(&mut self, keys: &KeyPair) -> Result<()> {
        let editor = keys.public();
        let permissions_signed = self.acl_signature.is_some();
        if !permissions_signed && editor != *self.owner() {
            return Err(QuireError::PermissionDenied(format!(
                "only the owner can change permissions of block {}",
                self.address.fmt_short()
            )));
        }
        if !self.can_write(&editor) {
            return Err(QuireError::PermissionDenied(format!(
                "{} cannot write block {}",
                editor.fmt_short(),
                self.address.fmt_short()
            )));
        }

        if !permissions_signed {
            self.acl_version += 1;
            let permissions = self.permissions_payload()?;
            self.acl_signature = Some(keys.sign(&permissions));
        }
        self.version += 1;
        self.editor = Some(editor);
        let payload = self.signing_payload(&editor)?;
        self.signature = Some(keys.sign(&payload));
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.header.validate(&self.address)?;

        let (Some(editor), Some(signature)) = (self.editor.as_ref(), self.signature.as_ref())
        else {
            return Err(QuireError::invalid(self.address, "block is not sealed"));
        };

        let Some(acl_signature) = self.acl_signature.as_ref() else {
            return Err(QuireError::invalid(self.address, "permissions are not signed"));
        };
        if !self.owner().verify(&self.permissions_payload()?, acl_signature) {
            return Err(QuireError::invalid(
                self.address,
                "permissions are not signed by the owner",
            ));
        }

        if !self.can_write(editor) {
            return Err(QuireError::invalid(
                self.address,
                format!("editor {} has no write permission", editor.fmt_short()),
            ));
        }

        let payload = self.signing_payload(editor)?;
        if !editor.verify(&payload, signature) {
            return Err(QuireError::invalid(self.address, "payload signature is invalid"));
        }

        Ok(())
    }

    pub fn validate_against(&self, previous: &AclBlock) -> Result<()> {
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
        if self.acl_version < previous.acl_version {
            return Err(QuireError::invalid(
                self.address,
                format!(
                    "permissions version {} is older than stored version {}",
                    self.acl_version, previous.acl_version
                ),
            ));
        }
        if self.permissions != previous.permissions {
            if self.editor.as_ref() != Some(self.owner()) {
                return Err(QuireError::invalid(
                    self.address,
                    "permissions changed by a non-owner",
                ));
            }
            if self.acl_version == previous.acl_version {
                return Err(QuireError::invalid(
                    self.address,
                    "permissions changed without a new permissions version",
                ));
            }
        }
        // A writer must still have been a writer in the version it replaces.
        if let Some(editor) = self.editor.as_ref() {
            if !previous.can_write(editor) {
                return Err(QuireError::invalid(
                    self.address,
                    format!("editor {} had no write permission", editor.fmt_short()),
                ));
            }
        }
        Ok(())
    }

    fn signing_payload(&self, editor: &PublicKey) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&AclSigned {
            block_key: self.header.key(),
            data: hex::encode(&self.data),
            version: self.version,
            acl_version: self.acl_version,
            permissions: &self.permissions,
            editor,
        })?)
    }

    fn permissions_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&PermissionsSigned {
            block_key: self.header.key(),
            acl_version: self.acl_version,
            permissions: &self.permissions,
        })?)
    }
}
