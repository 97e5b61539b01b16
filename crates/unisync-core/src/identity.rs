//! Author identity
//!
//! Every storage root has exactly one author: an Ed25519 signing key that is
//! generated on first use, persisted in the metadata table and never rotated.
//! Entries written locally are signed with it so peers can check provenance.

use crate::error::SyncError;
use crate::storage::Storage;
use crate::types::{AuthorId, Entry, SignedEntry};
use ed25519_dalek::{Signer, SigningKey};

/// The local signing identity.
#[derive(Clone)]
pub struct Author {
    signing_key: SigningKey,
}

impl Author {
    /// Generate a new random author
    pub fn generate() -> Result<Self, SyncError> {
        // Use getrandom directly to avoid rand version conflicts
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| SyncError::Internal(format!("Failed to get random bytes: {}", e)))?;
        Ok(Self::from_bytes(&seed))
    }

    /// Restore an author from its 32-byte secret
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Secret key bytes, for persistence only
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Public author id
    pub fn id(&self) -> AuthorId {
        AuthorId::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign an entry.
    ///
    /// Fails with `InvalidInput` if the entry names a different author.
    pub fn sign(&self, entry: Entry) -> Result<SignedEntry, SyncError> {
        if entry.author != self.id() {
            return Err(SyncError::InvalidInput(format!(
                "Cannot sign entry of author {} as {}",
                entry.author.fmt_short(),
                self.id().fmt_short()
            )));
        }
        let message = entry.signing_bytes()?;
        let signature = self.signing_key.sign(&message);
        Ok(SignedEntry { entry, signature })
    }

    /// Load the author of a storage root, creating and persisting it on first use
    pub fn load_or_create(storage: &Storage) -> Result<Self, SyncError> {
        let secret = storage.load_or_create_secret(Storage::AUTHOR_KEY)?;
        Ok(Self::from_bytes(&secret))
    }
}

impl std::fmt::Debug for Author {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Author")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Hash, NamespaceId};
    use tempfile::TempDir;

    fn entry_for(author: AuthorId) -> Entry {
        Entry::new(
            NamespaceId::from_bytes([9u8; 32]),
            "notes.txt",
            author,
            1_000,
            Hash::new(b"hello"),
            5,
        )
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let author = Author::generate().unwrap();
        let signed = author.sign(entry_for(author.id())).unwrap();
        assert!(signed.verify().is_ok());
    }

    #[test]
    fn test_tampered_entry_fails_verification() {
        let author = Author::generate().unwrap();
        let mut signed = author.sign(entry_for(author.id())).unwrap();
        signed.entry.timestamp += 1;
        assert!(matches!(
            signed.verify(),
            Err(SyncError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_cannot_forge_other_author() {
        let alice = Author::generate().unwrap();
        let mallory = Author::generate().unwrap();

        // Signing on behalf of someone else is refused outright
        assert!(mallory.sign(entry_for(alice.id())).is_err());

        // A signature moved onto another author's entry does not verify
        let mut forged = mallory.sign(entry_for(mallory.id())).unwrap();
        forged.entry.author = alice.id();
        assert!(forged.verify().is_err());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let author = Author::generate().unwrap();
        let restored = Author::from_bytes(&author.to_bytes());
        assert_eq!(author.id(), restored.id());
    }

    #[test]
    fn test_load_or_create_is_idempotent_across_restarts() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");

        let first = {
            let storage = Storage::new(&db_path).unwrap();
            Author::load_or_create(&storage).unwrap().id()
        };

        let storage = Storage::new(&db_path).unwrap();
        let second = Author::load_or_create(&storage).unwrap().id();
        assert_eq!(first, second);
    }
}
