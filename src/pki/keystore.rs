//! Password-protected key material store.
//!
//! Entries are kept by alias and written out as a PKCS#12 archive, the
//! format OpenUnison opens as its `unisonKeyStore`. Key pairs carry their
//! certificate chain, trust anchors are plain certificate bags and secret
//! keys are AES-256 secret bags.

use std::fmt;

use p12_keystore::secret::{Secret, SecretKeyType};
use p12_keystore::{Certificate as P12Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
use tracing::info;

use super::{certificate_der, Certificate};
use crate::error::Error;

pub struct KeyMaterialStore {
    password: String,
    store: KeyStore,
    required: Vec<&'static str>,
}

impl fmt::Debug for KeyMaterialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterialStore")
            .field("aliases", &self.aliases())
            .finish()
    }
}

fn p12_certificate(alias: &str, certificate_pem: &str) -> Result<P12Certificate, Error> {
    let der = certificate_der(certificate_pem)
        .map_err(|e| Error::key_store(format!("certificate {}: {}", alias, e)))?;
    P12Certificate::from_der(&der)
        .map_err(|e| Error::key_store(format!("certificate {}: {}", alias, e)))
}

impl KeyMaterialStore {
    pub fn new(password: impl Into<String>) -> KeyMaterialStore {
        KeyMaterialStore {
            password: password.into(),
            store: KeyStore::new(),
            required: Vec::new(),
        }
    }

    /// Aliases that must be present before the store can be serialized.
    pub fn requiring(mut self, aliases: &[&'static str]) -> KeyMaterialStore {
        self.required = aliases.to_vec();
        self
    }

    /// Stores the certificate chain and its private key. An existing alias is overwritten.
    pub fn store_certificate(
        &mut self,
        alias: &str,
        certificate: &Certificate,
    ) -> Result<(), Error> {
        let key = pem::parse(certificate.private_key_pem())
            .map_err(|e| Error::key_store(format!("private key {}: {}", alias, e)))?;
        let chain = certificate
            .chain()
            .iter()
            .map(|c| p12_certificate(alias, c))
            .collect::<Result<Vec<_>, Error>>()?;

        info!(alias, signed = certificate.is_signed(), "Storing key pair");
        self.store.add_entry(
            alias,
            KeyStoreEntry::PrivateKeyChain(PrivateKeyChain::new(
                key.contents(),
                alias.as_bytes(),
                chain,
            )),
        );
        Ok(())
    }

    /// Allocates a fresh random AES-256 secret key under `alias`.
    pub fn allocate_secret_key(&mut self, alias: &str) -> Result<(), Error> {
        let secret = Secret::builder(SecretKeyType::AES256Cbc)
            .with_local_key_id(alias.as_bytes().to_vec())
            .build()
            .map_err(|e| Error::key_store(format!("secret key {}: {:?}", alias, e)))?;
        info!(alias, "Allocating secret key");
        self.store.add_entry(alias, KeyStoreEntry::Secret(secret));
        Ok(())
    }

    /// Imports a certificate with no private key, e.g. a trust anchor.
    pub fn import_trusted_certificate(
        &mut self,
        alias: &str,
        certificate_pem: &str,
    ) -> Result<(), Error> {
        let certificate = p12_certificate(alias, certificate_pem)?;
        info!(alias, "Importing trusted certificate");
        self.store.add_entry(alias, KeyStoreEntry::Certificate(certificate));
        Ok(())
    }

    pub fn aliases(&self) -> Vec<&str> {
        self.store.entries().map(|(a, _)| a.as_str()).collect()
    }

    pub fn require_aliases(&self, aliases: &[&str]) -> Result<(), Error> {
        let missing: Vec<&str> = aliases
            .iter()
            .copied()
            .filter(|a| self.store.entry(a).is_none())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::key_store(format!(
                "missing required aliases: {}",
                missing.join(", ")
            )))
        }
    }

    /// PKCS#12 bytes of the store, sealed with the store password.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        self.require_aliases(&self.required)?;
        self.store
            .writer(&self.password)
            .write()
            .map_err(|e| Error::key_store(format!("unable to write PKCS#12 store: {}", e)))
    }

    #[cfg(test)]
    pub fn get(&self, alias: &str) -> Option<&KeyStoreEntry> {
        self.store.entry(alias)
    }

    #[cfg(test)]
    pub fn load(data: &[u8], password: &str) -> Result<KeyMaterialStore, Error> {
        let store = KeyStore::from_pkcs12(data, password)
            .map_err(|e| Error::key_store(format!("unable to read PKCS#12 store: {}", e)))?;
        Ok(KeyMaterialStore {
            password: password.to_string(),
            store,
            required: Vec::new(),
        })
    }
}
