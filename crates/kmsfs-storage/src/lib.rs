//! Storage implementations for kmsfs: the decrypting file store, a physical
//! file store and the key services that back them.
//! Local keys use AES-GCM with key material from the OS keyring (or test doubles);
//! remote keys go through the Cloud KMS REST API.

pub mod cloud_kms;
pub mod encrypted;
pub mod key_provider;
pub mod local_kms;
pub mod physical;
pub mod seal;
