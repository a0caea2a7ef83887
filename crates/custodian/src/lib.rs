//! Recovery and key-custody engine for a 2-of-3 (app, hardware, server) multisig Bitcoin wallet.
//!
//! Components, leaves first: key generation and keysets ([`keys`], [`keybox`]), the spending
//! wallet ([`spending`], backed by a [`chain`] data provider), the cloud backup codec
//! ([`cloud_backup`]), social recovery ([`socrec`]), the delay-notify recovery protocol
//! ([`recovery`]) and the post-recovery [`sweep`].
//!
//! External collaborators (server, hardware device, chain data, secure storage) are reached
//! through the traits in [`f8e`], [`hardware`], [`chain`] and [`secure_store`]; each has an
//! in-process fake so the whole pipeline can run in tests.

pub mod chain;
pub mod clock;
pub mod cloud_backup;
pub mod config;
pub mod crypto;
pub mod doctor;
pub mod errors;
pub mod f8e;
pub mod fsutil;
pub mod hardware;
pub mod keybox;
pub mod keys;
pub mod paths;
pub mod recovery;
pub mod retry;
pub mod secure_store;
pub mod socrec;
pub mod spending;
pub mod store;
pub mod sweep;
