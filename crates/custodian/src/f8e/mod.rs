//! The server ("f8e") request/response contract.
//!
//! Each endpoint family is a trait with two implementations: [`F8eClient`] speaks JSON over
//! HTTPS, [`F8eFake`] keeps everything in memory for tests.

pub mod accounts;
pub mod auth;
pub mod client;
pub mod error;
pub mod fake;
pub mod keysets;
pub mod recovery;
pub mod socrec;

pub use accounts::{AccountService, CreatedAccount};
pub use auth::{AuthTokenProvider, AuthTokenScope, ChallengeAuthTokenProvider};
pub use client::{F8eClient, F8eHttpClient};
pub use error::{
    CancelDelayNotifyRecoveryErrorCode, ClientErrorCode, CompleteDelayNotifyErrorCode,
    CreateAccountClientErrorCode, F8eError, InitiateAccountDelayNotifyErrorCode,
    NoClientErrorCode, SocRecClientErrorCode,
};
pub use fake::{AuthTokenProviderFake, F8eFake};
pub use keysets::KeysetService;
pub use recovery::{
    completion_challenge, DelayNotifyAuthKeys, PhysicalFactor, RecoveryService, ServerRecovery,
};
pub use socrec::SocRecService;
