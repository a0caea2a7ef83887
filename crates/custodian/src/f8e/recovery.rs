use super::{
    auth::AuthTokenScope,
    client::{F8eClient, RequestAuth},
    error::{
        CancelDelayNotifyRecoveryErrorCode, CompleteDelayNotifyErrorCode, F8eError,
        InitiateAccountDelayNotifyErrorCode, NoClientErrorCode,
    },
};
use crate::{hardware::HwFactorProofOfPossession, keybox::FullAccountId, keys::AuthPublicKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{de::IgnoredAny, Deserialize, Serialize};
use std::{fmt, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhysicalFactor {
    App,
    Hardware,
}

impl PhysicalFactor {
    pub const fn other(self) -> Self {
        match self {
            Self::App => Self::Hardware,
            Self::Hardware => Self::App,
        }
    }
}

impl fmt::Display for PhysicalFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::App => "app",
            Self::Hardware => "hardware",
        })
    }
}

/// Auth keys the account moves to once the recovery completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayNotifyAuthKeys {
    pub app: AuthPublicKey,
    pub hardware: AuthPublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<AuthPublicKey>,
}

/// The server's record of an in-flight delay-notify recovery. Authoritative over anything the
/// app remembers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecovery {
    pub lost_factor: PhysicalFactor,
    pub delay_start_time: DateTime<Utc>,
    pub delay_end_time: DateTime<Utc>,
    pub auth_keys: DelayNotifyAuthKeys,
}

impl ServerRecovery {
    pub fn delay_elapsed_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.delay_end_time
    }
}

/// The message both new factors sign to complete a recovery.
pub fn completion_challenge(keys: &DelayNotifyAuthKeys) -> String {
    let recovery = keys.recovery.map(|k| k.to_string()).unwrap_or_default();
    format!("CompleteDelayNotify{}{}{recovery}", keys.hardware, keys.app)
}

#[async_trait]
pub trait RecoveryService: Send + Sync + std::fmt::Debug {
    /// `delay_period` is honored for test accounts only.
    async fn initiate(
        &self,
        account_id: &FullAccountId,
        lost_factor: PhysicalFactor,
        auth_keys: &DelayNotifyAuthKeys,
        delay_period: Option<Duration>,
        hw_pop: Option<&HwFactorProofOfPossession>,
    ) -> Result<ServerRecovery, F8eError<InitiateAccountDelayNotifyErrorCode>>;

    async fn cancel(
        &self,
        account_id: &FullAccountId,
        hw_pop: Option<&HwFactorProofOfPossession>,
    ) -> Result<(), F8eError<CancelDelayNotifyRecoveryErrorCode>>;

    async fn status(
        &self,
        account_id: &FullAccountId,
    ) -> Result<Option<ServerRecovery>, F8eError<NoClientErrorCode>>;

    async fn complete(
        &self,
        account_id: &FullAccountId,
        challenge: &str,
        app_signature: &str,
        hardware_signature: &str,
    ) -> Result<(), F8eError<CompleteDelayNotifyErrorCode>>;

    async fn update_delay_for_test_account(
        &self,
        account_id: &FullAccountId,
        delay_period: Duration,
    ) -> Result<ServerRecovery, F8eError<NoClientErrorCode>>;
}

#[derive(Debug, Serialize)]
struct InitiateBody<'a> {
    lost_factor: PhysicalFactor,
    #[serde(skip_serializing_if = "Option::is_none")]
    delay_period_num_sec: Option<u64>,
    auth: &'a DelayNotifyAuthKeys,
}

#[derive(Debug, Deserialize)]
struct PendingRecoveryResponse {
    pending_delay_notify: Option<ServerRecovery>,
}

impl PendingRecoveryResponse {
    fn require<C: super::error::ClientErrorCode>(self) -> Result<ServerRecovery, F8eError<C>> {
        self.pending_delay_notify
            .ok_or_else(|| F8eError::Unhandled("response has no pending recovery".to_owned()))
    }
}

#[derive(Debug, Serialize)]
struct CompleteBody<'a> {
    challenge: &'a str,
    app_signature: &'a str,
    hardware_signature: &'a str,
}

/// Lost-app initiation is authenticated by the new recovery key plus the hardware; lost-hardware
/// by the app's existing global key.
const fn initiate_scope(lost_factor: PhysicalFactor) -> AuthTokenScope {
    match lost_factor {
        PhysicalFactor::App => AuthTokenScope::Recovery,
        PhysicalFactor::Hardware => AuthTokenScope::Global,
    }
}

#[async_trait]
impl RecoveryService for F8eClient {
    async fn initiate(
        &self,
        account_id: &FullAccountId,
        lost_factor: PhysicalFactor,
        auth_keys: &DelayNotifyAuthKeys,
        delay_period: Option<Duration>,
        hw_pop: Option<&HwFactorProofOfPossession>,
    ) -> Result<ServerRecovery, F8eError<InitiateAccountDelayNotifyErrorCode>> {
        let resp: PendingRecoveryResponse = self
            .http
            .send(
                self.tokens.as_ref(),
                Method::POST,
                &format!("/api/accounts/{account_id}/delay-notify"),
                RequestAuth {
                    account_id,
                    scope: initiate_scope(lost_factor),
                    hw_pop,
                },
                Some(&InitiateBody {
                    lost_factor,
                    delay_period_num_sec: delay_period.map(|d| d.as_secs()),
                    auth: auth_keys,
                }),
            )
            .await?;
        resp.require()
    }

    async fn cancel(
        &self,
        account_id: &FullAccountId,
        hw_pop: Option<&HwFactorProofOfPossession>,
    ) -> Result<(), F8eError<CancelDelayNotifyRecoveryErrorCode>> {
        let _: IgnoredAny = self
            .http
            .send::<(), _, _>(
                self.tokens.as_ref(),
                Method::DELETE,
                &format!("/api/accounts/{account_id}/delay-notify"),
                RequestAuth {
                    account_id,
                    scope: AuthTokenScope::Global,
                    hw_pop,
                },
                None,
            )
            .await?;
        Ok(())
    }

    async fn status(
        &self,
        account_id: &FullAccountId,
    ) -> Result<Option<ServerRecovery>, F8eError<NoClientErrorCode>> {
        let resp: PendingRecoveryResponse = self
            .http
            .send::<(), _, _>(
                self.tokens.as_ref(),
                Method::GET,
                &format!("/api/accounts/{account_id}/recovery"),
                RequestAuth {
                    account_id,
                    scope: AuthTokenScope::Recovery,
                    hw_pop: None,
                },
                None,
            )
            .await?;
        Ok(resp.pending_delay_notify)
    }

    async fn complete(
        &self,
        account_id: &FullAccountId,
        challenge: &str,
        app_signature: &str,
        hardware_signature: &str,
    ) -> Result<(), F8eError<CompleteDelayNotifyErrorCode>> {
        let _: IgnoredAny = self
            .http
            .send(
                self.tokens.as_ref(),
                Method::POST,
                &format!("/api/accounts/{account_id}/delay-notify/complete"),
                RequestAuth {
                    account_id,
                    scope: AuthTokenScope::Recovery,
                    hw_pop: None,
                },
                Some(&CompleteBody {
                    challenge,
                    app_signature,
                    hardware_signature,
                }),
            )
            .await?;
        Ok(())
    }

    async fn update_delay_for_test_account(
        &self,
        account_id: &FullAccountId,
        delay_period: Duration,
    ) -> Result<ServerRecovery, F8eError<NoClientErrorCode>> {
        let resp: PendingRecoveryResponse = self
            .http
            .send(
                self.tokens.as_ref(),
                Method::PUT,
                &format!("/api/accounts/{account_id}/delay-notify/test"),
                RequestAuth {
                    account_id,
                    scope: AuthTokenScope::Global,
                    hw_pop: None,
                },
                Some(&serde_json::json!({ "delay_period_num_sec": delay_period.as_secs() })),
            )
            .await?;
        resp.require()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_auth_keypair;

    #[test]
    fn pending_recovery_wire_shape() -> eyre::Result<()> {
        let app = generate_auth_keypair()?.public_key;
        let hw = generate_auth_keypair()?.public_key;
        let body = format!(
            r#"{{"pending_delay_notify":{{"lost_factor":"app","delay_start_time":"2024-01-01T00:00:00Z","delay_end_time":"2024-01-08T00:00:00Z","auth_keys":{{"app":"{app}","hardware":"{hw}"}}}}}}"#
        );
        let parsed: PendingRecoveryResponse = serde_json::from_str(&body)?;
        let rec = parsed
            .pending_delay_notify
            .ok_or_else(|| eyre::eyre!("missing recovery"))?;
        assert_eq!(rec.lost_factor, PhysicalFactor::App);
        assert_eq!(rec.auth_keys.recovery, None);
        assert_eq!((rec.delay_end_time - rec.delay_start_time).num_days(), 7);

        let none: PendingRecoveryResponse = serde_json::from_str(r#"{"pending_delay_notify":null}"#)?;
        assert!(none.pending_delay_notify.is_none());
        Ok(())
    }

    #[test]
    fn challenge_binds_all_destination_keys() -> eyre::Result<()> {
        let keys = DelayNotifyAuthKeys {
            app: generate_auth_keypair()?.public_key,
            hardware: generate_auth_keypair()?.public_key,
            recovery: None,
        };
        let with_recovery = DelayNotifyAuthKeys {
            recovery: Some(generate_auth_keypair()?.public_key),
            ..keys
        };
        assert_ne!(completion_challenge(&keys), completion_challenge(&with_recovery));
        assert!(completion_challenge(&keys).contains(&keys.app.to_string()));
        Ok(())
    }
}
