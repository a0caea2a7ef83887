use super::{
    auth::{AuthTokenProvider, AuthTokenScope},
    error::{from_response, ClientErrorCode, F8eError},
};
use crate::{hardware::HwFactorProofOfPossession, keybox::FullAccountId};
use reqwest::{Client, Method, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use std::{sync::Arc, time::Duration};

const HW_POP_HEADER: &str = "Hw-Factor-Proof-Of-Possession";

/// JSON-over-HTTPS transport shared by every server endpoint family.
#[derive(Debug, Clone)]
pub struct F8eHttpClient {
    base_url: String,
    client: Client,
}

/// Who a request is made as.
#[derive(Debug, Clone, Copy)]
pub struct RequestAuth<'a> {
    pub account_id: &'a FullAccountId,
    pub scope: AuthTokenScope,
    pub hw_pop: Option<&'a HwFactorProofOfPossession>,
}

fn map_send_err<C: ClientErrorCode>(e: &reqwest::Error) -> F8eError<C> {
    if e.is_decode() {
        F8eError::Unhandled(e.to_string())
    } else {
        // Timeouts land here too; callers retry them like any connectivity failure.
        F8eError::Networking(e.to_string())
    }
}

impl F8eHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> eyre::Result<Self> {
        use eyre::Context as _;
        crate::config::ensure_https_or_loopback(base_url, "f8e_base_url")?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_owned(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn execute<R: DeserializeOwned, C: ClientErrorCode>(
        &self,
        req: RequestBuilder,
        path: &str,
    ) -> Result<R, F8eError<C>> {
        let resp = req.send().await.map_err(|e| {
            tracing::warn!(path, error = %e, "f8e request failed");
            map_send_err(&e)
        })?;
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<R>()
                .await
                .map_err(|e| F8eError::Unhandled(format!("{path}: {e}")));
        }
        let body = resp.text().await.unwrap_or_default();
        let err = from_response::<C>(status.as_u16(), &body);
        tracing::warn!(path, status = status.as_u16(), error = %err, "f8e rejected request");
        Err(err)
    }

    pub(crate) async fn post_unauthenticated<B, R, C>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, F8eError<C>>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
        C: ClientErrorCode,
    {
        let req = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body);
        self.execute(req, path).await
    }

    /// Authenticated request. `body` is sent as JSON when present.
    pub(crate) async fn send<B, R, C>(
        &self,
        tokens: &dyn AuthTokenProvider,
        method: Method,
        path: &str,
        auth: RequestAuth<'_>,
        body: Option<&B>,
    ) -> Result<R, F8eError<C>>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
        C: ClientErrorCode,
    {
        let token = tokens
            .access_token(auth.account_id, auth.scope)
            .await
            .map_err(F8eError::generalize)?;
        let mut req = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(token);
        if let Some(pop) = auth.hw_pop {
            req = req.header(HW_POP_HEADER, &pop.hw_signed_token);
        }
        if let Some(b) = body {
            req = req.json(b);
        }
        let res = self.execute(req, path).await;
        if matches!(res, Err(F8eError::GeneralClient { status: 401, .. })) {
            tokens.invalidate(auth.account_id, auth.scope).await;
        }
        res
    }
}

/// A server endpoint client: the transport plus whoever mints tokens for it.
#[derive(Debug, Clone)]
pub struct F8eClient {
    pub(crate) http: F8eHttpClient,
    pub(crate) tokens: Arc<dyn AuthTokenProvider>,
}

impl F8eClient {
    pub const fn new(http: F8eHttpClient, tokens: Arc<dyn AuthTokenProvider>) -> Self {
        Self { http, tokens }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_plaintext_remote_servers() {
        assert!(F8eHttpClient::new("http://api.example.com", Duration::from_secs(1)).is_err());
        assert!(F8eHttpClient::new("http://localhost:8080/", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn trims_trailing_slashes() -> eyre::Result<()> {
        let c = F8eHttpClient::new("https://api.example.com/", Duration::from_secs(1))?;
        assert_eq!(c.base_url(), "https://api.example.com");
        Ok(())
    }
}
