//! Dispatches backfills to a separate notice endpoint over HTTP.

use reqwest::Client;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use url::Url;

use super::{BackfillDispatcher, BackfillRequest, DispatchError, NoticeRequest};

/// Posts each request to a `notice-metaevidence` endpoint without making the
/// caller wait for the response. Outstanding posts can be awaited with
/// [`HttpBackfillDispatcher::join`] on shutdown.
#[derive(Debug, Clone)]
pub struct HttpBackfillDispatcher {
    client: Client,
    url: Url,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl HttpBackfillDispatcher {
    /// The notice endpoint runs the whole scan before answering, so `client`
    /// should not carry a short request timeout.
    pub fn new(client: Client, url: Url) -> Self {
        Self {
            client,
            url,
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Posts not yet answered.
    pub fn pending(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Waits for every outstanding post to finish.
    pub async fn join(&self) {
        let mut tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        while tasks.join_next().await.is_some() {}
    }
}

async fn post_notice(client: Client, url: Url, request: BackfillRequest) {
    let key = request.key();
    let body = NoticeRequest::from(&request);
    match client.post(url).json(&body).send().await {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(
                target: "evidence_resolver::backfill::http",
                key = %key,
                "Backfill notice delivered"
            );
        }
        Ok(response) => {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            tracing::error!(
                target: "evidence_resolver::backfill::http",
                key = %key,
                status = %status,
                body = %text,
                "Failed to invoke backfill endpoint"
            );
        }
        Err(e) => {
            tracing::error!(
                target: "evidence_resolver::backfill::http",
                key = %key,
                error = %e,
                "Failed to invoke backfill endpoint"
            );
        }
    }
}

impl BackfillDispatcher for HttpBackfillDispatcher {
    fn dispatch(&self, request: BackfillRequest) -> Result<(), DispatchError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(
            post_notice(self.client.clone(), self.url.clone(), request),
            &runtime,
        );

        Ok(())
    }
}
