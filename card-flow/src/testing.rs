//! Test doubles shared by the unit tests of this crate.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::client::{ClientResponse, CompletionClient};
use crate::error::ClientError;
use crate::request::GenerationRequest;
use crate::transport::Sleeper;

type Handler =
    Box<dyn Fn(&GenerationRequest) -> Result<ClientResponse, ClientError> + Send + Sync>;

/// A completion client driven by a closure, recording every request it sees.
pub(crate) struct MockClient {
    handler: Handler,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl MockClient {
    pub(crate) fn new(
        handler: impl Fn(&GenerationRequest) -> Result<ClientResponse, ClientError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replays `responses` in order, then answers 500 forever.
    pub(crate) fn scripted(responses: Vec<Result<ClientResponse, ClientError>>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |_| {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ClientResponse::status(500, "script exhausted")))
        })
    }

    pub(crate) fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionClient for MockClient {
    async fn complete(
        &self,
        request: &GenerationRequest,
        _timeout: Duration,
    ) -> Result<ClientResponse, ClientError> {
        self.calls.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }
}

/// Records requested waits and returns immediately.
#[derive(Default)]
pub(crate) struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub(crate) fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}
