use futures_util::stream::{self, Stream};
use tokio::sync::mpsc;

use super::registry::RunToken;
use crate::pipeline::orchestrator::ProgressEvent;

/// Events of one run, ending with its terminal event.
pub struct EventStream {
    token: RunToken,
    rx: mpsc::Receiver<ProgressEvent>,
}

impl EventStream {
    pub(crate) fn new(token: RunToken, rx: mpsc::Receiver<ProgressEvent>) -> Self {
        Self { token, rx }
    }

    pub fn token(&self) -> &RunToken {
        &self.token
    }

    /// Next event, or `None` once the terminal event has been delivered.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Drain the stream, returning every remaining event.
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        stream::unfold(self.rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event, rx))
        })
    }
}
