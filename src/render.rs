//! Ausgabe-Senken für die Darstellung
//!
//! Der Controller schreibt nur in die Senken, er liest nie daraus.
//! Die Präsentationsschicht abonniert `WatchOutput` und rendert den jeweils
//! gebundenen Stream.

use crate::media::MediaStream;
use std::sync::Arc;
use tokio::sync::watch;

/// Bindbare Ausgabe (lokale Vorschau oder Remote-Video)
pub trait OutputSink: Send + Sync {
    fn bind(&self, stream: Option<MediaStream>);
}

/// Die beiden Ausgaben eines Anruf-Fensters
#[derive(Clone)]
pub struct Renderer {
    pub local: Arc<dyn OutputSink>,
    pub remote: Arc<dyn OutputSink>,
}

impl Renderer {
    pub fn new(local: Arc<dyn OutputSink>, remote: Arc<dyn OutputSink>) -> Self {
        Self { local, remote }
    }
}

/// Ausgabe auf Basis eines `tokio::sync::watch` Kanals
#[derive(Clone)]
pub struct WatchOutput {
    name: &'static str,
    tx: Arc<watch::Sender<Option<MediaStream>>>,
}

impl WatchOutput {
    pub fn new(name: &'static str) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            name,
            tx: Arc::new(tx),
        }
    }

    /// Aktuell gebundener Stream
    pub fn current(&self) -> Option<MediaStream> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<MediaStream>> {
        self.tx.subscribe()
    }
}

impl OutputSink for WatchOutput {
    fn bind(&self, stream: Option<MediaStream>) {
        tracing::debug!(
            "{} output bound to {:?}",
            self.name,
            stream.as_ref().map(|s| s.id())
        );
        self.tx.send_replace(stream);
    }
}

impl std::fmt::Debug for WatchOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchOutput")
            .field("name", &self.name)
            .field("stream", &self.current().map(|s| s.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_notifies_subscribers() {
        let output = WatchOutput::new("remote");
        let mut rx = output.subscribe();
        let stream = MediaStream::empty();

        output.bind(Some(stream.clone()));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref(), Some(&stream));
        assert_eq!(output.current(), Some(stream));

        output.bind(None);
        assert!(output.current().is_none());
    }
}
