//! In-memory transport for driving workers and the manager in unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::transport::{Transport, TransportError, TransportResponse};

pub(crate) type Feed = mpsc::UnboundedSender<Result<Vec<u8>, String>>;

enum Route {
    Script {
        status: u16,
        content_length: Option<u64>,
        items: Vec<Result<Bytes, String>>,
    },
    Gated {
        content_length: Option<u64>,
        rx: mpsc::UnboundedReceiver<Result<Vec<u8>, String>>,
    },
    Panic,
    Stall(Duration),
}

/// Each route answers one `open`; unknown sources fail at setup.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<HashMap<String, Route>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn route(self, source: &str, route: Route) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(source.to_string(), route);
        self
    }

    fn script(chunks: &[&[u8]]) -> Vec<Result<Bytes, String>> {
        chunks.iter().map(|c| Ok(Bytes::copy_from_slice(c))).collect()
    }

    fn sum(chunks: &[&[u8]]) -> u64 {
        chunks.iter().map(|c| c.len() as u64).sum()
    }

    pub(crate) fn serve(self, source: &str, status: u16, chunks: &[&[u8]]) -> Self {
        let route = Route::Script {
            status,
            content_length: Some(Self::sum(chunks)),
            items: Self::script(chunks),
        };
        self.route(source, route)
    }

    pub(crate) fn serve_sized(
        self,
        source: &str,
        content_length: Option<u64>,
        chunks: &[&[u8]],
    ) -> Self {
        let route = Route::Script {
            status: 200,
            content_length,
            items: Self::script(chunks),
        };
        self.route(source, route)
    }

    pub(crate) fn serve_unsized(self, source: &str, chunks: &[&[u8]]) -> Self {
        self.serve_sized(source, None, chunks)
    }

    pub(crate) fn serve_then_fail(
        self,
        source: &str,
        content_length: Option<u64>,
        chunks: &[&[u8]],
        error: &str,
    ) -> Self {
        let mut items = Self::script(chunks);
        items.push(Err(error.to_string()));
        let route = Route::Script {
            status: 200,
            content_length,
            items,
        };
        self.route(source, route)
    }

    /// Body chunks are released one by one through the returned feed.
    /// Dropping the feed ends the stream.
    pub(crate) fn gated(self, source: &str, content_length: Option<u64>) -> (Self, Feed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.route(source, Route::Gated { content_length, rx }), tx)
    }

    /// Opening this source panics inside the worker task.
    pub(crate) fn panic_on_open(self, source: &str) -> Self {
        self.route(source, Route::Panic)
    }

    /// Opening this source holds the worker's thread for `hold`, so the
    /// worker cannot answer anything until it returns. The source then
    /// fails at setup. Needs the multi-thread runtime.
    pub(crate) fn stall_on_open(self, source: &str, hold: Duration) -> Self {
        self.route(source, Route::Stall(hold))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, source: &str) -> Result<TransportResponse, TransportError> {
        let route = self.routes.lock().unwrap().remove(source);
        match route {
            None => Err(TransportError::Other(format!("no route to {source}"))),
            Some(Route::Panic) => panic!("scripted transport panic for {source}"),
            Some(Route::Stall(hold)) => {
                tokio::task::block_in_place(|| std::thread::sleep(hold));
                Err(TransportError::Other(format!("{source} stalled")))
            }
            Some(Route::Script {
                status,
                content_length,
                items,
            }) => Ok(TransportResponse {
                status,
                content_length,
                body: stream::iter(items.into_iter().map(|item| item.map_err(TransportError::Other)))
                    .boxed(),
            }),
            Some(Route::Gated { content_length, rx }) => {
                let body = stream::unfold(rx, |mut rx| async move {
                    let item = rx.recv().await?;
                    Some((item.map(Bytes::from).map_err(TransportError::Other), rx))
                })
                .boxed();
                Ok(TransportResponse {
                    status: 200,
                    content_length,
                    body,
                })
            }
        }
    }
}
