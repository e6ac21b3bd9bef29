//! Shared application state threaded through the axum `Router`, replacing the
//! teacher's `AppState { db, ws_state }` with a single handle onto the
//! composition root. Generic over the upstream source and store so tests can
//! substitute `StubQuoteSource`/`InMemoryQuoteStore` for the production
//! `HttpQuoteSource`/`RedisQuoteStore` pairing used by `main`.

use std::sync::Arc;

use crate::engine::Engine;
use crate::store::{QuoteStore, RedisQuoteStore};
use crate::upstream::{HttpQuoteSource, QuoteSource};

pub type AppEngine = Engine<HttpQuoteSource, RedisQuoteStore>;

pub struct AppState<S: QuoteSource, Q: QuoteStore> {
    pub engine: Arc<Engine<S, Q>>,
}

impl<S: QuoteSource, Q: QuoteStore> Clone for AppState<S, Q> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<S: QuoteSource, Q: QuoteStore> AppState<S, Q> {
    pub fn new(engine: Arc<Engine<S, Q>>) -> Self {
        Self { engine }
    }
}
