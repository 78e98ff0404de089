// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! §4.D Worker Pool Manager, adapted as a generic, typed pool rather than a
//! dynamically-dispatched "named pool" registry: each of the coordinator's
//! named pools (record workers, Solr update workers, merge workers) is one
//! instance of [`WorkerPool`], parameterized over its own request/result
//! types. A concurrency level of 0 runs every request inline, synchronously,
//! in the caller — useful for tests and small runs.
//!
//! The cancellation flag is a cheaply cloned atomic bool observed between
//! dispatches, in the style of an actor framework's kill switch.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Cancellation handle passed into the coordinator and observed by workers,
/// replacing a global "terminate" flag and signal handler.
#[derive(Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        warn!("cancellation-requested");
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// A handler callable, invoked once per request. Initializers (used to
/// reopen a document-store connection after a fork) are modeled simply as
/// state baked into the handler closure, since this crate uses an async
/// sibling task rather than a forked process for the merged stream.
pub type Handler<Req, Res> = Arc<dyn Fn(Req) -> BoxFuture<Res> + Send + Sync>;

/// A bounded pool of workers draining a request channel and publishing to a
/// result channel.
pub struct WorkerPool<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    request_tx: Option<flume::Sender<Req>>,
    result_rx: flume::Receiver<Res>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    cancellation: Cancellation,
    inline_handler: Option<Handler<Req, Res>>,
    result_tx: flume::Sender<Res>,
}

impl<Req, Res> WorkerPool<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// `concurrency == 0` means every `add_request` call runs the handler
    /// inline before returning.
    pub fn new(
        concurrency: usize,
        queue_capacity: usize,
        handler: Handler<Req, Res>,
        cancellation: Cancellation,
    ) -> Self {
        let (result_tx, result_rx) = flume::unbounded();
        if concurrency == 0 {
            return WorkerPool {
                request_tx: None,
                result_rx,
                handles: Vec::new(),
                cancellation,
                inline_handler: Some(handler),
                result_tx,
            };
        }
        let (request_tx, request_rx) = flume::bounded::<Req>(queue_capacity.max(1));
        let mut handles = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let request_rx = request_rx.clone();
            let result_tx = result_tx.clone();
            let handler = handler.clone();
            let cancellation = cancellation.clone();
            handles.push(tokio::spawn(async move {
                while let Ok(req) = request_rx.recv_async().await {
                    if cancellation.is_cancelled() {
                        break;
                    }
                    let res = handler(req).await;
                    if result_tx.send(res).is_err() {
                        break;
                    }
                }
            }));
        }
        WorkerPool {
            request_tx: Some(request_tx),
            result_rx,
            handles,
            cancellation,
            inline_handler: None,
            result_tx,
        }
    }

    /// Submits a request, blocking if the bounded request queue is full
    /// (backpressure). In inline mode, runs the handler synchronously and
    /// publishes its result immediately.
    pub async fn add_request(&self, req: Req) {
        if let Some(handler) = &self.inline_handler {
            let res = handler(req).await;
            let _ = self.result_tx.send(res);
            return;
        }
        if let Some(tx) = &self.request_tx {
            let _ = tx.send_async(req).await;
        }
    }

    /// Non-blocking: true if a result is ready without consuming it.
    pub fn check_for_results(&self) -> bool {
        !self.result_rx.is_empty()
    }

    pub async fn get_result(&self) -> Option<Res> {
        self.result_rx.recv_async().await.ok()
    }

    pub fn try_get_result(&self) -> Option<Res> {
        self.result_rx.try_recv().ok()
    }

    pub fn requests_pending(&self) -> usize {
        self.request_tx.as_ref().map(|tx| tx.len()).unwrap_or(0)
    }

    /// Closes the request side and waits for all in-flight work to publish
    /// its result, without tearing down the worker tasks.
    pub async fn wait_until_done(&self) {
        while self.requests_pending() > 0 || !self.result_rx.is_empty() {
            tokio::task::yield_now().await;
        }
    }

    /// Cancels in-flight work, signals workers to exit, and joins them.
    pub async fn destroy(mut self) {
        self.cancellation.cancel();
        self.request_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}
