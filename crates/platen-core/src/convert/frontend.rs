//! Concurrent conversion front-end.
//!
//! Turns one single-threaded [`AffinityExecutor`] into a thread-safe,
//! cancellable conversion API. Requests are served strictly FIFO; the
//! dedicated thread (and the toolset behind it) is created lazily on the
//! first request and rebuilt after an abort.
//!
//! Cancellation is pipeline-wide, not per-item: the shared engine instance
//! cannot abandon one in-flight native call and keep serving the next, so a
//! fired token resolves its own request as cancelled and tears the whole
//! pipeline down. This is a documented limitation, not an approximation of
//! per-item cancellation.

use std::sync::{Arc, Mutex, Weak};

use crate::document::Document;
use crate::error::{Error, Result};
use crate::execute::{AffinityExecutor, TaskHandle, result_slot};
use crate::toolset::{ConversionEvent, EventSink, Toolset};

use super::converter::ToolsetConverter;
use super::token::CancelToken;

/// Waiter half of one conversion request.
pub type ConversionHandle = TaskHandle<Vec<u8>>;

type Executor<T> = Arc<AffinityExecutor<ToolsetConverter<T>>>;
type Hook = Box<dyn Fn() + Send + Sync>;
type Subscriber = Box<dyn Fn(&ConversionEvent) + Send>;

enum Pipeline<T: Toolset> {
    /// No dedicated thread; the next request creates one.
    Stopped,
    Running(Executor<T>),
    /// Terminally disposed; every submission fails `Closed`.
    Closed,
}

struct FrontendInner<T: Toolset> {
    factory: Box<dyn Fn() -> Result<T> + Send + Sync>,
    /// Runs on the aborting thread while the executor shuts down; destroys
    /// whatever the dedicated thread may be blocked on.
    teardown: Hook,
    /// Runs after a graceful dispose.
    graceful: Hook,
    pipeline: Mutex<Pipeline<T>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl<T: Toolset + 'static> FrontendInner<T> {
    fn executor(self: &Arc<Self>) -> Result<Executor<T>> {
        let mut pipeline = self.pipeline.lock().unwrap();
        match &*pipeline {
            Pipeline::Closed => Err(Error::Closed),
            Pipeline::Running(executor) if !executor.state().is_terminal() => Ok(executor.clone()),
            _ => {
                let executor = Arc::new(self.spawn_executor()?);
                *pipeline = Pipeline::Running(executor.clone());
                Ok(executor)
            }
        }
    }

    fn spawn_executor(self: &Arc<Self>) -> Result<AffinityExecutor<ToolsetConverter<T>>> {
        let weak = Arc::downgrade(self);
        let sink: EventSink = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                for subscriber in inner.subscribers.lock().unwrap().iter() {
                    subscriber(event);
                }
            }
        });

        // The factory runs on the new dedicated thread; a load failure
        // surfaces synchronously from `spawn`.
        let strong = self.clone();
        AffinityExecutor::spawn(move || {
            let mut toolset = (strong.factory)()?;
            toolset.load(None)?;
            Ok(ToolsetConverter::new(toolset, sink))
        })
    }

    fn abort(&self) {
        let executor = {
            let mut pipeline = self.pipeline.lock().unwrap();
            match &*pipeline {
                Pipeline::Running(_) => {
                    let Pipeline::Running(executor) =
                        std::mem::replace(&mut *pipeline, Pipeline::Stopped)
                    else {
                        unreachable!()
                    };
                    Some(executor)
                }
                _ => None,
            }
        };
        if let Some(executor) = executor {
            tracing::info!("aborting conversion pipeline");
            executor.abort(|| (self.teardown)());
        }
    }
}

/// Thread-safe conversion API over one serialized engine pipeline.
pub struct ConversionFrontend<T: Toolset + 'static> {
    inner: Arc<FrontendInner<T>>,
}

impl<T: Toolset + 'static> ConversionFrontend<T> {
    /// Frontend over toolsets built by `factory`. The factory runs on the
    /// pipeline's dedicated thread, once per (re)build.
    pub fn new(factory: impl Fn() -> Result<T> + Send + Sync + 'static) -> Self {
        Self::with_hooks(factory, || {}, || {})
    }

    /// [`new`](Self::new) plus lifecycle hooks: `teardown` runs during an
    /// abort (kill the isolation boundary), `graceful` after a dispose
    /// (unload it).
    pub fn with_hooks(
        factory: impl Fn() -> Result<T> + Send + Sync + 'static,
        teardown: impl Fn() + Send + Sync + 'static,
        graceful: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(FrontendInner {
                factory: Box::new(factory),
                teardown: Box::new(teardown),
                graceful: Box::new(graceful),
                pipeline: Mutex::new(Pipeline::Stopped),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to conversion events. Callbacks run on whichever thread
    /// the engine raises them.
    pub fn on_event(&self, subscriber: impl Fn(&ConversionEvent) + Send + 'static) {
        self.inner.subscribers.lock().unwrap().push(Box::new(subscriber));
    }

    /// Whether a dedicated thread currently exists.
    pub fn is_running(&self) -> bool {
        matches!(&*self.inner.pipeline.lock().unwrap(), Pipeline::Running(e) if !e.state().is_terminal())
    }

    /// Submit a conversion; returns immediately with the request's handle.
    ///
    /// An empty document resolves immediately with empty bytes, without
    /// touching the queue. A token cancelled before the request starts
    /// prevents the engine from ever being invoked for it; a token fired
    /// mid-flight cancels the request *and aborts the pipeline* (see the
    /// module docs).
    pub fn convert_async(
        &self,
        document: &Document,
        token: Option<&CancelToken>,
    ) -> Result<ConversionHandle> {
        if document.is_empty() {
            let (promise, handle) = result_slot();
            promise.complete(Vec::new());
            return Ok(handle);
        }

        let executor = self.inner.executor()?;
        let (promise, handle) = result_slot();

        let job_token = token.cloned();
        if let Some(token) = token {
            if token.is_cancelled() {
                promise.cancel();
                return Ok(handle);
            }
            let cancel_promise = promise.clone();
            let weak = Arc::downgrade(&self.inner);
            token.on_cancel(move || {
                // Resolve first so the waiter never observes the teardown.
                if cancel_promise.cancel()
                    && let Some(inner) = weak.upgrade()
                {
                    inner.abort();
                }
            });
        }

        let document = document.clone();
        executor.submit(promise, move |converter| {
            // A cancellation that fired while we were queued wins without
            // the engine ever seeing the request.
            if job_token.as_ref().is_some_and(|t| t.is_cancelled()) {
                return Err(Error::Cancelled);
            }
            converter.convert(&document)
        })?;
        Ok(handle)
    }

    /// Blocking convenience form of [`convert_async`](Self::convert_async).
    pub fn convert(&self, document: &Document) -> Result<Vec<u8>> {
        self.convert_async(document, None)?.wait()
    }

    /// Abort the pipeline: queued requests fail `Closed`, the in-flight
    /// request (if any) is abandoned, the teardown hook runs, and the
    /// frontend returns to `Stopped` — the next request rebuilds a fresh
    /// executor and toolset.
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Drain queued requests, release the toolset on the dedicated thread,
    /// run the graceful hook, and close terminally: every later submission
    /// fails with [`Error::Closed`].
    pub fn dispose(&self) {
        let executor = {
            let mut pipeline = self.inner.pipeline.lock().unwrap();
            match std::mem::replace(&mut *pipeline, Pipeline::Closed) {
                Pipeline::Running(executor) => Some(executor),
                _ => None,
            }
        };
        if let Some(executor) = executor {
            executor.dispose();
        }
        (self.inner.graceful)();
    }
}

impl<T: Toolset + 'static> Drop for ConversionFrontend<T> {
    fn drop(&mut self) {
        // Only the last handle tears the pipeline down.
        if Arc::strong_count(&self.inner) == 1 {
            self.dispose();
        }
    }
}

impl<T: Toolset + 'static> Clone for ConversionFrontend<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
