//! Stream session controller.
//!
//! A [`StreamSession`] owns the cancel handle, the decoder and the caller's
//! callbacks for one streaming call. Completion fires exactly once on the
//! sentinel; the error callback fires exactly once on a protocol or transport
//! failure; neither fires after an abort or a timeout.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    cancel::CancelHandle,
    decoder::{AssembledMessage, StreamDecoder, StreamEvent},
    errors::{CancelReason, Error, Result, TransportError, TransportErrorKind},
    telemetry::FirstTokenClock,
    transport::{Fragment, FragmentStream},
    vendor_stream::StreamFormat,
};

type EventCallback = Box<dyn FnMut(&StreamEvent) + Send>;
type CompleteCallback = Box<dyn FnOnce(AssembledMessage) + Send>;
type ErrorCallback = Box<dyn FnOnce(Error) + Send>;

/// Caller hooks for a streaming call.
#[derive(Default)]
pub struct StreamCallbacks {
    on_event: Option<EventCallback>,
    on_complete: Option<CompleteCallback>,
    on_error: Option<ErrorCallback>,
}

impl std::fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCallbacks")
            .field("on_event", &self.on_event.as_ref().map(|_| "callback"))
            .field("on_complete", &self.on_complete.as_ref().map(|_| "callback"))
            .field("on_error", &self.on_error.as_ref().map(|_| "callback"))
            .finish()
    }
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for every event in arrival order, terminal events included.
    pub fn on_event(mut self, f: impl FnMut(&StreamEvent) + Send + 'static) -> Self {
        self.on_event = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(AssembledMessage) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// How a session ended.
#[derive(Debug, Clone)]
pub enum StreamOutcome {
    Completed(AssembledMessage),
    Failed(Error),
    Cancelled(CancelReason),
}

impl StreamOutcome {
    pub fn message(&self) -> Option<&AssembledMessage> {
        match self {
            StreamOutcome::Completed(message) => Some(message),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<AssembledMessage> {
        match self {
            StreamOutcome::Completed(message) => Ok(message),
            StreamOutcome::Failed(err) => Err(err),
            StreamOutcome::Cancelled(reason) => Err(Error::Cancelled(reason)),
        }
    }
}

/// State of one streaming call.
pub struct StreamSession {
    id: Uuid,
    cancel: CancelHandle,
    decoder: StreamDecoder,
    callbacks: StreamCallbacks,
    outcome: Option<StreamOutcome>,
    telemetry: Option<FirstTokenClock>,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    pub fn new(callbacks: StreamCallbacks) -> Self {
        Self::with_cancel(CancelHandle::new(), callbacks)
    }

    pub fn with_cancel(cancel: CancelHandle, callbacks: StreamCallbacks) -> Self {
        Self {
            id: Uuid::new_v4(),
            decoder: StreamDecoder::with_cancel(cancel.clone()),
            cancel,
            callbacks,
            outcome: None,
            telemetry: None,
        }
    }

    pub(crate) fn with_format(mut self, format: StreamFormat) -> Self {
        self.decoder = std::mem::take(&mut self.decoder).with_format(format);
        self
    }

    pub(crate) fn with_telemetry(mut self, telemetry: Option<FirstTokenClock>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Stop the session. No callback fires afterwards.
    pub fn abort(&mut self) {
        self.cancel.abort();
        self.settle_cancelled();
    }

    /// Assembled state so far.
    pub fn message(&self) -> &AssembledMessage {
        self.decoder.message()
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&StreamOutcome> {
        self.outcome.as_ref()
    }

    /// Decode one fragment and dispatch the events it completes.
    pub fn feed(&mut self, fragment: impl Into<Fragment>) {
        if self.outcome.is_some() {
            return;
        }
        let Self {
            decoder,
            callbacks,
            outcome,
            telemetry,
            ..
        } = self;
        decoder.feed(fragment, |event| dispatch(callbacks, outcome, telemetry, event));
        self.settle_cancelled();
    }

    /// End of input. Flushes the held-back line and completes if nothing terminated the stream.
    pub fn finish(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        let Self {
            decoder,
            callbacks,
            outcome,
            telemetry,
            ..
        } = self;
        decoder.finish(|event| dispatch(callbacks, outcome, telemetry, event));
        if self.settle_cancelled() || self.outcome.is_some() {
            return;
        }
        let event = StreamEvent::Done {
            message: self.decoder.message().clone(),
        };
        dispatch(
            &mut self.callbacks,
            &mut self.outcome,
            &mut self.telemetry,
            event,
        );
    }

    /// Settle with a failure that did not come from the stream itself.
    pub fn fail(&mut self, err: Error) {
        if self.outcome.is_some() {
            return;
        }
        if let Error::Cancelled(reason) = err {
            self.cancel.trigger(reason);
            self.settle_cancelled();
            return;
        }
        if let Some(t) = self.telemetry.as_mut() {
            t.on_error(&err);
        }
        if let Some(cb) = self.callbacks.on_error.take() {
            cb(err.clone());
        }
        self.outcome = Some(StreamOutcome::Failed(err));
    }

    fn settle_cancelled(&mut self) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        match self.cancel.reason() {
            Some(reason) => {
                if let Some(t) = self.telemetry.as_mut() {
                    t.on_closed();
                }
                self.outcome = Some(StreamOutcome::Cancelled(reason));
                true
            }
            None => false,
        }
    }

    /// Final outcome; an unsettled session counts as cancelled by the user.
    pub fn into_outcome(mut self) -> StreamOutcome {
        self.settle_cancelled();
        self.outcome
            .take()
            .unwrap_or(StreamOutcome::Cancelled(CancelReason::User))
    }

    /// Pump `fragments` into the session until it settles or input ends.
    pub(crate) async fn pump(
        &mut self,
        mut fragments: FragmentStream,
        idle_timeout: Option<Duration>,
    ) -> Result<()> {
        loop {
            let next = match idle_timeout {
                Some(idle) => match tokio::time::timeout(idle, fragments.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        self.cancel.trigger(CancelReason::Timeout);
                        return Err(Error::Cancelled(
                            self.cancel.reason().unwrap_or(CancelReason::Timeout),
                        ));
                    }
                },
                None => fragments.next().await,
            };
            match next {
                Some(Ok(fragment)) => {
                    self.feed(fragment);
                    if self.is_settled() {
                        return Ok(());
                    }
                }
                Some(Err(err)) => return Err(err),
                None => {
                    self.finish();
                    return Ok(());
                }
            }
        }
    }
}

fn dispatch(
    callbacks: &mut StreamCallbacks,
    outcome: &mut Option<StreamOutcome>,
    telemetry: &mut Option<FirstTokenClock>,
    event: StreamEvent,
) {
    if outcome.is_some() {
        return;
    }
    #[cfg(feature = "tracing")]
    tracing::trace!(terminal = event.is_terminal(), "stream event");
    if let Some(t) = telemetry.as_mut() {
        t.on_event(&event);
    }
    if let Some(cb) = callbacks.on_event.as_mut() {
        cb(&event);
    }
    match event {
        StreamEvent::Done { message } => {
            *outcome = Some(StreamOutcome::Completed(message.clone()));
            if let Some(cb) = callbacks.on_complete.take() {
                cb(message);
            }
        }
        StreamEvent::Error { message } => {
            let err = Error::StreamProtocol { message };
            if let Some(t) = telemetry.as_mut() {
                t.on_error(&err);
            }
            *outcome = Some(StreamOutcome::Failed(err.clone()));
            if let Some(cb) = callbacks.on_error.take() {
                cb(err);
            }
        }
        _ => {}
    }
}

/// Handle to a streaming call running on the tokio runtime.
///
/// The cancel handle exists before the network call is issued, so `abort()` works
/// at any point.
#[derive(Debug)]
pub struct StreamTask {
    id: Uuid,
    cancel: CancelHandle,
    join: JoinHandle<StreamOutcome>,
}

impl StreamTask {
    pub(crate) fn new(id: Uuid, cancel: CancelHandle, join: JoinHandle<StreamOutcome>) -> Self {
        Self { id, cancel, join }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn abort(&self) {
        self.cancel.abort();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the session to settle.
    pub async fn wait(self) -> StreamOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) => StreamOutcome::Failed(Error::Transport(TransportError::new(
                TransportErrorKind::Other,
                format!("stream task failed: {err}"),
            ))),
        }
    }
}
