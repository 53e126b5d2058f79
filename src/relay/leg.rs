//! One direction of a session: read, run the pipeline, write

use bytes::{Bytes, BytesMut};
use std::future::Future;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::context::{AbortReason, SessionContext, SessionState};
use super::pipeline::Pipeline;
use crate::error::TransportError;
use crate::plugin::Direction;
use crate::transport::{BoxedReader, BoxedWriter};

/// What one leg achieved before it stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LegReport {
    pub direction: Direction,
    /// Bytes written to the destination
    pub bytes: u64,
    /// The source reached end of stream and the destination was closed
    pub drained: bool,
}

/// Run `fut` unless the session stops first
async fn until_cancelled<F: Future>(session: &SessionContext, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = session.cancelled() => None,
        output = fut => Some(output),
    }
}

pub(crate) async fn run_leg(
    direction: Direction,
    mut reader: BoxedReader,
    writer: BoxedWriter,
    pipeline: &Pipeline,
    session: &SessionContext,
    chunk_size: usize,
) -> LegReport {
    let mut report = LegReport {
        direction,
        bytes: 0,
        drained: false,
    };
    if session.is_terminated() {
        return report;
    }

    let mut writer = Some(writer);
    let mut buf = BytesMut::new();

    if pipeline.is_closed_at_start(session) {
        debug!(%direction, "Direction closed before any data");
        if close_writer(&mut writer, direction, session).await {
            report.drained = discard(direction, &mut reader, &mut buf, session, chunk_size).await;
        }
        return finish(report, session);
    }

    loop {
        buf.resize(chunk_size, 0);
        let read = match until_cancelled(session, reader.read(&mut buf[..])).await {
            Some(read) => read,
            None => return finish(report, session),
        };

        let n = match read {
            Ok(n) => n,
            Err(source) => {
                session.terminate(AbortReason::Transport(TransportError::Io { direction, source }));
                return finish(report, session);
            }
        };

        if n == 0 {
            trace!(%direction, "Source reached end of stream");
            let rest = match until_cancelled(session, pipeline.finish(session)).await {
                Some(Ok(rest)) => rest,
                Some(Err(reason)) => {
                    session.terminate(reason);
                    return finish(report, session);
                }
                None => return finish(report, session),
            };
            if write_all(&mut writer, &rest, direction, session, &mut report).await {
                report.drained = close_writer(&mut writer, direction, session).await;
            }
            return finish(report, session);
        }

        let chunk = buf.split_to(n).freeze();
        trace!(%direction, len = n, "Chunk read");

        let output = match until_cancelled(session, pipeline.push(chunk, session)).await {
            Some(Ok(output)) => output,
            Some(Err(reason)) => {
                session.terminate(reason);
                return finish(report, session);
            }
            None => return finish(report, session),
        };

        if !write_all(&mut writer, &output.chunks, direction, session, &mut report).await {
            return finish(report, session);
        }

        if output.ended {
            if close_writer(&mut writer, direction, session).await {
                report.drained = discard(direction, &mut reader, &mut buf, session, chunk_size).await;
            }
            return finish(report, session);
        }
    }
}

fn finish(report: LegReport, session: &SessionContext) -> LegReport {
    if report.drained {
        session.set_state(SessionState::Draining);
    }
    session.finish_leg(report.direction);
    debug!(
        direction = %report.direction,
        bytes = report.bytes,
        drained = report.drained,
        "Leg finished"
    );
    report
}

/// Returns `false` if the session stopped or the write failed
async fn write_all(
    writer: &mut Option<BoxedWriter>,
    chunks: &[Bytes],
    direction: Direction,
    session: &SessionContext,
    report: &mut LegReport,
) -> bool {
    let Some(w) = writer.as_mut() else {
        return true;
    };
    for chunk in chunks {
        let written = async {
            w.write_all(chunk).await?;
            w.flush().await
        };
        match until_cancelled(session, written).await {
            Some(Ok(())) => report.bytes += chunk.len() as u64,
            Some(Err(source)) => {
                session.terminate(AbortReason::Transport(TransportError::Io { direction, source }));
                return false;
            }
            None => return false,
        }
    }
    true
}

/// Half-close the destination. Returns `false` if the session stopped first.
async fn close_writer(
    writer: &mut Option<BoxedWriter>,
    direction: Direction,
    session: &SessionContext,
) -> bool {
    let Some(mut w) = writer.take() else {
        return true;
    };
    match until_cancelled(session, w.shutdown()).await {
        Some(Ok(())) => true,
        Some(Err(source)) => {
            session.terminate(AbortReason::Transport(TransportError::Io { direction, source }));
            false
        }
        None => false,
    }
}

/// Swallow the rest of the source after its direction was ended by a plugin
async fn discard(
    direction: Direction,
    reader: &mut BoxedReader,
    buf: &mut BytesMut,
    session: &SessionContext,
    chunk_size: usize,
) -> bool {
    let mut dropped = 0u64;
    loop {
        buf.resize(chunk_size, 0);
        match until_cancelled(session, reader.read(&mut buf[..])).await {
            Some(Ok(0)) => {
                if dropped > 0 {
                    debug!(%direction, dropped, "Discarded input after end of direction");
                }
                return true;
            }
            Some(Ok(n)) => dropped += n as u64,
            Some(Err(source)) => {
                session.terminate(AbortReason::Transport(TransportError::Io { direction, source }));
                return false;
            }
            None => return false,
        }
    }
}
