// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Control socket server.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use xpg_core::Decref;
use xpg_ipc::{framing, ControlRequest, ControlResponse};

use crate::supervisor::Supervisor;

/// Accept control connections until the task is aborted.
pub async fn serve(supervisor: Supervisor, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(supervisor.clone(), stream));
            }
            Err(e) => {
                warn!(error = %e, "failed to accept control connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Answer requests on one connection until the client hangs up.
///
/// A Decref that releases the last reference hands the connection to a
/// post-shutdown hook, so the client's reply means shutdown is complete.
pub async fn handle_connection(supervisor: Supervisor, mut stream: UnixStream) {
    loop {
        let request = match framing::read_message::<_, ControlRequest>(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to read control request");
                return;
            }
        };
        debug!(?request, "control request");

        let response = match request {
            ControlRequest::Incref => match supervisor.incref() {
                Some(count) => {
                    debug!(count, "client attached");
                    ControlResponse::Ok
                }
                None => ControlResponse::Error {
                    message: "supervisor is shutting down".to_string(),
                },
            },
            ControlRequest::Restart => match supervisor.reload_engine() {
                Ok(()) => ControlResponse::Ok,
                Err(message) => ControlResponse::Error { message },
            },
            ControlRequest::Decref => match supervisor.decref() {
                Decref::Remaining(count) => {
                    debug!(count, "client detached");
                    ControlResponse::Ok
                }
                Decref::ReachedZero | Decref::AlreadyZero => {
                    debug!("last client detached");
                    supervisor.after_shutdown(Box::pin(reply_stopped(stream)));
                    return;
                }
            },
        };

        if let Err(e) = framing::write_message(&mut stream, &response).await {
            debug!(error = %e, "failed to write control response");
            return;
        }
    }
}

async fn reply_stopped(mut stream: UnixStream) {
    if let Err(e) = framing::write_message(&mut stream, &ControlResponse::Stopped).await {
        debug!(error = %e, "client left before shutdown completed");
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
