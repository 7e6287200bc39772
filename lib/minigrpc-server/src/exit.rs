//! Classification of serving-loop exits.
//!
//! Stopping the server closes its listener and tears down connections on purpose, and each of those shows up as an
//! error somewhere in the serving loops. Only exits that were not caused by the server stopping itself are reported
//! to the caller.
use std::io;

use minigrpc_error::{any_in_chain, GenericError};
use minigrpc_io::net::demux::DemuxError;

const CLOSED_CONNECTION_MESSAGES: &[&str] = &[
    "use of closed network connection",
    "listener closed",
    "server closed",
];

/// Returns `true` if the given serving-loop exit is a normal consequence of stopping the server.
///
/// A clean exit (`None`) is always graceful. Otherwise, the error chain is searched for a closed listener, a cancelled
/// task, or a connection that was torn down underneath the server.
pub fn is_graceful_exit(error: Option<&GenericError>) -> bool {
    match error {
        None => true,
        Some(error) => any_in_chain(error, is_closed_connection_error),
    }
}

fn is_closed_connection_error(error: &(dyn std::error::Error + 'static)) -> bool {
    if let Some(DemuxError::Closed) = error.downcast_ref::<DemuxError>() {
        return true;
    }

    if let Some(join_error) = error.downcast_ref::<tokio::task::JoinError>() {
        return join_error.is_cancelled();
    }

    if let Some(io_error) = error.downcast_ref::<io::Error>() {
        if matches!(
            io_error.kind(),
            io::ErrorKind::NotConnected | io::ErrorKind::ConnectionAborted
        ) {
            return true;
        }
    }

    let message = error.to_string();
    CLOSED_CONNECTION_MESSAGES
        .iter()
        .any(|needle| message.contains(needle))
}

#[cfg(test)]
mod tests {
    use minigrpc_error::{generic_error, ErrorContext as _};

    use super::*;

    #[test]
    fn clean_exit_is_graceful() {
        assert!(is_graceful_exit(None));
    }

    #[test]
    fn closed_listener_is_graceful() {
        let error = GenericError::from(DemuxError::Closed);
        assert!(is_graceful_exit(Some(&error)));

        let wrapped: Result<(), DemuxError> = Err(DemuxError::Closed);
        let error = wrapped.error_context("demultiplexer stopped").unwrap_err();
        assert!(is_graceful_exit(Some(&error)));
    }

    #[test]
    fn closed_connection_messages_are_graceful() {
        let error = generic_error!("accept tcp [::]:9003: use of closed network connection");
        assert!(is_graceful_exit(Some(&error)));

        let error = generic_error!("http: server closed");
        assert!(is_graceful_exit(Some(&error)));
    }

    #[test]
    fn torn_down_connections_are_graceful() {
        let error = GenericError::from(io::Error::new(io::ErrorKind::ConnectionAborted, "connection severed"));
        assert!(is_graceful_exit(Some(&error)));

        let error = GenericError::from(io::Error::from(io::ErrorKind::NotConnected));
        assert!(is_graceful_exit(Some(&error)));
    }

    #[tokio::test]
    async fn cancelled_task_is_graceful() {
        let task = tokio::spawn(std::future::pending::<()>());
        task.abort();
        let join_error = task.await.unwrap_err();

        assert!(is_graceful_exit(Some(&GenericError::from(join_error))));
    }

    #[tokio::test]
    async fn panicked_task_is_not_graceful() {
        let task = tokio::spawn(async { panic!("handler blew up") });
        let join_error = task.await.unwrap_err();

        assert!(!is_graceful_exit(Some(&GenericError::from(join_error))));
    }

    #[test]
    fn other_errors_are_not_graceful() {
        let error = GenericError::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!is_graceful_exit(Some(&error)));

        let error = generic_error!("failed to accept connection: too many open files");
        assert!(!is_graceful_exit(Some(&error)));
    }
}
