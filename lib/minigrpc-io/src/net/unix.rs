use std::{
    fs::Permissions,
    io,
    os::unix::fs::{FileTypeExt as _, PermissionsExt as _},
    path::Path,
};

use tracing::trace;

/// Ensures that the given path is ready for use as a Unix domain socket.
///
/// If the path already exists, and is a Unix domain socket, it will be removed. If it is not a Unix domain socket, an
/// error will be returned.
pub(super) async fn ensure_unix_socket_free<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let path = path.as_ref();

    match tokio::fs::metadata(path).await {
        Ok(metadata) => {
            if !metadata.file_type().is_socket() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "path already exists and is not a Unix domain socket",
                ));
            }

            tokio::fs::remove_file(path).await?;

            trace!(
                socket_path = path.to_string_lossy().as_ref(),
                "Cleared stale Unix domain socket."
            );
        }
        Err(err) => {
            // Nothing to clean up.
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err);
            }
        }
    }

    Ok(())
}

/// Sets the Unix domain socket at the given path to be connectable by non-owners.
///
/// Connecting to a stream socket only requires write permission, so non-owners get write access and nothing else.
pub(super) async fn set_unix_socket_connectable<P: AsRef<Path>>(path: P) -> io::Result<()> {
    tokio::fs::set_permissions(path, Permissions::from_mode(0o722)).await
}
