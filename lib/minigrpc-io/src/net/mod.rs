//! Network listen addresses, listeners, connections, and protocol demultiplexing.

mod addr;
pub use self::addr::{ConnectionAddress, ListenAddress};

pub mod demux;
pub mod listener;

mod stream;
pub use self::stream::Connection;

#[cfg(unix)]
mod unix;
