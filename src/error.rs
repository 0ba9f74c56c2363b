use std::io;

/// Errors surfaced by the locks and the RCL server.
///
/// None of these describe a failure of the delegated work itself: a delegate
/// that can fail encodes that in its own return value.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The calling thread's participant node could not be allocated.
    #[error("failed to allocate a {size} byte participant node")]
    NodeAlloc {
        /// Size of the node that could not be allocated.
        size: usize,
    },

    /// The combiner's priority queue could not grow, so the request was
    /// rejected without running.
    #[error("combiner queue could not grow past {capacity} entries")]
    QueueGrowth {
        /// Capacity of the queue at the time growth failed.
        capacity: usize,
    },

    /// Every client slot of the RCL server is taken.
    #[error("server request table is full ({capacity} clients)")]
    ClientsExhausted {
        /// Number of client slots the server was started with.
        capacity: usize,
    },

    /// An RCL server thread could not be spawned.
    #[error("failed to spawn server thread")]
    Spawn(#[source] io::Error),
}

#[cfg(all(not(loom), test))]
mod test {
    use std::error::Error as _;
    use std::io;

    use super::Error;

    #[test]
    fn messages() {
        let err = Error::NodeAlloc { size: 64 };
        assert_eq!(err.to_string(), "failed to allocate a 64 byte participant node");
        let err = Error::QueueGrowth { capacity: 16 };
        assert_eq!(err.to_string(), "combiner queue could not grow past 16 entries");
        let err = Error::ClientsExhausted { capacity: 128 };
        assert_eq!(err.to_string(), "server request table is full (128 clients)");
    }

    #[test]
    fn spawn_keeps_source() {
        let err = Error::Spawn(io::Error::new(io::ErrorKind::Other, "no threads"));
        assert_eq!(err.to_string(), "failed to spawn server thread");
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("no threads"));
    }
}
