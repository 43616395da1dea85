//! Cross-process handle transport: the hex codec for handles passed as
//! arguments, a descriptor-carrying Unix socket, and pidfd translation.

pub mod exchange;
pub mod handle;
pub mod pidfd;
pub mod socket;

pub use exchange::{
    HandleExporter, HandleImporter, PidfdExporter, PidfdImporter, SocketExporter, SocketImporter,
};
pub use handle::{HexCodec, ImportedHandle, SharedHandle, HANDLE_SIZE};
pub use pidfd::{allow_foreign_translation, translate_foreign_descriptor};
pub use socket::{connect_with_retry, Connection, Listener};
